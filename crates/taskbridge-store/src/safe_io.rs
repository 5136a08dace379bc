//! Safe-I/O substrate: atomic replace, advisory file locks, bounded JSON
//! loads and run-id coordination.
//!
//! Every persisted artifact goes through these primitives so that readers
//! never observe a half-written file and two processes sharing a state
//! directory can detect each other.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Default on-disk size cap for JSON loads.
pub const DEFAULT_JSON_SIZE_CAP: u64 = 100 * 1024 * 1024;

/// Poll interval while waiting for a lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum SafeIoError {
    #[error("timed out after {timeout:?} acquiring lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization failed for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> SafeIoError {
    SafeIoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Generates the short per-invocation token stamped into every artifact.
pub fn generate_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(name)
}

/// Writes `content` to `<path>.tmp.<pid>`, flushes, and renames over
/// `path`. The temp file is removed on every failure path.
pub fn atomic_write_text(path: &Path, content: &str) -> Result<(), SafeIoError> {
    let tmp = tmp_path(path);
    let cleanup = scopeguard::guard(tmp.clone(), |p| {
        let _ = fs::remove_file(&p);
    });
    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    // Renamed into place; nothing left to clean up.
    let _ = scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

/// Serializes `value` as pretty JSON and replaces `path` atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SafeIoError> {
    let mut text = serde_json::to_string_pretty(value).map_err(|e| SafeIoError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    text.push('\n');
    atomic_write_text(path, &text)
}

/// Loads JSON from `path`, returning `default` on any failure.
///
/// Files larger than `size_cap` are rejected by on-disk size before being
/// read. Parse and I/O failures are logged and swallowed; this loader is
/// for artifacts the pipeline can rebuild.
pub fn safe_load_json<T: DeserializeOwned>(path: &Path, default: T, size_cap: u64) -> T {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return default,
    };
    if meta.len() > size_cap {
        tracing::warn!(
            "refusing to load {}: {} bytes exceeds cap of {}",
            path.display(),
            meta.len(),
            size_cap
        );
        return default;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!("failed to read {}: {}", path.display(), err);
            return default;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("failed to parse {}: {}", path.display(), err);
            default
        }
    }
}

/// Cooperative advisory lock backed by a sidecar `<path>.lock` file.
///
/// The sidecar is created with `create_new`, so exactly one holder exists
/// at a time. Release happens on drop, including panic unwinds.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquires the lock guarding `target`, polling until `timeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self, SafeIoError> {
        let lock_path = PathBuf::from(format!("{}.lock", target.display()));
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { lock_path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(SafeIoError::LockTimeout {
                            path: lock_path,
                            timeout,
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(io_err(&lock_path, err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Checks whether `path` was last written by a different run.
///
/// Reads only `meta.run_id`; a mismatch logs a concurrency warning and
/// returns true. Missing or unreadable files return false.
pub fn check_concurrent_access(path: &Path, run_id: &str) -> bool {
    #[derive(serde::Deserialize)]
    struct MetaOnly {
        meta: Option<MetaRunId>,
    }
    #[derive(serde::Deserialize)]
    struct MetaRunId {
        run_id: Option<String>,
    }

    let Ok(text) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(doc) = serde_json::from_str::<MetaOnly>(&text) else {
        return false;
    };
    match doc.meta.and_then(|m| m.run_id) {
        Some(other) if other != run_id => {
            tracing::warn!(
                "{} carries run id {} (ours is {}); another process is sharing this state",
                path.display(),
                other,
                run_id
            );
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_atomic_write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        atomic_write_json(&path, &serde_json::json!({"k": 1})).unwrap();
        let loaded: serde_json::Value =
            safe_load_json(&path, serde_json::Value::Null, DEFAULT_JSON_SIZE_CAP);
        assert_eq!(loaded["k"], 1);
        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_safe_load_json_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(safe_load_json(&missing, 7i32, DEFAULT_JSON_SIZE_CAP), 7);

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "{not json").unwrap();
        assert_eq!(safe_load_json(&corrupt, 7i32, DEFAULT_JSON_SIZE_CAP), 7);

        let oversized = dir.path().join("big.json");
        fs::write(&oversized, "[1,2,3,4,5,6,7,8]").unwrap();
        assert_eq!(safe_load_json(&oversized, 7i32, 4), 7);
    }

    #[test]
    fn test_lock_excludes_and_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        let held = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        let err = FileLock::acquire(&target, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, SafeIoError::LockTimeout { .. }));
        assert!(start.elapsed() < Duration::from_millis(600));

        drop(held);
        FileLock::acquire(&target, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_lock_released_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        let (tx, rx) = mpsc::channel();
        let thread_target = target.clone();
        let holder = std::thread::spawn(move || {
            let lock = FileLock::acquire(&thread_target, Duration::from_secs(1)).unwrap();
            tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            drop(lock);
        });
        rx.recv().unwrap();
        // The holder keeps the lock briefly; a patient acquire succeeds.
        FileLock::acquire(&target, Duration::from_secs(2)).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_run_id_shape() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_check_concurrent_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        atomic_write_json(&path, &serde_json::json!({"meta": {"run_id": "aaaa1111"}})).unwrap();
        assert!(!check_concurrent_access(&path, "aaaa1111"));
        assert!(check_concurrent_access(&path, "bbbb2222"));
        assert!(!check_concurrent_access(&dir.path().join("nope.json"), "x"));
    }
}
