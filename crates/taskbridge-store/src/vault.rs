//! Markdown vault indexing and editing.
//!
//! The indexer walks each configured vault, runs the line codec over every
//! `.md` file and produces the markdown-side task index, consulting a parse
//! cache keyed by (path, size, mtime, content hash). The editor collapses
//! all mutations to one file into a single atomic replace and verifies that
//! each targeted line still carries the expected text before touching it.

use crate::config::VaultConfig;
use crate::safe_io::{self, SafeIoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use taskbridge_core::domain::identity::{self, MarkdownIdAssigner};
use taskbridge_core::domain::taskline;
use taskbridge_core::types::{Origin, Task, TaskIndex, TaskLocation, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    SafeIo(#[from] SafeIoError),
}

fn io_err(path: &Path, source: std::io::Error) -> VaultError {
    VaultError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-file parse results keyed by absolute path.
///
/// A hit requires matching size and mtime (or, failing that, a matching
/// content hash after re-read); any differing component invalidates the
/// entry.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ParseCache {
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    size: u64,
    mtime_ms: i64,
    sha256: String,
    tasks: Vec<Task>,
}

impl ParseCache {
    pub fn load(path: &Path, size_cap: u64) -> Self {
        safe_io::safe_load_json(path, Self::default(), size_cap)
    }

    pub fn save(&self, path: &Path) -> Result<(), SafeIoError> {
        safe_io::atomic_write_json(path, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries for files that no longer exist on disk.
    pub fn retain_existing(&mut self) {
        self.entries.retain(|path, _| Path::new(path).is_file());
    }
}

fn walk_md_files(root: &Path, exclude_dirs: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("cannot read {}: {}", dir.display(), err);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if name.starts_with('.') || exclude_dirs.contains(&name) {
                    continue;
                }
                stack.push(path);
            } else if name.to_lowercase().ends_with(".md") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn parse_file_tasks(
    vault: &str,
    rel_path: &str,
    text: &str,
    mtime: DateTime<Utc>,
) -> Vec<Task> {
    let mut assigner = MarkdownIdAssigner::new();
    taskline::extract_tasks(text)
        .into_iter()
        .map(|found| {
            let parsed = found.task;
            let done = parsed.status == TaskStatus::Done;
            let digest =
                identity::content_digest(&parsed.title, parsed.due, done, &parsed.tags);
            let id = assigner.assign(vault, rel_path, parsed.block_anchor.as_deref(), &digest);
            let mut task = Task::new(
                id,
                Origin::Markdown,
                &parsed.title,
                parsed.status,
                TaskLocation::Markdown {
                    vault: vault.to_string(),
                    path: rel_path.to_string(),
                    line: found.line_no,
                },
                mtime,
                mtime,
            );
            task.due = parsed.due;
            task.scheduled = parsed.scheduled;
            task.start = parsed.start;
            task.done_on = parsed.done_on;
            task.priority = parsed.priority;
            task.recurrence = parsed.recurrence;
            task.tags = parsed.tags;
            task.content_digest = digest;
            task
        })
        .collect()
}

fn index_file(
    vault: &VaultConfig,
    path: &Path,
    cache: &mut ParseCache,
) -> Result<Vec<Task>, VaultError> {
    let meta = fs::metadata(path).map_err(|e| io_err(path, e))?;
    let size = meta.len();
    let mtime: DateTime<Utc> = meta
        .modified()
        .map(DateTime::from)
        .map_err(|e| io_err(path, e))?;
    let mtime_ms = mtime.timestamp_millis();
    let key = path.to_string_lossy().into_owned();

    if let Some(entry) = cache.entries.get(&key) {
        if entry.size == size && entry.mtime_ms == mtime_ms {
            return Ok(entry.tasks.clone());
        }
    }

    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    let text = String::from_utf8_lossy(&bytes);
    let sha256 = hex::encode(Sha256::digest(&bytes));

    if let Some(entry) = cache.entries.get_mut(&key) {
        // Touched but unchanged: refresh the key, reuse the parse.
        if entry.sha256 == sha256 {
            entry.size = size;
            entry.mtime_ms = mtime_ms;
            return Ok(entry.tasks.clone());
        }
    }

    let rel_path = path
        .strip_prefix(&vault.path)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    let tasks = parse_file_tasks(&vault.name, &rel_path, &text, mtime);
    cache.entries.insert(
        key,
        CacheEntry {
            size,
            mtime_ms,
            sha256,
            tasks: tasks.clone(),
        },
    );
    Ok(tasks)
}

/// Walks every configured vault and builds the markdown-side index.
///
/// A vault whose path is missing is skipped with a warning; other vaults
/// proceed. `previous` supplies first-seen timestamps for tasks that were
/// already known.
pub fn collect_markdown_index(
    vaults: &[VaultConfig],
    exclude_dirs: &[String],
    cache: &mut ParseCache,
    previous: Option<&TaskIndex>,
    run_id: &str,
    now: DateTime<Utc>,
) -> TaskIndex {
    let mut index = TaskIndex::new(run_id, now);
    let mut file_count = 0;
    for vault in vaults {
        if !vault.path.is_dir() {
            tracing::warn!(
                "vault {} missing at {}; skipping",
                vault.name,
                vault.path.display()
            );
            continue;
        }
        for path in walk_md_files(&vault.path, exclude_dirs) {
            file_count += 1;
            let tasks = match index_file(vault, &path, cache) {
                Ok(tasks) => tasks,
                Err(err) => {
                    tracing::warn!("failed to index {}: {}", path.display(), err);
                    continue;
                }
            };
            for mut task in tasks {
                if index.contains(&task.id) {
                    tracing::warn!("duplicate task id {}; quarantining later copy", task.id);
                    continue;
                }
                task.created_at = previous
                    .and_then(|p| p.get(&task.id))
                    .map(|t| t.created_at)
                    .unwrap_or(now);
                index.insert(task);
            }
        }
    }
    index.meta.source_count = file_count;
    index
}

/// One line-level mutation to a vault file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMutation {
    ReplaceLine {
        line: usize,
        original: String,
        new: String,
    },
    DeleteLine {
        line: usize,
        original: String,
    },
    AppendLine {
        new: String,
    },
}

/// A mutation that landed, with its final 1-based line number.
#[derive(Debug, Clone)]
pub struct AppliedMutation {
    pub mutation: FileMutation,
    pub line: usize,
}

/// A mutation that was refused, with the reason.
#[derive(Debug, Clone)]
pub struct FailedMutation {
    pub mutation: FileMutation,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct FileEditReport {
    pub applied: Vec<AppliedMutation>,
    pub failed: Vec<FailedMutation>,
}

/// Applies all mutations for one file as a single atomic replace.
///
/// Each replace/delete is verified against the current line content and
/// refused individually on mismatch; one stale edit never blocks the rest.
/// The existing line-ending style is preserved and the rewritten file ends
/// with a single trailing newline. A file that does not exist yet is
/// treated as empty, so appends can create it.
pub fn apply_file_mutations(
    path: &Path,
    mutations: &[FileMutation],
) -> Result<FileEditReport, VaultError> {
    let text = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(io_err(path, err)),
    };
    let crlf = text.contains("\r\n");
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    let mut report = FileEditReport::default();
    let mut deletes: Vec<(usize, FileMutation)> = Vec::new();

    for mutation in mutations {
        match mutation {
            FileMutation::ReplaceLine { line, original, new } => {
                let idx = line.checked_sub(1);
                match idx.and_then(|i| lines.get_mut(i)) {
                    Some(current) if current == original => {
                        *current = new.clone();
                        report.applied.push(AppliedMutation {
                            mutation: mutation.clone(),
                            line: *line,
                        });
                    }
                    _ => report.failed.push(FailedMutation {
                        mutation: mutation.clone(),
                        reason: "line no longer matches expected text".to_string(),
                    }),
                }
            }
            FileMutation::DeleteLine { line, original } => {
                let idx = line.checked_sub(1);
                match idx.and_then(|i| lines.get(i)) {
                    Some(current) if current == original => {
                        deletes.push((*line, mutation.clone()));
                    }
                    _ => report.failed.push(FailedMutation {
                        mutation: mutation.clone(),
                        reason: "line no longer matches expected text".to_string(),
                    }),
                }
            }
            FileMutation::AppendLine { .. } => {}
        }
    }

    // Deletes run high-to-low so earlier line numbers stay valid.
    deletes.sort_by(|a, b| b.0.cmp(&a.0));
    for (line, mutation) in deletes {
        lines.remove(line - 1);
        report.applied.push(AppliedMutation { mutation, line });
    }

    for mutation in mutations {
        if let FileMutation::AppendLine { new } = mutation {
            lines.push(new.clone());
            report.applied.push(AppliedMutation {
                mutation: mutation.clone(),
                line: lines.len(),
            });
        }
    }

    if !report.applied.is_empty() {
        let ending = if crlf { "\r\n" } else { "\n" };
        let mut output = lines.join(ending);
        output.push_str(ending);
        safe_io::atomic_write_text(path, &output)?;
    }
    Ok(report)
}

/// A planned anchor injection for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorEdit {
    pub line: usize,
    pub original: String,
    pub new: String,
    pub anchor: String,
}

fn existing_anchors(text: &str) -> HashSet<String> {
    taskline::extract_tasks(text)
        .into_iter()
        .filter_map(|found| found.task.block_anchor)
        .collect()
}

/// Plans anchor injections for every task line lacking one.
pub fn plan_missing_anchors(text: &str) -> Vec<AnchorEdit> {
    let mut taken = existing_anchors(text);
    taskline::extract_tasks(text)
        .into_iter()
        .filter(|found| found.task.block_anchor.is_none())
        .map(|found| {
            let anchor = identity::unique_block_anchor(&taken);
            taken.insert(anchor.clone());
            let original = text.lines().nth(found.line_no - 1).unwrap_or_default();
            AnchorEdit {
                line: found.line_no,
                original: original.to_string(),
                new: format!("{} ^{anchor}", original.trim_end()),
                anchor,
            }
        })
        .collect()
}

/// Appends block anchors to every unanchored task line in a vault.
///
/// Dry-run by default; with `apply` the files are rewritten atomically.
/// Returns one changeset edit record per injected anchor, whether or not
/// it was applied.
pub fn add_missing_anchors(
    vault: &VaultConfig,
    exclude_dirs: &[String],
    apply: bool,
) -> Result<Vec<crate::changeset::MarkdownEditRecord>, VaultError> {
    let mut records = Vec::new();
    for path in walk_md_files(&vault.path, exclude_dirs) {
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        let edits = plan_missing_anchors(&text);
        if edits.is_empty() {
            continue;
        }
        let mutations: Vec<FileMutation> = edits
            .iter()
            .map(|edit| FileMutation::ReplaceLine {
                line: edit.line,
                original: edit.original.clone(),
                new: edit.new.clone(),
            })
            .collect();
        if apply {
            apply_file_mutations(&path, &mutations)?;
        }
        records.extend(edits.into_iter().map(|edit| {
            crate::changeset::MarkdownEditRecord {
                file: path.clone(),
                line: edit.line,
                sha_before: crate::changeset::line_sha(&edit.original),
                sha_after: crate::changeset::line_sha(&edit.new),
                original: edit.original,
                new: edit.new,
            }
        }));
    }
    Ok(records)
}

/// Plans an anchor injection for one specific line, if it is an unanchored
/// task.
pub fn plan_anchor_for_line(text: &str, line_no: usize) -> Option<AnchorEdit> {
    let line = text.lines().nth(line_no.checked_sub(1)?)?;
    let parsed = taskline::parse_task_line(line)?;
    if parsed.block_anchor.is_some() {
        return None;
    }
    let taken = existing_anchors(text);
    let anchor = identity::unique_block_anchor(&taken);
    Some(AnchorEdit {
        line: line_no,
        original: line.to_string(),
        new: format!("{} ^{anchor}", line.trim_end()),
        anchor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vault_at(dir: &Path) -> VaultConfig {
        VaultConfig {
            name: "test".to_string(),
            path: dir.to_path_buf(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_index_finds_tasks_and_skips_fences() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("daily.md"),
            "# Daily\n- [ ] Buy groceries 📅 2023-12-15 #personal\n```\n- [ ] not a task\n```\n- [x] Call dentist ✅ 2023-12-14\n",
        )
        .unwrap();
        let mut cache = ParseCache::default();
        let index = collect_markdown_index(
            &[vault_at(dir.path())],
            &[],
            &mut cache,
            None,
            "run1",
            now(),
        );
        assert_eq!(index.tasks.len(), 2);
        assert_eq!(index.meta.source_count, 1);
        let titles: Vec<&str> = index.tasks.values().map(|t| t.title.as_str()).collect();
        assert!(titles.contains(&"Buy groceries"));
        assert!(!titles.iter().any(|t| t.contains("not a task")));
    }

    #[test]
    fn test_reindexing_unchanged_vault_is_id_stable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("inbox.md"),
            "- [ ] Task one\n- [ ] Task two ^anchored\n- [ ] Task one\n",
        )
        .unwrap();
        let vaults = [vault_at(dir.path())];
        let mut cache = ParseCache::default();
        let first = collect_markdown_index(&vaults, &[], &mut cache, None, "run1", now());
        let mut cold_cache = ParseCache::default();
        let second =
            collect_markdown_index(&vaults, &[], &mut cold_cache, Some(&first), "run2", now());
        let first_ids: Vec<_> = first.tasks.keys().collect();
        let second_ids: Vec<_> = second.tasks.keys().collect();
        assert_eq!(first_ids, second_ids);
        assert!(first.tasks.keys().any(|id| id.as_str() == "test/anchored"));
    }

    #[test]
    fn test_cache_hit_skips_reparse() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("inbox.md");
        fs::write(&file, "- [ ] Cached task\n").unwrap();
        let vaults = [vault_at(dir.path())];
        let mut cache = ParseCache::default();
        let first = collect_markdown_index(&vaults, &[], &mut cache, None, "run1", now());
        assert_eq!(cache.len(), 1);
        let second =
            collect_markdown_index(&vaults, &[], &mut cache, Some(&first), "run2", now());
        assert_eq!(
            first.tasks.keys().collect::<Vec<_>>(),
            second.tasks.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_dot_and_excluded_dirs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        fs::create_dir_all(dir.path().join("archive")).unwrap();
        fs::write(dir.path().join(".obsidian/hidden.md"), "- [ ] hidden\n").unwrap();
        fs::write(dir.path().join("archive/old.md"), "- [ ] archived\n").unwrap();
        fs::write(dir.path().join("real.md"), "- [ ] visible\n").unwrap();
        let mut cache = ParseCache::default();
        let index = collect_markdown_index(
            &[vault_at(dir.path())],
            &["archive".to_string()],
            &mut cache,
            None,
            "run1",
            now(),
        );
        assert_eq!(index.tasks.len(), 1);
        assert_eq!(index.tasks.values().next().unwrap().title, "visible");
    }

    #[test]
    fn test_missing_vault_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = VaultConfig {
            name: "ghost".to_string(),
            path: dir.path().join("nope"),
        };
        let mut cache = ParseCache::default();
        let index =
            collect_markdown_index(&[missing], &[], &mut cache, None, "run1", now());
        assert!(index.tasks.is_empty());
    }

    #[test]
    fn test_editor_rewrites_single_line_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, "# Head\n- [ ] Old\n- [ ] Keep\n").unwrap();
        let report = apply_file_mutations(
            &file,
            &[FileMutation::ReplaceLine {
                line: 2,
                original: "- [ ] Old".to_string(),
                new: "- [x] Old".to_string(),
            }],
        )
        .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "# Head\n- [x] Old\n- [ ] Keep\n"
        );
    }

    #[test]
    fn test_editor_preserves_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, "- [ ] One\r\n- [ ] Two\r\n").unwrap();
        apply_file_mutations(
            &file,
            &[FileMutation::ReplaceLine {
                line: 1,
                original: "- [ ] One".to_string(),
                new: "- [x] One".to_string(),
            }],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "- [x] One\r\n- [ ] Two\r\n"
        );
    }

    #[test]
    fn test_stale_edit_fails_without_blocking_others() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, "- [ ] A\n- [ ] B\n").unwrap();
        let report = apply_file_mutations(
            &file,
            &[
                FileMutation::ReplaceLine {
                    line: 1,
                    original: "- [ ] STALE".to_string(),
                    new: "- [x] STALE".to_string(),
                },
                FileMutation::ReplaceLine {
                    line: 2,
                    original: "- [ ] B".to_string(),
                    new: "- [x] B".to_string(),
                },
            ],
        )
        .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), "- [ ] A\n- [x] B\n");
    }

    #[test]
    fn test_delete_and_append_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, "- [ ] A\n- [ ] B\n- [ ] C\n").unwrap();
        let report = apply_file_mutations(
            &file,
            &[
                FileMutation::DeleteLine {
                    line: 1,
                    original: "- [ ] A".to_string(),
                },
                FileMutation::DeleteLine {
                    line: 3,
                    original: "- [ ] C".to_string(),
                },
                FileMutation::AppendLine {
                    new: "- [ ] D".to_string(),
                },
            ],
        )
        .unwrap();
        assert_eq!(report.applied.len(), 3);
        assert_eq!(fs::read_to_string(&file).unwrap(), "- [ ] B\n- [ ] D\n");
    }

    #[test]
    fn test_append_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("2024-01-10.md");
        let report = apply_file_mutations(
            &file,
            &[FileMutation::AppendLine {
                new: "- [ ] Fresh ^t-000000000001".to_string(),
            }],
        )
        .unwrap();
        assert_eq!(report.applied[0].line, 1);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "- [ ] Fresh ^t-000000000001\n"
        );
    }

    #[test]
    fn test_plan_missing_anchors() {
        let text = "# Head\n- [ ] No anchor\n- [ ] Anchored ^keep42\n";
        let edits = plan_missing_anchors(text);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].line, 2);
        assert!(edits[0].new.starts_with("- [ ] No anchor ^t-"));
        assert_ne!(edits[0].anchor, "keep42");
    }

    #[test]
    fn test_add_missing_anchors_across_vault() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.md"),
            "- [ ] First\n- [ ] Anchored ^keep\n",
        )
        .unwrap();
        fs::write(dir.path().join("b.md"), "plain text\n- [ ] Second\n").unwrap();
        let vault = vault_at(dir.path());

        // Dry run records edits without touching the files.
        let planned = add_missing_anchors(&vault, &[], false).unwrap();
        assert_eq!(planned.len(), 2);
        assert!(
            fs::read_to_string(dir.path().join("a.md"))
                .unwrap()
                .starts_with("- [ ] First\n")
        );

        let applied = add_missing_anchors(&vault, &[], true).unwrap();
        assert_eq!(applied.len(), 2);
        assert!(
            fs::read_to_string(dir.path().join("a.md"))
                .unwrap()
                .starts_with("- [ ] First ^t-")
        );
        // A second pass finds nothing left to do.
        assert!(add_missing_anchors(&vault, &[], true).unwrap().is_empty());
    }

    #[test]
    fn test_plan_anchor_for_line() {
        let text = "- [ ] Plain\n- [ ] Anchored ^abc\nnot a task\n";
        let edit = plan_anchor_for_line(text, 1).unwrap();
        assert_eq!(edit.line, 1);
        assert!(edit.new.ends_with(&format!("^{}", edit.anchor)));
        assert!(plan_anchor_for_line(text, 2).is_none());
        assert!(plan_anchor_for_line(text, 3).is_none());
    }
}
