//! Persisted per-side index files (schema 2).

use crate::safe_io::{self, SafeIoError};
use std::path::Path;
use taskbridge_core::types::{INDEX_SCHEMA, TaskIndex};

pub const MARKDOWN_INDEX_FILE: &str = "markdown_index.json";
pub const REMINDERS_INDEX_FILE: &str = "reminders_index.json";

/// Persists an index, warning first if another run wrote the file since we
/// last did.
pub fn save_index(path: &Path, index: &TaskIndex, run_id: &str) -> Result<(), SafeIoError> {
    safe_io::check_concurrent_access(path, run_id);
    safe_io::atomic_write_json(path, index)
}

/// Loads an index; `None` for missing, unreadable or wrong-schema files.
pub fn load_index(path: &Path, size_cap: u64) -> Option<TaskIndex> {
    let index: Option<TaskIndex> = safe_io::safe_load_json(path, None, size_cap);
    let index = index?;
    if index.meta.schema != INDEX_SCHEMA {
        tracing::warn!(
            "{} has schema {} (expected {}); ignoring",
            path.display(),
            index.meta.schema,
            INDEX_SCHEMA
        );
        return None;
    }
    Some(index)
}
