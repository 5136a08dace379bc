//! The per-run changeset: the durable record of every mutation applied,
//! and the only artifact consulted for rollback.

use crate::safe_io::{self, SafeIoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use taskbridge_core::types::{FieldKind, Link, Task, TaskId};

pub const CHANGESET_FILE: &str = "changeset.json";
pub const CHANGESET_SCHEMA: u32 = 1;

/// Stable hash of one line of text, for audit trails.
pub fn line_sha(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetMeta {
    pub schema: u32,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
}

/// One applied markdown line edit, self-contained enough to undo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownEditRecord {
    pub file: PathBuf,
    pub line: usize,
    pub original: String,
    pub new: String,
    pub sha_before: String,
    pub sha_after: String,
}

/// One applied reminders field edit with old/new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderEditRecord {
    pub item_id: String,
    pub field: FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

/// A counterpart creation: the full task snapshot plus the new link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationRecord {
    pub task: Task,
    pub link: Link,
    /// Absolute path of the file written, for markdown-side creations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// The emitted markdown line, for markdown-side creations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownRetirementRecord {
    pub id: TaskId,
    pub file: PathBuf,
    pub line: usize,
    pub original: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderRetirementRecord {
    pub id: TaskId,
    pub item_id: String,
    pub title: String,
}

/// The append-oriented record of one run's mutations, one array per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changeset {
    pub meta: ChangesetMeta,
    #[serde(default)]
    pub markdown_edits: Vec<MarkdownEditRecord>,
    #[serde(default)]
    pub reminders_edits: Vec<ReminderEditRecord>,
    #[serde(default)]
    pub markdown_creations: Vec<CreationRecord>,
    #[serde(default)]
    pub reminders_creations: Vec<CreationRecord>,
    #[serde(default)]
    pub markdown_retirements: Vec<MarkdownRetirementRecord>,
    #[serde(default)]
    pub reminders_retirements: Vec<ReminderRetirementRecord>,
}

/// Outcome of a rollback pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: usize,
    pub skipped: usize,
    pub files_touched: usize,
    /// Reminders-side mutations are not auto-undone; they are counted here
    /// for manual attention.
    pub manual: usize,
}

enum UndoOp<'a> {
    /// Replace `current` (expected text) with `previous`.
    Restore { line: usize, current: &'a str, previous: &'a str },
    /// Remove a line this run appended.
    RemoveLine { text: &'a str },
    /// Re-insert a line this run deleted.
    Reinsert { line: usize, text: &'a str },
}

impl Changeset {
    pub fn new(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            meta: ChangesetMeta {
                schema: CHANGESET_SCHEMA,
                generated_at: now,
                run_id: run_id.to_string(),
            },
            markdown_edits: Vec::new(),
            reminders_edits: Vec::new(),
            markdown_creations: Vec::new(),
            reminders_creations: Vec::new(),
            markdown_retirements: Vec::new(),
            reminders_retirements: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    pub fn mutation_count(&self) -> usize {
        self.markdown_edits.len()
            + self.reminders_edits.len()
            + self.markdown_creations.len()
            + self.reminders_creations.len()
            + self.markdown_retirements.len()
            + self.reminders_retirements.len()
    }

    pub fn save(&self, path: &Path) -> Result<(), SafeIoError> {
        safe_io::check_concurrent_access(path, &self.meta.run_id);
        safe_io::atomic_write_json(path, self)
    }

    pub fn load(path: &Path, size_cap: u64) -> Option<Self> {
        let loaded: Option<Self> = safe_io::safe_load_json(path, None, size_cap);
        loaded.filter(|cs| cs.meta.schema == CHANGESET_SCHEMA)
    }

    /// Undoes this changeset's markdown mutations.
    ///
    /// Each edit is restored at its recorded line when the current text
    /// still equals the recorded new text, otherwise at a unique whole-line
    /// match; ambiguous or vanished lines are skipped. Reminders mutations
    /// are reported as manual-attention items.
    pub fn rollback(&self) -> RollbackReport {
        let mut report = RollbackReport {
            manual: self.reminders_edits.len()
                + self.reminders_creations.len()
                + self.reminders_retirements.len(),
            ..Default::default()
        };

        let mut by_file: BTreeMap<&Path, Vec<UndoOp<'_>>> = BTreeMap::new();
        for edit in &self.markdown_edits {
            by_file.entry(&edit.file).or_default().push(UndoOp::Restore {
                line: edit.line,
                current: &edit.new,
                previous: &edit.original,
            });
        }
        for creation in &self.markdown_creations {
            let (Some(file), Some(line_text)) = (&creation.file, &creation.line_text) else {
                report.skipped += 1;
                continue;
            };
            by_file
                .entry(file.as_path())
                .or_default()
                .push(UndoOp::RemoveLine { text: line_text });
        }
        for retirement in &self.markdown_retirements {
            by_file
                .entry(&retirement.file)
                .or_default()
                .push(UndoOp::Reinsert {
                    line: retirement.line,
                    text: &retirement.original,
                });
        }

        for (file, ops) in by_file {
            match undo_file(file, &ops) {
                Ok((restored, skipped)) => {
                    report.restored += restored;
                    report.skipped += skipped;
                    if restored > 0 {
                        report.files_touched += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!("rollback of {} failed: {}", file.display(), err);
                    report.skipped += ops.len();
                }
            }
        }
        report
    }
}

fn undo_file(path: &Path, ops: &[UndoOp<'_>]) -> Result<(usize, usize), SafeIoError> {
    let text = fs::read_to_string(path).map_err(|e| SafeIoError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let crlf = text.contains("\r\n");
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut restored = 0;
    let mut skipped = 0;

    for op in ops {
        match op {
            UndoOp::Restore { line, current, previous } => {
                let target = find_line(&lines, *line, current);
                match target {
                    Some(idx) => {
                        lines[idx] = (*previous).to_string();
                        restored += 1;
                    }
                    None => skipped += 1,
                }
            }
            UndoOp::RemoveLine { text } => {
                let matches: Vec<usize> = lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.as_str() == *text)
                    .map(|(i, _)| i)
                    .collect();
                if matches.len() == 1 {
                    lines.remove(matches[0]);
                    restored += 1;
                } else {
                    skipped += 1;
                }
            }
            UndoOp::Reinsert { line, text } => {
                let idx = (*line - 1).min(lines.len());
                lines.insert(idx, (*text).to_string());
                restored += 1;
            }
        }
    }

    if restored > 0 {
        let ending = if crlf { "\r\n" } else { "\n" };
        let mut output = lines.join(ending);
        output.push_str(ending);
        safe_io::atomic_write_text(path, &output)?;
    }
    Ok((restored, skipped))
}

/// Prefers the recorded line number when its content still matches, else a
/// unique whole-line match.
fn find_line(lines: &[String], recorded: usize, expected: &str) -> Option<usize> {
    if recorded >= 1 && lines.get(recorded - 1).is_some_and(|l| l == expected) {
        return Some(recorded - 1);
    }
    let matches: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.as_str() == expected)
        .map(|(i, _)| i)
        .collect();
    match matches.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}
