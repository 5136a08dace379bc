//! Common task, link and index shapes shared by both universes.
//!
//! These are the typed counterparts of the persisted JSON artifacts: every
//! field access in the pipeline goes through these records, and the on-disk
//! documents are a straight serde projection of them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Schema version of persisted index files.
pub const INDEX_SCHEMA: u32 = 2;

/// Schema version of the persisted link file.
pub const LINK_SCHEMA: u32 = 1;

/// Unique identifier for a task, stable within its universe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which universe a task was observed in. Never changes for a given task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Markdown,
    Reminders,
}

/// The completion status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is not yet completed.
    Todo,
    /// Task has been completed.
    Done,
}

/// Task priority, ordered from absent to most urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    None,
    Low,
    Medium,
    High,
    Highest,
}

/// Where a task lives in its source universe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskLocation {
    /// A line in a vault file. `line` is 1-based.
    Markdown {
        vault: String,
        path: String,
        line: usize,
    },
    /// An item in a reminders list.
    Reminders { list_id: String, item_id: String },
}

impl TaskLocation {
    /// A total, deterministic ordering key used for tie-breaks.
    pub fn sort_key(&self) -> (String, usize) {
        match self {
            TaskLocation::Markdown { vault, path, line } => {
                (format!("{vault}/{path}"), *line)
            }
            TaskLocation::Reminders { list_id, item_id } => {
                (format!("{list_id}:{item_id}"), 0)
            }
        }
    }
}

/// The unit reconciled across the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub origin: Origin,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_on: Option<NaiveDate>,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub location: TaskLocation,
    /// Stable hash of title + due + status + tags.
    pub content_digest: String,
    /// Best available last-modified timestamp for the source row.
    pub modified_at: DateTime<Utc>,
    /// First-seen timestamp.
    pub created_at: DateTime<Utc>,
    /// Normalized title tokens, computed once per run. Not persisted.
    #[serde(skip)]
    title_tokens: OnceLock<Vec<String>>,
}

impl Task {
    /// Creates a task with empty optional fields; callers fill in dates,
    /// priority, tags and the content digest afterwards.
    pub fn new(
        id: TaskId,
        origin: Origin,
        title: impl Into<String>,
        status: TaskStatus,
        location: TaskLocation,
        modified_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            origin,
            title: title.into(),
            status,
            due: None,
            scheduled: None,
            start: None,
            done_on: None,
            priority: Priority::None,
            recurrence: None,
            tags: Vec::new(),
            location,
            content_digest: String::new(),
            modified_at,
            created_at,
            title_tokens: OnceLock::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Normalized tokens of the title, computed lazily and cached on the
    /// record so matching tokenizes each title once.
    pub fn title_tokens(&self) -> &[String] {
        self.title_tokens
            .get_or_init(|| crate::domain::matching::tokenize(&self.title))
    }
}

/// Direction of the last reconcile that touched a link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    None,
    MdToRem,
    RemToMd,
    Both,
}

/// A one-to-one association between a markdown task and a reminders task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub md_id: TaskId,
    pub rem_id: TaskId,
    /// Matching affinity in [0, 1] at the time the link was last scored.
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub last_scored_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_direction: SyncDirection,
}

impl Link {
    pub fn new(md_id: TaskId, rem_id: TaskId, score: f64, now: DateTime<Utc>) -> Self {
        Self {
            md_id,
            rem_id,
            score,
            created_at: now,
            last_scored_at: now,
            last_synced_at: None,
            last_sync_direction: SyncDirection::None,
        }
    }
}

/// A per-list enumeration failure recorded in an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListError {
    pub list_id: String,
    pub message: String,
}

/// Metadata stamped into every persisted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub schema: u32,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    /// Number of files or lists that fed the index.
    pub source_count: usize,
    pub task_count: usize,
    /// Lists that failed to enumerate; the engine treats them as opaque.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_errors: Vec<ListError>,
}

/// An id-keyed task population for one universe.
///
/// Tasks are kept in a `BTreeMap` so two runs over identical sources
/// serialize byte-identically modulo `generated_at` and `run_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIndex {
    pub meta: IndexMeta,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl TaskIndex {
    pub fn new(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            meta: IndexMeta {
                schema: INDEX_SCHEMA,
                generated_at: now,
                run_id: run_id.to_string(),
                source_count: 0,
                task_count: 0,
                list_errors: Vec::new(),
            },
            tasks: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Inserts a task and keeps `meta.task_count` in step.
    pub fn insert(&mut self, task: Task) -> Option<Task> {
        let previous = self.tasks.insert(task.id.clone(), task);
        self.meta.task_count = self.tasks.len();
        previous
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let removed = self.tasks.remove(id);
        self.meta.task_count = self.tasks.len();
        removed
    }
}

/// Metadata stamped into the persisted link file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkMeta {
    pub schema: u32,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub link_count: usize,
    pub min_score: f64,
    pub algorithm: String,
}

/// The persisted link artifact: metadata plus the ordered link set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFile {
    pub meta: LinkMeta,
    pub links: Vec<Link>,
}

/// A reconcilable task field. Declaration order is the order updates are
/// applied in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Title,
    Status,
    Due,
    Priority,
}

impl FieldKind {
    /// All reconcilable fields in application order.
    pub const ALL: [FieldKind; 4] = [
        FieldKind::Title,
        FieldKind::Status,
        FieldKind::Due,
        FieldKind::Priority,
    ];
}

/// A field payload carried in a plan or changeset entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Status(TaskStatus),
    Date(Option<NaiveDate>),
    Priority(Priority),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Status(TaskStatus::Todo) => write!(f, "todo"),
            FieldValue::Status(TaskStatus::Done) => write!(f, "done"),
            FieldValue::Date(Some(d)) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Date(None) => write!(f, ""),
            FieldValue::Priority(p) => {
                let label = match p {
                    Priority::None => "none",
                    Priority::Low => "low",
                    Priority::Medium => "medium",
                    Priority::High => "high",
                    Priority::Highest => "highest",
                };
                write!(f, "{label}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_transparent_in_json() {
        let id = TaskId::from("md-abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"md-abc123\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::None);
    }

    #[test]
    fn test_location_sort_key_total_order() {
        let a = TaskLocation::Markdown {
            vault: "v".into(),
            path: "notes.md".into(),
            line: 3,
        };
        let b = TaskLocation::Markdown {
            vault: "v".into(),
            path: "notes.md".into(),
            line: 7,
        };
        assert!(a.sort_key() < b.sort_key());
    }
}
