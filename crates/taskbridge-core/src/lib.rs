//! Core domain logic for taskbridge.
//!
//! Everything in this crate is pure: task/link/index types, the markdown
//! task-line codec, stable identity assignment, the matching engine, the
//! reconciliation planner, and the duplicate detector. All file and gateway
//! I/O lives in `taskbridge-store`.

pub mod domain;
pub mod types;

pub use domain::dates::{date_distance_days, dates_equal, normalize_date_string};
pub use domain::identity::{MarkdownIdAssigner, content_digest, reminders_id};
pub use domain::matching::{MatchAlgorithm, MatchOptions, rebuild_links, score_pair};
pub use domain::reconcile::{Direction, FieldUpdate, SyncPlan, build_plan};
pub use domain::taskline::{LineEdit, ParsedTask, extract_tasks, parse_task_line, rewrite_line};
pub use types::{
    FieldKind, FieldValue, IndexMeta, Link, LinkFile, Origin, Priority, SyncDirection, Task,
    TaskId, TaskIndex, TaskLocation, TaskStatus,
};
