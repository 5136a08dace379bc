//! Per-link field diffing and plan construction.
//!
//! For each link the planner picks a winning side by last-writer-wins over
//! the link's sync baseline, then emits one update per differing field in
//! the winner's direction. The baseline is `last_synced_at`, or the link's
//! `created_at` for a link that has never synced — forming a link
//! establishes the baseline, it does not rewrite either side.

use crate::types::{FieldKind, FieldValue, Link, Task, TaskId, TaskIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way a field update flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    MdToRem,
    RemToMd,
}

/// One planned field update on one link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldUpdate {
    pub md_id: TaskId,
    pub rem_id: TaskId,
    pub field: FieldKind,
    pub direction: Direction,
    pub old: FieldValue,
    pub new: FieldValue,
}

/// The ordered plan for one reconcile run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPlan {
    pub updates: Vec<FieldUpdate>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Md,
    Rem,
    Neither,
}

/// Exact modification ties go to the reminders side: platform timestamps
/// are more granular, so an apparent tie usually means the markdown mtime
/// was truncated.
fn later_writer(md: &Task, rem: &Task) -> Winner {
    if md.modified_at > rem.modified_at {
        Winner::Md
    } else {
        Winner::Rem
    }
}

fn pick_winner(md: &Task, rem: &Task, baseline: DateTime<Utc>) -> Winner {
    let md_changed = md.modified_at > baseline;
    let rem_changed = rem.modified_at > baseline;
    match (md_changed, rem_changed) {
        (true, false) => Winner::Md,
        (false, true) => Winner::Rem,
        (true, true) => later_writer(md, rem),
        (false, false) => Winner::Neither,
    }
}

fn field_value(task: &Task, field: FieldKind) -> FieldValue {
    match field {
        FieldKind::Title => FieldValue::Text(task.title.clone()),
        FieldKind::Status => FieldValue::Status(task.status),
        FieldKind::Due => FieldValue::Date(task.due),
        FieldKind::Priority => FieldValue::Priority(task.priority),
    }
}

/// Plans the field updates for one link. Updates come out in field order
/// (title, status, due, priority), all flowing the same direction.
pub fn plan_link(md: &Task, rem: &Task, link: &Link) -> Vec<FieldUpdate> {
    let baseline = link.last_synced_at.unwrap_or(link.created_at);
    let winner = pick_winner(md, rem, baseline);
    let (direction, from, to) = match winner {
        Winner::Md => (Direction::MdToRem, md, rem),
        Winner::Rem => (Direction::RemToMd, rem, md),
        Winner::Neither => return Vec::new(),
    };

    FieldKind::ALL
        .iter()
        .filter_map(|&field| {
            let new = field_value(from, field);
            let old = field_value(to, field);
            (new != old).then(|| FieldUpdate {
                md_id: link.md_id.clone(),
                rem_id: link.rem_id.clone(),
                field,
                direction,
                old,
                new,
            })
        })
        .collect()
}

/// Builds the full plan, ordered by link then by field.
///
/// Links whose endpoints are missing from the current indexes are skipped;
/// retirement of such links is the matcher's job, not the planner's.
pub fn build_plan(md_index: &TaskIndex, rem_index: &TaskIndex, links: &[Link]) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for link in links {
        let (Some(md), Some(rem)) = (md_index.get(&link.md_id), rem_index.get(&link.rem_id))
        else {
            continue;
        };
        plan.updates.extend(plan_link(md, rem, link));
    }
    plan
}
