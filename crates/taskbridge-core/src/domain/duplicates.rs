//! Near-identical task detection within one universe.
//!
//! Grouping uses a compound key: the canonical content digest plus a
//! title-similarity bucket. Exact duplicates share a digest; near
//! duplicates (a retyped line, a trailing word added) agree on status and
//! due date and their normalized titles clear the similarity threshold.
//! One survivor is kept per group; the rest are proposed for retirement
//! unless removing them would orphan an active link.

use crate::domain::constants::DUPLICATE_TITLE_SIMILARITY;
use crate::domain::matching::title_similarity;
use crate::types::{Task, TaskId, TaskIndex};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// One group of duplicates and the decision taken for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// The survivor's canonical digest, identifying the group.
    pub content_digest: String,
    pub survivor: TaskId,
    /// Members safe to retire.
    pub retire: Vec<TaskId>,
    /// Linked members that would be orphaned by retirement; reported only.
    pub skipped_linked: Vec<TaskId>,
}

/// Survivor preference: linked beats unlinked, then older beats newer, then
/// the lexically smallest location wins. The key is total, so the decision
/// is deterministic.
fn survivor_key(task: &Task, linked: &BTreeSet<TaskId>) -> (bool, i64, (String, usize)) {
    (
        !linked.contains(&task.id),
        task.created_at.timestamp_millis(),
        task.location.sort_key(),
    )
}

/// Finds duplicate groups in one index.
///
/// `linked` is the set of task ids that are an endpoint of an active link.
/// Tasks are first bucketed by status and due date (duplicates always agree
/// on both), then clustered greedily: a task joins the first cluster whose
/// representative shares its digest or clears the title-similarity
/// threshold. Output order is deterministic.
pub fn find_duplicates(index: &TaskIndex, linked: &BTreeSet<TaskId>) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<(bool, Option<NaiveDate>), Vec<&Task>> = BTreeMap::new();
    for task in index.tasks.values() {
        buckets
            .entry((task.is_done(), task.due))
            .or_default()
            .push(task);
    }

    let mut groups = Vec::new();
    for (_, mut members) in buckets {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|t| (t.content_digest.clone(), t.location.sort_key()));

        // Each task joins the first cluster whose representative matches.
        let mut clusters: Vec<Vec<&Task>> = Vec::new();
        'tasks: for task in members {
            for cluster in clusters.iter_mut() {
                let representative = cluster[0];
                if representative.content_digest == task.content_digest
                    || title_similarity(representative, task) >= DUPLICATE_TITLE_SIMILARITY
                {
                    cluster.push(task);
                    continue 'tasks;
                }
            }
            clusters.push(vec![task]);
        }

        for mut cluster in clusters {
            if cluster.len() < 2 {
                continue;
            }
            cluster.sort_by_key(|t| survivor_key(t, linked));
            let survivor = cluster[0];
            let mut retire = Vec::new();
            let mut skipped_linked = Vec::new();
            for task in &cluster[1..] {
                if linked.contains(&task.id) {
                    skipped_linked.push(task.id.clone());
                } else {
                    retire.push(task.id.clone());
                }
            }
            groups.push(DuplicateGroup {
                content_digest: survivor.content_digest.clone(),
                survivor: survivor.id.clone(),
                retire,
                skipped_linked,
            });
        }
    }
    groups
}
