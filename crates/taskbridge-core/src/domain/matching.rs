//! Scoring and one-to-one assignment between the two task populations.
//!
//! Candidate pairs are pruned through due-date buckets, scored on title,
//! date and status signals, then assigned either optimally (Kuhn–Munkres on
//! `1 − score`) or greedily. Both strategies are deterministic: ties are
//! always broken on `(score, md_id, rem_id)`.

use crate::domain::constants::{
    DATE_WEIGHT, DEFAULT_DAYS_TOLERANCE, DEFAULT_MIN_SCORE, NO_DATES_COMPONENT,
    STATUS_MISMATCH_COMPONENT, STATUS_WEIGHT, STOP_WORDS, TITLE_WEIGHT,
};
use crate::domain::hungarian;
use crate::types::{Link, Task, TaskId, TaskIndex};
use chrono::{DateTime, Days, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Cost assigned to pairs that are not candidates; large enough that the
/// solver never prefers one over any real pairing.
const FORBIDDEN_COST: f64 = 1.0e6;

/// Assignment strategy for the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchAlgorithm {
    /// Kuhn–Munkres maximum-weight matching.
    Hungarian,
    /// Descending-score greedy; same result on non-degenerate inputs.
    Greedy,
}

impl MatchAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAlgorithm::Hungarian => "hungarian",
            MatchAlgorithm::Greedy => "greedy",
        }
    }
}

/// Knobs for one matching pass.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub min_score: f64,
    pub days_tolerance: i64,
    pub include_completed: bool,
    pub algorithm: MatchAlgorithm,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_SCORE,
            days_tolerance: DEFAULT_DAYS_TOLERANCE,
            include_completed: false,
            algorithm: MatchAlgorithm::Hungarian,
        }
    }
}

/// One scored candidate or accepted pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPair {
    pub md_id: TaskId,
    pub rem_id: TaskId,
    pub score: f64,
}

/// Component breakdown of a pair score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub title_similarity: f64,
    pub date_component: f64,
    pub status_component: f64,
    pub date_distance_days: Option<i64>,
    pub score: f64,
}

/// Normalizes a title into comparison tokens: lowercased, punctuation
/// stripped, stop words removed.
pub fn tokenize(title: &str) -> Vec<String> {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|token| !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Sørensen–Dice coefficient over token multisets.
fn dice_coefficient(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in a {
        *counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut intersection = 0usize;
    for token in b {
        if let Some(count) = counts.get_mut(token.as_str()) {
            if *count > 0 {
                *count -= 1;
                intersection += 1;
            }
        }
    }
    2.0 * intersection as f64 / (a.len() + b.len()) as f64
}

fn date_component(
    md_due: Option<NaiveDate>,
    rem_due: Option<NaiveDate>,
    days_tolerance: i64,
) -> (f64, Option<i64>) {
    match (md_due, rem_due) {
        (None, None) => (NO_DATES_COMPONENT, None),
        (Some(_), None) | (None, Some(_)) => (0.0, None),
        (Some(a), Some(b)) => {
            let distance = (a - b).num_days().abs();
            if distance <= days_tolerance {
                let span = (days_tolerance + 1) as f64;
                ((span - distance as f64) / span, Some(distance))
            } else {
                (0.0, Some(distance))
            }
        }
    }
}

/// Title similarity between two tasks, via their cached token multisets.
pub fn title_similarity(a: &Task, b: &Task) -> f64 {
    dice_coefficient(a.title_tokens(), b.title_tokens())
}

/// Scores one markdown/reminders candidate pair.
pub fn score_pair(md: &Task, rem: &Task, days_tolerance: i64) -> ScoreBreakdown {
    let title_similarity = title_similarity(md, rem);
    let (date_score, date_distance_days) = date_component(md.due, rem.due, days_tolerance);
    let status_component = if md.status == rem.status {
        1.0
    } else {
        STATUS_MISMATCH_COMPONENT
    };
    let score = TITLE_WEIGHT * title_similarity
        + DATE_WEIGHT * date_score
        + STATUS_WEIGHT * status_component;
    ScoreBreakdown {
        title_similarity,
        date_component: date_score,
        status_component,
        date_distance_days,
        score,
    }
}

fn eligible<'a>(
    tasks: &'a BTreeMap<TaskId, Task>,
    exclude: &BTreeSet<TaskId>,
    include_completed: bool,
) -> Vec<&'a Task> {
    tasks
        .values()
        .filter(|t| !exclude.contains(&t.id))
        .filter(|t| include_completed || !t.is_done())
        .collect()
}

/// Builds the gated candidate pair list via due-date bucket pruning.
fn candidate_pairs(
    md_tasks: &[&Task],
    rem_tasks: &[&Task],
    options: &MatchOptions,
) -> Vec<ScoredPair> {
    // Bucket markdown tasks by due date; `None` is its own bucket.
    let mut buckets: BTreeMap<Option<NaiveDate>, Vec<usize>> = BTreeMap::new();
    for (idx, task) in md_tasks.iter().enumerate() {
        buckets.entry(task.due).or_default().push(idx);
    }

    let mut pairs = Vec::new();
    for rem in rem_tasks {
        let mut candidate_indexes: Vec<usize> = Vec::new();
        match rem.due {
            Some(due) => {
                for offset in -options.days_tolerance..=options.days_tolerance {
                    let day = if offset < 0 {
                        due.checked_sub_days(Days::new(offset.unsigned_abs()))
                    } else {
                        due.checked_add_days(Days::new(offset as u64))
                    };
                    if let Some(day) = day {
                        if let Some(indexes) = buckets.get(&Some(day)) {
                            candidate_indexes.extend_from_slice(indexes);
                        }
                    }
                }
                if let Some(indexes) = buckets.get(&None) {
                    candidate_indexes.extend_from_slice(indexes);
                }
            }
            // Without a due date the date component cannot prune anything:
            // title and status alone can clear the gate.
            None => candidate_indexes.extend(0..md_tasks.len()),
        }

        for idx in candidate_indexes {
            let md = md_tasks[idx];
            let breakdown = score_pair(md, rem, options.days_tolerance);
            if breakdown.score >= options.min_score {
                pairs.push(ScoredPair {
                    md_id: md.id.clone(),
                    rem_id: rem.id.clone(),
                    score: breakdown.score,
                });
            }
        }
    }
    pairs
}

fn sort_pairs(pairs: &mut [ScoredPair]) {
    pairs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.md_id.cmp(&b.md_id))
            .then_with(|| a.rem_id.cmp(&b.rem_id))
    });
}

/// Greedy assignment: best-scoring pairs first, endpoints used once.
fn assign_greedy(mut pairs: Vec<ScoredPair>) -> Vec<ScoredPair> {
    sort_pairs(&mut pairs);
    let mut used_md: BTreeSet<TaskId> = BTreeSet::new();
    let mut used_rem: BTreeSet<TaskId> = BTreeSet::new();
    let mut accepted = Vec::new();
    for pair in pairs {
        if used_md.contains(&pair.md_id) || used_rem.contains(&pair.rem_id) {
            continue;
        }
        used_md.insert(pair.md_id.clone());
        used_rem.insert(pair.rem_id.clone());
        accepted.push(pair);
    }
    accepted
}

/// Optimal assignment via Kuhn–Munkres on the square-padded cost matrix.
fn assign_hungarian(pairs: Vec<ScoredPair>) -> Vec<ScoredPair> {
    if pairs.is_empty() {
        return Vec::new();
    }
    let md_ids: Vec<TaskId> = pairs
        .iter()
        .map(|p| p.md_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let rem_ids: Vec<TaskId> = pairs
        .iter()
        .map(|p| p.rem_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let md_index: HashMap<&TaskId, usize> =
        md_ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let rem_index: HashMap<&TaskId, usize> =
        rem_ids.iter().enumerate().map(|(i, id)| (id, i)).collect();

    let n = md_ids.len().max(rem_ids.len());
    let mut scores: HashMap<(usize, usize), f64> = HashMap::new();
    let mut cost = vec![vec![FORBIDDEN_COST; n]; n];
    // Padding rows/columns absorb the unmatched side at zero cost.
    for row in cost.iter_mut().skip(md_ids.len()) {
        row.fill(0.0);
    }
    for row in cost.iter_mut().take(md_ids.len()) {
        for cell in row.iter_mut().skip(rem_ids.len()) {
            *cell = 0.0;
        }
    }
    for pair in &pairs {
        let i = md_index[&pair.md_id];
        let j = rem_index[&pair.rem_id];
        scores.insert((i, j), pair.score);
        cost[i][j] = 1.0 - pair.score;
    }

    let assignment = hungarian::solve(&cost);
    let mut accepted: Vec<ScoredPair> = assignment
        .iter()
        .enumerate()
        .take(md_ids.len())
        .filter_map(|(i, &j)| {
            scores.get(&(i, j)).map(|&score| ScoredPair {
                md_id: md_ids[i].clone(),
                rem_id: rem_ids[j].clone(),
                score,
            })
        })
        .collect();
    sort_pairs(&mut accepted);
    accepted
}

/// Proposes a one-to-one pairing between unlinked tasks on both sides.
pub fn suggest_links(
    md_tasks: &BTreeMap<TaskId, Task>,
    rem_tasks: &BTreeMap<TaskId, Task>,
    exclude_md: &BTreeSet<TaskId>,
    exclude_rem: &BTreeSet<TaskId>,
    options: &MatchOptions,
) -> Vec<ScoredPair> {
    let md = eligible(md_tasks, exclude_md, options.include_completed);
    let rem = eligible(rem_tasks, exclude_rem, options.include_completed);
    if md.is_empty() || rem.is_empty() {
        return Vec::new();
    }
    let pairs = candidate_pairs(&md, &rem, options);
    match options.algorithm {
        MatchAlgorithm::Greedy => assign_greedy(pairs),
        MatchAlgorithm::Hungarian => assign_hungarian(pairs),
    }
}

/// Result of a link-set rebuild.
#[derive(Debug, Clone)]
pub struct LinkRebuild {
    /// The new link set: preserved links first, then fresh pairings.
    pub links: Vec<Link>,
    /// Links dropped because an endpoint vanished or the pair fell below
    /// the gate.
    pub retired: Vec<Link>,
}

/// Rebuilds the link set against the current indexes.
///
/// Links whose endpoints vanished are retired. Surviving links are
/// re-scored: still-gated pairs keep their `created_at` and sync history,
/// below-gate pairs are retired and their endpoints rejoin the matching
/// pool.
pub fn rebuild_links(
    md_index: &TaskIndex,
    rem_index: &TaskIndex,
    existing: Vec<Link>,
    options: &MatchOptions,
    now: DateTime<Utc>,
) -> LinkRebuild {
    let mut links: Vec<Link> = Vec::new();
    let mut retired: Vec<Link> = Vec::new();
    let mut linked_md: BTreeSet<TaskId> = BTreeSet::new();
    let mut linked_rem: BTreeSet<TaskId> = BTreeSet::new();

    for mut link in existing {
        let (Some(md), Some(rem)) = (md_index.get(&link.md_id), rem_index.get(&link.rem_id))
        else {
            retired.push(link);
            continue;
        };
        let breakdown = score_pair(md, rem, options.days_tolerance);
        if breakdown.score < options.min_score {
            retired.push(link);
            continue;
        }
        link.score = breakdown.score;
        link.last_scored_at = now;
        linked_md.insert(link.md_id.clone());
        linked_rem.insert(link.rem_id.clone());
        links.push(link);
    }

    let mut fresh = suggest_links(
        &md_index.tasks,
        &rem_index.tasks,
        &linked_md,
        &linked_rem,
        options,
    );
    fresh.sort_by(|a, b| a.md_id.cmp(&b.md_id).then_with(|| a.rem_id.cmp(&b.rem_id)));
    for pair in fresh {
        links.push(Link::new(pair.md_id, pair.rem_id, pair.score, now));
    }

    LinkRebuild { links, retired }
}
