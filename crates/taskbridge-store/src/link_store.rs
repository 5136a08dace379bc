//! Persisted link file (schema 1).

use crate::safe_io::{self, SafeIoError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use taskbridge_core::domain::matching::MatchAlgorithm;
use taskbridge_core::types::{LINK_SCHEMA, Link, LinkFile, LinkMeta, TaskId};

pub const LINK_FILE: &str = "sync_links.json";

/// Persists the link set with its metadata.
pub fn save_links(
    path: &Path,
    links: &[Link],
    run_id: &str,
    min_score: f64,
    algorithm: MatchAlgorithm,
    now: DateTime<Utc>,
) -> Result<(), SafeIoError> {
    safe_io::check_concurrent_access(path, run_id);
    let file = LinkFile {
        meta: LinkMeta {
            schema: LINK_SCHEMA,
            generated_at: now,
            run_id: run_id.to_string(),
            link_count: links.len(),
            min_score,
            algorithm: algorithm.as_str().to_string(),
        },
        links: links.to_vec(),
    };
    safe_io::atomic_write_json(path, &file)
}

/// Loads the link set, quarantining records that violate the one-to-one
/// invariant. Missing or wrong-schema files yield an empty set.
pub fn load_links(path: &Path, size_cap: u64) -> Vec<Link> {
    let file: Option<LinkFile> = safe_io::safe_load_json(path, None, size_cap);
    let Some(file) = file else {
        return Vec::new();
    };
    if file.meta.schema != LINK_SCHEMA {
        tracing::warn!(
            "{} has schema {} (expected {}); ignoring",
            path.display(),
            file.meta.schema,
            LINK_SCHEMA
        );
        return Vec::new();
    }

    let mut seen_md: BTreeSet<TaskId> = BTreeSet::new();
    let mut seen_rem: BTreeSet<TaskId> = BTreeSet::new();
    let mut links = Vec::with_capacity(file.links.len());
    for link in file.links {
        if seen_md.contains(&link.md_id) || seen_rem.contains(&link.rem_id) {
            tracing::warn!(
                "quarantining link {} <-> {}: endpoint already linked",
                link.md_id,
                link.rem_id
            );
            continue;
        }
        seen_md.insert(link.md_id.clone());
        seen_rem.insert(link.rem_id.clone());
        links.push(link);
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LINK_FILE);
        let links = vec![
            Link::new(TaskId::from("md-b"), TaskId::from("rem-b"), 0.9, now()),
            Link::new(TaskId::from("md-a"), TaskId::from("rem-a"), 0.8, now()),
        ];
        save_links(&path, &links, "run1", 0.75, MatchAlgorithm::Hungarian, now()).unwrap();
        let loaded = load_links(&path, crate::safe_io::DEFAULT_JSON_SIZE_CAP);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].md_id, TaskId::from("md-b"));
    }

    #[test]
    fn test_duplicate_endpoints_are_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LINK_FILE);
        let links = vec![
            Link::new(TaskId::from("md-a"), TaskId::from("rem-a"), 0.9, now()),
            Link::new(TaskId::from("md-a"), TaskId::from("rem-b"), 0.8, now()),
            Link::new(TaskId::from("md-c"), TaskId::from("rem-a"), 0.8, now()),
        ];
        save_links(&path, &links, "run1", 0.75, MatchAlgorithm::Greedy, now()).unwrap();
        let loaded = load_links(&path, crate::safe_io::DEFAULT_JSON_SIZE_CAP);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].rem_id, TaskId::from("rem-a"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            load_links(
                &dir.path().join("absent.json"),
                crate::safe_io::DEFAULT_JSON_SIZE_CAP
            )
            .is_empty()
        );
    }
}
