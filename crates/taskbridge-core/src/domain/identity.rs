//! Stable identity assignment for tasks on both sides of the boundary.
//!
//! Markdown tasks without an explicit block anchor still need identifiers
//! that survive re-indexing: the id is derived from the vault, the file
//! path, the task's canonical content and a per-file collision ordinal, so
//! it does not move when the line number does.

use crate::domain::dates;
use crate::types::TaskId;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Separator for digest inputs; cannot appear in any component.
const UNIT_SEP: char = '\x1f';

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable hash over a task's canonical fields, used for cache invalidation,
/// duplicate grouping, and identity fallbacks.
pub fn content_digest(
    title: &str,
    due: Option<NaiveDate>,
    done: bool,
    tags: &[String],
) -> String {
    let due_part = due.map(dates::format_date).unwrap_or_default();
    let status_part = if done { "done" } else { "todo" };
    let input = format!(
        "{title}{UNIT_SEP}{due_part}{UNIT_SEP}{status_part}{UNIT_SEP}{}",
        tags.join(",")
    );
    sha256_hex(&input)
}

/// Assigns markdown task identifiers during one vault walk.
///
/// The ordinal disambiguates identical (vault, path, digest) tuples within a
/// single file: the first occurrence gets 0, repeats count up in source
/// order. Because the ordinal depends only on content and occurrence order,
/// ids are stable across runs over unchanged files.
#[derive(Debug, Default)]
pub struct MarkdownIdAssigner {
    seen: HashMap<String, u32>,
}

impl MarkdownIdAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the id for one parsed markdown task.
    pub fn assign(
        &mut self,
        vault: &str,
        rel_path: &str,
        anchor: Option<&str>,
        digest: &str,
    ) -> TaskId {
        if let Some(id) = anchor {
            return TaskId::from(format!("{vault}/{id}"));
        }
        let tuple = format!("{vault}{UNIT_SEP}{rel_path}{UNIT_SEP}{digest}");
        let ordinal = self.seen.entry(tuple.clone()).or_insert(0);
        let id = sha256_hex(&format!("{tuple}{UNIT_SEP}{ordinal}"));
        *ordinal += 1;
        TaskId::from(format!("md-{}", &id[..16]))
    }
}

/// Identifier for a reminders task.
///
/// Prefers the gateway's external identifier, then the (list, item)
/// composite, and finally a digest of the visible fields when the gateway
/// provides nothing stable.
pub fn reminders_id(
    external_id: Option<&str>,
    list_id: &str,
    item_id: Option<&str>,
    title: &str,
    due: Option<NaiveDate>,
) -> TaskId {
    if let Some(ext) = external_id.filter(|s| !s.is_empty()) {
        return TaskId::from(format!("rem-{ext}"));
    }
    if let Some(item) = item_id.filter(|s| !s.is_empty()) {
        return TaskId::from(format!("rem-{list_id}:{item}"));
    }
    let due_part = due.map(dates::format_date).unwrap_or_default();
    let digest = sha256_hex(&format!("{title}{UNIT_SEP}{due_part}{UNIT_SEP}{list_id}"));
    TaskId::from(format!("rem-{}", &digest[..16]))
}

/// Generates a fresh block anchor (without the leading caret).
pub fn new_block_anchor() -> String {
    format!("t-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Generates a block anchor distinct from every anchor already in the file.
pub fn unique_block_anchor(existing: &HashSet<String>) -> String {
    loop {
        let candidate = new_block_anchor();
        if !existing.contains(&candidate) {
            return candidate;
        }
    }
}
