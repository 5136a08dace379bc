//! In-memory reminders gateway for tests.
//!
//! Backs the end-to-end suite: tests seed lists, run the pipeline, then
//! assert that mutations actually landed "on the platform" by inspecting
//! this store. The clock is explicit so modification timestamps are
//! deterministic.

use super::{
    AppliedChange, CreatedItem, DateComponents, GatewayError, ItemFields, ListOutcome,
    RemindersGateway, RemoteItem, UpdateOutcome, priority_to_gateway,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use taskbridge_core::types::{FieldKind, TaskStatus};

#[derive(Debug, Clone)]
struct StoredItem {
    item_id: String,
    external_id: Option<String>,
    title: String,
    due: Option<NaiveDate>,
    priority: u8,
    completed: bool,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// Fake gateway keyed by list id and item id.
#[derive(Debug)]
pub struct FakeGateway {
    lists: BTreeMap<String, Vec<StoredItem>>,
    failing_lists: BTreeSet<String>,
    clock: DateTime<Utc>,
    next_item: usize,
}

impl FakeGateway {
    pub fn new(clock: DateTime<Utc>) -> Self {
        Self {
            lists: BTreeMap::new(),
            failing_lists: BTreeSet::new(),
            clock,
            next_item: 0,
        }
    }

    /// Seeds one item and returns its item id.
    pub fn seed_item(
        &mut self,
        list_id: &str,
        title: &str,
        due: Option<NaiveDate>,
        completed: bool,
    ) -> String {
        self.next_item += 1;
        let item_id = format!("fake-{}", self.next_item);
        let external_id = Some(external_id_for(list_id, &item_id));
        self.lists
            .entry(list_id.to_string())
            .or_default()
            .push(StoredItem {
                item_id: item_id.clone(),
                external_id,
                title: title.to_string(),
                due,
                priority: 0,
                completed,
                created_at: self.clock,
                modified_at: self.clock,
            });
        item_id
    }

    /// Makes subsequent enumerations of `list_id` fail.
    pub fn fail_list(&mut self, list_id: &str) {
        self.failing_lists.insert(list_id.to_string());
    }

    /// Advances the deterministic clock.
    pub fn tick(&mut self, seconds: i64) {
        self.clock += ChronoDuration::seconds(seconds);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Current items of a list, for assertions.
    pub fn items_in(&self, list_id: &str) -> Vec<RemoteItem> {
        self.lists
            .get(list_id)
            .map(|items| items.iter().map(|i| to_remote(i, list_id)).collect())
            .unwrap_or_default()
    }

    fn find_stored(&mut self, item_id: &str, list_id: Option<&str>) -> Option<&mut StoredItem> {
        for (list, items) in self.lists.iter_mut() {
            if list_id.is_some_and(|wanted| wanted != list) {
                continue;
            }
            if let Some(item) = items.iter_mut().find(|i| i.item_id == item_id) {
                return Some(item);
            }
        }
        None
    }
}

fn external_id_for(list_id: &str, item_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{list_id}:{item_id}").as_bytes());
    format!("ext-{}", &hex::encode(hasher.finalize())[..12])
}

fn to_remote(item: &StoredItem, list_id: &str) -> RemoteItem {
    RemoteItem {
        item_id: item.item_id.clone(),
        external_id: item.external_id.clone(),
        list_id: list_id.to_string(),
        title: item.title.clone(),
        notes: None,
        due: item.due.map(DateComponents::from_date),
        priority: item.priority,
        completed: item.completed,
        created_at: Some(item.created_at),
        modified_at: Some(item.modified_at),
    }
}

fn date_string(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

impl RemindersGateway for FakeGateway {
    fn list_items(&mut self, list_ids: &[String]) -> ListOutcome {
        let mut outcome = ListOutcome::default();
        for list_id in list_ids {
            if self.failing_lists.contains(list_id) {
                outcome
                    .errors
                    .insert(list_id.clone(), "list unavailable".to_string());
                continue;
            }
            if let Some(items) = self.lists.get(list_id) {
                outcome
                    .items
                    .extend(items.iter().map(|i| to_remote(i, list_id)));
            }
        }
        outcome
    }

    fn find_item(
        &mut self,
        item_id: &str,
        list_id: Option<&str>,
    ) -> Result<Option<RemoteItem>, GatewayError> {
        let found = self
            .lists
            .iter()
            .filter(|(list, _)| list_id.is_none_or(|wanted| wanted == list.as_str()))
            .find_map(|(list, items)| {
                items
                    .iter()
                    .find(|i| i.item_id == item_id)
                    .map(|i| to_remote(i, list))
            });
        Ok(found)
    }

    fn create_item(
        &mut self,
        list_id: &str,
        fields: &ItemFields,
    ) -> Result<CreatedItem, GatewayError> {
        self.next_item += 1;
        let item_id = format!("fake-{}", self.next_item);
        let external_id = Some(external_id_for(list_id, &item_id));
        let created_at = self.clock;
        self.lists
            .entry(list_id.to_string())
            .or_default()
            .push(StoredItem {
                item_id: item_id.clone(),
                external_id: external_id.clone(),
                title: fields.title.clone().unwrap_or_default(),
                due: fields.due.flatten(),
                priority: fields.priority.map(priority_to_gateway).unwrap_or(0),
                completed: fields.status == Some(TaskStatus::Done),
                created_at,
                modified_at: created_at,
            });
        Ok(CreatedItem {
            item_id,
            external_id,
            list_id: list_id.to_string(),
            created_at,
        })
    }

    fn update_item(
        &mut self,
        item_id: &str,
        fields: &ItemFields,
        dry_run: bool,
    ) -> Result<UpdateOutcome, GatewayError> {
        let clock = self.clock;
        let Some(item) = self.find_stored(item_id, None) else {
            return Err(GatewayError::ItemNotFound(item_id.to_string()));
        };

        let mut outcome = UpdateOutcome::default();

        if let Some(new_title) = &fields.title {
            if *new_title != item.title {
                outcome.applied.push(AppliedChange {
                    field: FieldKind::Title,
                    old_value: Some(item.title.clone()),
                    new_value: Some(new_title.clone()),
                });
                if !dry_run {
                    item.title = new_title.clone();
                }
            }
        }
        if let Some(new_status) = fields.status {
            let new_completed = new_status == TaskStatus::Done;
            if new_completed != item.completed {
                outcome.applied.push(AppliedChange {
                    field: FieldKind::Status,
                    old_value: Some(if item.completed { "done" } else { "todo" }.to_string()),
                    new_value: Some(if new_completed { "done" } else { "todo" }.to_string()),
                });
                if !dry_run {
                    item.completed = new_completed;
                }
            }
        }
        if let Some(new_due) = fields.due {
            if new_due != item.due {
                outcome.applied.push(AppliedChange {
                    field: FieldKind::Due,
                    old_value: date_string(item.due),
                    new_value: date_string(new_due),
                });
                if !dry_run {
                    item.due = new_due;
                }
            }
        }
        if let Some(new_priority) = fields.priority {
            let raw = priority_to_gateway(new_priority);
            if raw != item.priority {
                outcome.applied.push(AppliedChange {
                    field: FieldKind::Priority,
                    old_value: Some(item.priority.to_string()),
                    new_value: Some(raw.to_string()),
                });
                if !dry_run {
                    item.priority = raw;
                }
            }
        }

        if !dry_run && !outcome.applied.is_empty() {
            item.modified_at = clock;
        }
        Ok(outcome)
    }

    fn delete_item(&mut self, item_id: &str) -> Result<bool, GatewayError> {
        for items in self.lists.values_mut() {
            let before = items.len();
            items.retain(|i| i.item_id != item_id);
            if items.len() < before {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
