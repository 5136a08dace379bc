//! Reminders indexer: gateway enumeration into the common task shape.

use crate::config::ListConfig;
use crate::gateway::{RemindersGateway, RemoteItem, priority_from_gateway};
use chrono::{DateTime, Utc};
use taskbridge_core::domain::identity;
use taskbridge_core::types::{ListError, Origin, Task, TaskIndex, TaskLocation, TaskStatus};

/// Enumerates the configured lists and builds the reminders-side index.
///
/// Lists that fail to enumerate are recorded in `meta.list_errors`; their
/// previously-indexed tasks are carried forward so links into them are not
/// retired over an outage, and the engine never proposes mutations against
/// them.
pub fn collect_reminders_index(
    gateway: &mut dyn RemindersGateway,
    lists: &[ListConfig],
    previous: Option<&TaskIndex>,
    run_id: &str,
    now: DateTime<Utc>,
) -> TaskIndex {
    let list_ids: Vec<String> = lists.iter().map(|l| l.identifier.clone()).collect();
    let outcome = gateway.list_items(&list_ids);

    let mut index = TaskIndex::new(run_id, now);
    index.meta.source_count = lists.len();

    for item in &outcome.items {
        let task = task_from_item(item, previous, now);
        if index.contains(&task.id) {
            tracing::warn!(
                "duplicate reminders id {} from list {}; keeping the first",
                task.id,
                item.list_id
            );
            continue;
        }
        index.insert(task);
    }

    for (list_id, message) in &outcome.errors {
        tracing::warn!("list {} failed to enumerate: {}", list_id, message);
        index.meta.list_errors.push(ListError {
            list_id: list_id.clone(),
            message: message.clone(),
        });
        let Some(previous) = previous else { continue };
        for task in previous.tasks.values() {
            let TaskLocation::Reminders { list_id: home, .. } = &task.location else {
                continue;
            };
            if home == list_id && !index.contains(&task.id) {
                index.insert(task.clone());
            }
        }
    }

    index
}

fn task_from_item(item: &RemoteItem, previous: Option<&TaskIndex>, now: DateTime<Utc>) -> Task {
    let due = item.due.and_then(|components| components.to_date());
    let id = identity::reminders_id(
        item.external_id.as_deref(),
        &item.list_id,
        Some(&item.item_id),
        &item.title,
        due,
    );
    let status = if item.completed {
        TaskStatus::Done
    } else {
        TaskStatus::Todo
    };
    let modified_at = item.modified_at.unwrap_or(now);
    let created_at = previous
        .and_then(|index| index.get(&id))
        .map(|task| task.created_at)
        .or(item.created_at)
        .unwrap_or(now);

    let mut task = Task::new(
        id,
        Origin::Reminders,
        &item.title,
        status,
        TaskLocation::Reminders {
            list_id: item.list_id.clone(),
            item_id: item.item_id.clone(),
        },
        modified_at,
        created_at,
    );
    task.due = due;
    task.priority = priority_from_gateway(item.priority);
    task.content_digest = identity::content_digest(&item.title, due, item.completed, &[]);
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::FakeGateway;
    use chrono::{NaiveDate, TimeZone};

    fn lists(ids: &[&str]) -> Vec<ListConfig> {
        ids.iter()
            .map(|id| ListConfig {
                name: id.to_string(),
                identifier: id.to_string(),
            })
            .collect()
    }

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_items_become_common_tasks() {
        let mut gw = FakeGateway::new(clock());
        gw.seed_item(
            "cal-1",
            "Buy milk",
            NaiveDate::from_ymd_opt(2024, 1, 12),
            false,
        );
        let index =
            collect_reminders_index(&mut gw, &lists(&["cal-1"]), None, "run1", clock());
        assert_eq!(index.tasks.len(), 1);
        let task = index.tasks.values().next().unwrap();
        assert_eq!(task.origin, Origin::Reminders);
        assert_eq!(task.title, "Buy milk");
        assert_eq!(task.due, NaiveDate::from_ymd_opt(2024, 1, 12));
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.id.as_str().starts_with("rem-ext-"));
    }

    #[test]
    fn test_errored_list_carries_forward_previous_tasks() {
        let mut gw = FakeGateway::new(clock());
        gw.seed_item("cal-1", "Survivor", None, false);
        let first = collect_reminders_index(&mut gw, &lists(&["cal-1"]), None, "run1", clock());
        assert!(first.meta.list_errors.is_empty());

        gw.fail_list("cal-1");
        let second = collect_reminders_index(
            &mut gw,
            &lists(&["cal-1"]),
            Some(&first),
            "run2",
            clock(),
        );
        assert_eq!(second.meta.list_errors.len(), 1);
        assert_eq!(second.tasks.len(), 1, "outage must not drop known tasks");
    }

    #[test]
    fn test_created_at_carries_forward() {
        let mut gw = FakeGateway::new(clock());
        gw.seed_item("cal-1", "Stable", None, false);
        let first = collect_reminders_index(&mut gw, &lists(&["cal-1"]), None, "run1", clock());
        gw.tick(3600);
        let later = gw.now();
        let second = collect_reminders_index(
            &mut gw,
            &lists(&["cal-1"]),
            Some(&first),
            "run2",
            later,
        );
        let before = first.tasks.values().next().unwrap();
        let after = second.tasks.values().next().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, before.created_at);
    }
}
