//! End-to-end reconcile runs against a temporary vault and the in-memory
//! fake gateway.

use chrono::Utc;
use std::fs;
use std::path::Path;
use std::time::Duration;
use taskbridge_store::engine::{
    CounterpartOptions, CreateDirection, Disposition, RunOptions, SyncEngine,
    daily_note_destination,
};
use taskbridge_store::gateway::fake::FakeGateway;
use taskbridge_store::RemindersGateway;
use taskbridge_store::{ListConfig, SyncConfig, VaultConfig};

fn naive(s: &str) -> chrono::NaiveDate {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn setup(root: &Path) -> SyncConfig {
    let vault_dir = root.join("vault");
    fs::create_dir_all(&vault_dir).unwrap();
    let mut config = SyncConfig::minimal(
        VaultConfig {
            name: "vault".to_string(),
            path: vault_dir,
        },
        ListConfig {
            name: "Inbox".to_string(),
            identifier: "cal-1".to_string(),
        },
        root.join("state"),
    );
    config.min_score = 0.6;
    config
}

fn apply_options() -> RunOptions {
    RunOptions {
        apply: true,
        ..Default::default()
    }
}

/// Lets a subsequent file edit get a strictly newer mtime than the run
/// that preceded it, even on filesystems with coarse timestamps.
fn let_mtime_advance() {
    std::thread::sleep(Duration::from_millis(1100));
}

#[test]
fn simple_link_forms_and_plans_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    fs::write(
        config.vaults[0].path.join("daily.md"),
        "- [ ] Buy groceries 📅 2023-12-15 #personal\n",
    )
    .unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    gw.seed_item("cal-1", "Buy groceries today", Some(naive("2023-12-15")), false);

    let engine = SyncEngine::new(&config);
    let report = engine.run(&mut gw, &apply_options()).unwrap();

    assert_eq!(report.md_task_count, 1);
    assert_eq!(report.rem_task_count, 1);
    assert_eq!(report.link_count, 1);
    assert!(report.plan.is_empty(), "fresh link must plan zero mutations");
    assert_eq!(report.counters.applied, 0);
    assert_eq!(report.disposition, Disposition::Clean);

    // A second run over unchanged inputs applies nothing and keeps the link.
    let second = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(second.link_count, 1);
    assert!(second.plan.is_empty());
    assert_eq!(second.counters.applied, 0);
}

#[test]
fn title_propagates_md_to_rem() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("projects.md");
    fs::write(&file, "- [ ] Project plan 📅 2024-02-10 ^proj1\n").unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    gw.seed_item("cal-1", "Project plan draft", Some(naive("2024-02-10")), false);

    let engine = SyncEngine::new(&config);
    let first = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(first.link_count, 1);

    // Edit the markdown title after linking; the anchor keeps the identity.
    let_mtime_advance();
    fs::write(&file, "- [ ] Project plan v2 📅 2024-02-10 ^proj1\n").unwrap();

    let second = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(second.link_count, 1);
    assert_eq!(second.counters.applied, 1);
    assert_eq!(gw.items_in("cal-1")[0].title, "Project plan v2");
    // The markdown side is untouched.
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "- [ ] Project plan v2 📅 2024-02-10 ^proj1\n"
    );

    // Idempotence: a third run plans nothing.
    let third = engine.run(&mut gw, &apply_options()).unwrap();
    assert!(third.plan.is_empty());
    assert_eq!(third.counters.applied, 0);
}

#[test]
fn completed_reminder_back_propagates_status() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("invoices.md");
    fs::write(&file, "- [ ] Pay invoice 📅 2024-03-01 ^inv1\n").unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    let item_id = gw.seed_item("cal-1", "Pay invoice", Some(naive("2024-03-01")), false);

    let engine = SyncEngine::new(&config);
    let first = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(first.link_count, 1);

    // Complete the reminder after linking.
    gw.tick(3600);
    gw.update_item(
        &item_id,
        &taskbridge_store::ItemFields {
            status: Some(taskbridge_core::types::TaskStatus::Done),
            ..Default::default()
        },
        false,
    )
    .unwrap();

    let second = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(second.counters.applied, 1);
    let content = fs::read_to_string(&file).unwrap();
    assert!(
        content.starts_with("- [x] Pay invoice 📅 2024-03-01 ✅ "),
        "status flip must add a done date: {content:?}"
    );
    assert!(content.trim_end().ends_with("^inv1"), "anchor must survive");

    let third = engine.run(&mut gw, &apply_options()).unwrap();
    assert!(third.plan.is_empty(), "back-propagation must converge");
}

#[test]
fn duplicate_markdown_lines_are_retired() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("inbox.md");
    fs::write(
        &file,
        "- [ ] Call Alice #home\n- [ ] Keep me\n- [ ] Call Alice #home\n",
    )
    .unwrap();
    let mut gw = FakeGateway::new(Utc::now());

    let engine = SyncEngine::new(&config);
    let options = RunOptions {
        apply: true,
        dedupe: true,
        ..Default::default()
    };
    let report = engine.run(&mut gw, &options).unwrap();
    assert_eq!(report.retired_md_duplicates, 1);
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "- [ ] Call Alice #home\n- [ ] Keep me\n"
    );

    // The follow-up index contains only one such task.
    let second = engine.run(&mut gw, &options).unwrap();
    assert_eq!(second.retired_md_duplicates, 0);
    assert_eq!(second.md_task_count, 2);
}

#[test]
fn fenced_code_blocks_are_immune() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("notes.md");
    fs::write(&file, "```\n- [ ] not a task\n```\n- [ ] Real task ^r1\n").unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    let item_id = gw.seed_item("cal-1", "Real task", None, false);

    let engine = SyncEngine::new(&config);
    let first = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(first.md_task_count, 1, "fenced line must not index");
    assert_eq!(first.link_count, 1);

    gw.tick(3600);
    gw.update_item(
        &item_id,
        &taskbridge_store::ItemFields {
            status: Some(taskbridge_core::types::TaskStatus::Done),
            ..Default::default()
        },
        false,
    )
    .unwrap();
    engine.run(&mut gw, &apply_options()).unwrap();

    let content = fs::read_to_string(&file).unwrap();
    assert!(content.starts_with("```\n- [ ] not a task\n```\n"));
    assert!(content.contains("- [x] Real task"));
}

#[test]
fn creation_cap_bounds_md_to_rem() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = setup(tmp.path());
    config.creation_caps.md_to_rem = 3;
    let lines: String = (1..=10).map(|i| format!("- [ ] Task number {i}\n")).collect();
    fs::write(config.vaults[0].path.join("backlog.md"), lines).unwrap();
    let mut gw = FakeGateway::new(Utc::now());

    let engine = SyncEngine::new(&config);
    let options = RunOptions {
        apply: true,
        counterparts: Some(CounterpartOptions {
            direction: CreateDirection::MdToRem,
            write_anchors: false,
            destination: daily_note_destination,
        }),
        ..Default::default()
    };
    let report = engine.run(&mut gw, &options).unwrap();
    assert_eq!(report.created_md_to_rem, 3);
    assert_eq!(report.link_count, 3);
    assert_eq!(gw.items_in("cal-1").len(), 3);
    assert_eq!(report.md_task_count, 10, "the other 7 remain unlinked");
}

#[test]
fn rem_to_md_creation_writes_anchored_daily_note() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let mut gw = FakeGateway::new(Utc::now());
    gw.seed_item("cal-1", "Imported from reminders", Some(naive("2024-04-01")), false);

    let engine = SyncEngine::new(&config);
    let options = RunOptions {
        apply: true,
        counterparts: Some(CounterpartOptions {
            direction: CreateDirection::RemToMd,
            write_anchors: false,
            destination: daily_note_destination,
        }),
        ..Default::default()
    };
    let report = engine.run(&mut gw, &options).unwrap();
    assert_eq!(report.created_rem_to_md, 1);
    assert_eq!(report.link_count, 1);

    let today = Utc::now().date_naive();
    let note = config.vaults[0]
        .path
        .join(format!("{}.md", today.format("%Y-%m-%d")));
    let content = fs::read_to_string(&note).unwrap();
    assert!(content.contains("Imported from reminders"));
    assert!(content.contains("📅 2024-04-01"));
    assert!(content.contains(" ^t-"), "creation must carry a fresh anchor");

    // Nothing new on a second run: the pair is linked now.
    let second = engine.run(&mut gw, &options).unwrap();
    assert_eq!(second.created_rem_to_md, 0);
    assert_eq!(second.link_count, 1);
    assert!(second.plan.is_empty());
}

#[test]
fn anchor_write_back_keys_future_runs_by_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("todo.md");
    fs::write(&file, "- [ ] Needs an anchor\n").unwrap();
    let mut gw = FakeGateway::new(Utc::now());

    let engine = SyncEngine::new(&config);
    let options = RunOptions {
        apply: true,
        counterparts: Some(CounterpartOptions {
            direction: CreateDirection::MdToRem,
            write_anchors: true,
            destination: daily_note_destination,
        }),
        ..Default::default()
    };
    let report = engine.run(&mut gw, &options).unwrap();
    assert_eq!(report.created_md_to_rem, 1);

    let content = fs::read_to_string(&file).unwrap();
    assert!(
        content.starts_with("- [ ] Needs an anchor ^t-"),
        "anchor must be written back: {content:?}"
    );

    // The link survives re-indexing because the id is now anchor-derived.
    let second = engine.run(&mut gw, &options).unwrap();
    assert_eq!(second.created_md_to_rem, 0);
    assert_eq!(second.link_count, 1);
    assert!(second.plan.is_empty());
}

#[test]
fn errored_list_is_treated_as_opaque() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    fs::write(
        config.vaults[0].path.join("daily.md"),
        "- [ ] Shared task 📅 2024-05-01 ^s1\n",
    )
    .unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    gw.seed_item("cal-1", "Shared task", Some(naive("2024-05-01")), false);

    let engine = SyncEngine::new(&config);
    let first = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(first.link_count, 1);

    // The list goes dark; the link and its task must survive the outage.
    gw.fail_list("cal-1");
    let options = RunOptions {
        apply: true,
        dedupe: true,
        ..Default::default()
    };
    let second = engine.run(&mut gw, &options).unwrap();
    assert_eq!(second.rem_task_count, 1, "carried forward through the outage");
    assert_eq!(second.link_count, 1);
    assert_eq!(second.retired_rem_duplicates, 0);
}

#[test]
fn dry_run_returns_plan_without_mutating() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("plan.md");
    fs::write(&file, "- [ ] Draft report 📅 2024-06-01 ^d1\n").unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    let item_id = gw.seed_item("cal-1", "Draft report", Some(naive("2024-06-01")), false);

    let engine = SyncEngine::new(&config);
    engine.run(&mut gw, &apply_options()).unwrap();
    gw.tick(3600);
    gw.update_item(
        &item_id,
        &taskbridge_store::ItemFields {
            title: Some("Draft report final".into()),
            ..Default::default()
        },
        false,
    )
    .unwrap();

    let dry = engine.run(&mut gw, &RunOptions::default()).unwrap();
    assert_eq!(dry.plan.len(), 1);
    assert_eq!(dry.counters.applied, 0);
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "- [ ] Draft report 📅 2024-06-01 ^d1\n",
        "dry run must not touch the vault"
    );

    let wet = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(wet.counters.applied, 1);
    assert!(
        fs::read_to_string(&file)
            .unwrap()
            .contains("Draft report final")
    );
}

#[test]
fn changeset_rollback_restores_the_vault() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let file = config.vaults[0].path.join("work.md");
    let original = "- [ ] Review budget 📅 2024-07-01 ^b1\n";
    fs::write(&file, original).unwrap();
    let mut gw = FakeGateway::new(Utc::now());
    let item_id = gw.seed_item("cal-1", "Review budget", Some(naive("2024-07-01")), false);

    let engine = SyncEngine::new(&config);
    engine.run(&mut gw, &apply_options()).unwrap();
    gw.tick(3600);
    gw.update_item(
        &item_id,
        &taskbridge_store::ItemFields {
            status: Some(taskbridge_core::types::TaskStatus::Done),
            ..Default::default()
        },
        false,
    )
    .unwrap();
    let applied = engine.run(&mut gw, &apply_options()).unwrap();
    assert_eq!(applied.counters.applied, 1);
    assert_ne!(fs::read_to_string(&file).unwrap(), original);

    let report = engine.rollback_last().expect("a changeset was persisted");
    assert_eq!(report.restored, 1);
    assert_eq!(fs::read_to_string(&file).unwrap(), original);
}
