//! The reconcile pipeline.
//!
//! One run is a fixed stage graph: index both sides → rebuild the link set
//! → plan field updates → apply → create counterparts → retire duplicates →
//! persist artifacts. Every stage leaves a durable artifact behind and the
//! run is cancellable between stages and between per-link operations.

use crate::changeset::{
    CHANGESET_FILE, Changeset, CreationRecord, MarkdownEditRecord, MarkdownRetirementRecord,
    ReminderEditRecord, ReminderRetirementRecord, RollbackReport, line_sha,
};
use crate::config::SyncConfig;
use crate::gateway::{GatewayError, ItemFields, RemindersGateway};
use crate::index_store::{self, MARKDOWN_INDEX_FILE, REMINDERS_INDEX_FILE};
use crate::link_store::{self, LINK_FILE};
use crate::reminders;
use crate::safe_io::{FileLock, SafeIoError};
use crate::vault::{self, FileMutation, ParseCache};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use taskbridge_core::domain::identity;
use taskbridge_core::domain::matching::{MatchAlgorithm, MatchOptions, rebuild_links};
use taskbridge_core::domain::reconcile::{Direction, FieldUpdate, SyncPlan, build_plan};
use taskbridge_core::domain::taskline::{self, LineEdit};
use taskbridge_core::domain::{duplicates, identity::content_digest};
use taskbridge_core::types::{
    FieldKind, FieldValue, Link, Origin, SyncDirection, Task, TaskId, TaskIndex, TaskLocation,
    TaskStatus,
};
use thiserror::Error;

pub const PARSE_CACHE_FILE: &str = "parse_cache.json";

/// Catastrophic failures that abort the run. Everything else degrades.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state directory {path} is unusable: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not lock state directory: {0}")]
    Lock(#[source] SafeIoError),

    #[error("changeset persistence failed: {0}")]
    Changeset(#[source] SafeIoError),
}

/// Cooperative cancellation shared with the caller; checked between stages
/// and between per-link operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Which directions the counterpart creator runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDirection {
    MdToRem,
    RemToMd,
    Both,
}

impl CreateDirection {
    fn includes_md_to_rem(self) -> bool {
        matches!(self, CreateDirection::MdToRem | CreateDirection::Both)
    }

    fn includes_rem_to_md(self) -> bool {
        matches!(self, CreateDirection::RemToMd | CreateDirection::Both)
    }
}

/// Picks the file that receives a rem→md creation.
pub type DestinationFn = fn(&Path, NaiveDate) -> PathBuf;

/// Default destination policy: a `{today}.md` daily note at the vault root.
pub fn daily_note_destination(vault_root: &Path, today: NaiveDate) -> PathBuf {
    vault_root.join(format!("{}.md", today.format("%Y-%m-%d")))
}

/// Options for the counterpart-creation stage.
#[derive(Debug, Clone)]
pub struct CounterpartOptions {
    pub direction: CreateDirection,
    /// Write a block anchor to the markdown line before creating its
    /// reminder, so future runs match by identity rather than by content.
    pub write_anchors: bool,
    pub destination: DestinationFn,
}

impl Default for CounterpartOptions {
    fn default() -> Self {
        Self {
            direction: CreateDirection::Both,
            write_anchors: true,
            destination: daily_note_destination,
        }
    }
}

/// Options for one reconcile run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Apply the plan; false returns the plan without mutating anything.
    pub apply: bool,
    pub algorithm: MatchAlgorithm,
    /// Counterpart creation, when enabled.
    pub counterparts: Option<CounterpartOptions>,
    /// Run the duplicate detector.
    pub dedupe: bool,
    pub cancel: CancelFlag,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            apply: false,
            algorithm: MatchAlgorithm::Hungarian,
            counterparts: None,
            dedupe: false,
            cancel: CancelFlag::new(),
        }
    }
}

/// Aggregated mutation counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationCounters {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Process-level outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Clean,
    Partial,
    Failed,
}

/// Everything a caller learns from one run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub md_task_count: usize,
    pub rem_task_count: usize,
    pub link_count: usize,
    pub retired_link_count: usize,
    pub plan: SyncPlan,
    pub counters: MutationCounters,
    pub created_md_to_rem: usize,
    pub created_rem_to_md: usize,
    pub retired_md_duplicates: usize,
    pub retired_rem_duplicates: usize,
    pub anomalies: Vec<String>,
    pub disposition: Disposition,
    pub cancelled: bool,
}

/// Mutable state threaded through the stages of one run.
struct RunState {
    now: DateTime<Utc>,
    today: NaiveDate,
    md_index: TaskIndex,
    rem_index: TaskIndex,
    links: Vec<Link>,
    retired_link_count: usize,
    err_lists: BTreeSet<String>,
    changeset: Changeset,
    counters: MutationCounters,
    anomalies: Vec<String>,
    created_md_to_rem: usize,
    created_rem_to_md: usize,
    retired_md_duplicates: usize,
    retired_rem_duplicates: usize,
    cancelled: bool,
    /// Guard against clobbering good artifacts when a run is cancelled
    /// before the corresponding stage produced data.
    reminders_indexed: bool,
    links_rebuilt: bool,
}

impl RunState {
    fn anomaly(&mut self, message: String) {
        tracing::warn!("{message}");
        self.anomalies.push(message);
    }

    fn mark_link_synced(&mut self, md_id: &TaskId, rem_id: &TaskId, direction: SyncDirection) {
        let now = self.now;
        if let Some(link) = self
            .links
            .iter_mut()
            .find(|l| &l.md_id == md_id && &l.rem_id == rem_id)
        {
            link.last_synced_at = Some(now);
            link.last_sync_direction = match (link.last_sync_direction, direction) {
                (SyncDirection::None, d) => d,
                (current, d) if current == d => current,
                _ => SyncDirection::Both,
            };
        }
    }
}

/// Retries a gateway call once on a transient failure.
fn gateway_retry<T>(
    mut call: impl FnMut() -> Result<T, GatewayError>,
) -> Result<T, GatewayError> {
    match call() {
        Err(err) if err.is_transient() => {
            tracing::debug!("transient gateway failure, retrying: {err}");
            call()
        }
        other => other,
    }
}

/// One markdown line edit waiting to be collapsed into a file rewrite.
struct PendingMdEdit {
    file: PathBuf,
    line: usize,
    edit: LineEdit,
    md_id: TaskId,
    rem_id: TaskId,
    fields: Vec<FieldKind>,
}

/// Drives full reconcile runs for one configuration.
pub struct SyncEngine<'a> {
    config: &'a SyncConfig,
}

impl<'a> SyncEngine<'a> {
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    fn state_path(&self, file: &str) -> PathBuf {
        self.config.state_dir.join(file)
    }

    fn vault_root(&self, vault_name: &str) -> Option<&Path> {
        self.config
            .vaults
            .iter()
            .find(|v| v.name == vault_name)
            .map(|v| v.path.as_path())
    }

    fn absolute_md_path(&self, location: &TaskLocation) -> Option<(PathBuf, usize)> {
        let TaskLocation::Markdown { vault, path, line } = location else {
            return None;
        };
        Some((self.vault_root(vault)?.join(path), *line))
    }

    /// Runs the pipeline end to end.
    pub fn run(
        &self,
        gateway: &mut dyn RemindersGateway,
        options: &RunOptions,
    ) -> Result<RunReport, EngineError> {
        fs::create_dir_all(&self.config.state_dir).map_err(|e| EngineError::StateDir {
            path: self.config.state_dir.clone(),
            source: e,
        })?;
        let run_id = crate::safe_io::generate_run_id();
        let _lock = FileLock::acquire(
            &self.state_path("sync"),
            Duration::from_secs(self.config.lock_timeout_secs),
        )
        .map_err(EngineError::Lock)?;

        let now = Utc::now();
        let cap = self.config.json_size_cap_bytes;
        let previous_md = index_store::load_index(&self.state_path(MARKDOWN_INDEX_FILE), cap);
        let previous_rem = index_store::load_index(&self.state_path(REMINDERS_INDEX_FILE), cap);
        let mut cache = ParseCache::load(&self.state_path(PARSE_CACHE_FILE), cap);

        let mut state = RunState {
            now,
            today: now.date_naive(),
            md_index: TaskIndex::new(&run_id, now),
            rem_index: TaskIndex::new(&run_id, now),
            links: Vec::new(),
            retired_link_count: 0,
            err_lists: BTreeSet::new(),
            changeset: Changeset::new(&run_id, now),
            counters: MutationCounters::default(),
            anomalies: Vec::new(),
            created_md_to_rem: 0,
            created_rem_to_md: 0,
            retired_md_duplicates: 0,
            retired_rem_duplicates: 0,
            cancelled: false,
            reminders_indexed: false,
            links_rebuilt: false,
        };

        tracing::debug!("run {run_id}: indexing markdown vaults");
        state.md_index = vault::collect_markdown_index(
            &self.config.vaults,
            &self.config.exclude_dirs,
            &mut cache,
            previous_md.as_ref(),
            &run_id,
            now,
        );
        self.persist_index(MARKDOWN_INDEX_FILE, &state.md_index, &mut state.anomalies);
        cache.retain_existing();

        if !options.cancel.is_cancelled() {
            tracing::debug!("run {run_id}: indexing reminders lists");
            state.rem_index = reminders::collect_reminders_index(
                gateway,
                &self.config.lists,
                previous_rem.as_ref(),
                &run_id,
                now,
            );
            state.err_lists = state
                .rem_index
                .meta
                .list_errors
                .iter()
                .map(|e| e.list_id.clone())
                .collect();
            state.reminders_indexed = true;
            self.persist_index(REMINDERS_INDEX_FILE, &state.rem_index, &mut state.anomalies);
        }

        let match_options = MatchOptions {
            min_score: self.config.min_score,
            days_tolerance: self.config.days_tolerance,
            include_completed: self.config.include_completed_in_matching,
            algorithm: options.algorithm,
        };

        if !options.cancel.is_cancelled() {
            tracing::debug!("run {run_id}: rebuilding link set");
            let existing = link_store::load_links(&self.state_path(LINK_FILE), cap);
            let rebuild = rebuild_links(
                &state.md_index,
                &state.rem_index,
                existing,
                &match_options,
                now,
            );
            state.links = rebuild.links;
            state.retired_link_count = rebuild.retired.len();
            state.links_rebuilt = true;
        }

        let plan = build_plan(&state.md_index, &state.rem_index, &state.links);

        if options.apply && !options.cancel.is_cancelled() {
            self.apply_plan(gateway, &mut state, &plan, &options.cancel);
            if let Some(counterparts) = &options.counterparts {
                if !options.cancel.is_cancelled() {
                    self.create_counterparts(gateway, &mut state, counterparts, &options.cancel);
                }
            }
            if options.dedupe && !options.cancel.is_cancelled() {
                self.retire_duplicates(gateway, &mut state, &options.cancel);
            }
        }
        state.cancelled = options.cancel.is_cancelled();

        // Persist the final artifacts. Only a changeset that cannot be
        // written is fatal: everything else is re-derivable next run.
        self.persist_index(MARKDOWN_INDEX_FILE, &state.md_index, &mut state.anomalies);
        if state.reminders_indexed {
            self.persist_index(REMINDERS_INDEX_FILE, &state.rem_index, &mut state.anomalies);
        }
        if state.links_rebuilt {
            if let Err(err) = link_store::save_links(
                &self.state_path(LINK_FILE),
                &state.links,
                &run_id,
                self.config.min_score,
                options.algorithm,
                now,
            ) {
                state.anomaly(format!("link persistence failed: {err}"));
                state.counters.failed += 1;
            }
        }
        if options.apply && !state.changeset.is_empty() {
            state
                .changeset
                .save(&self.state_path(CHANGESET_FILE))
                .map_err(EngineError::Changeset)?;
        }
        if let Err(err) = cache.save(&self.state_path(PARSE_CACHE_FILE)) {
            tracing::warn!("parse cache persistence failed: {err}");
        }

        let disposition = if state.counters.failed > 0 {
            Disposition::Partial
        } else {
            Disposition::Clean
        };
        Ok(RunReport {
            run_id,
            md_task_count: state.md_index.tasks.len(),
            rem_task_count: state.rem_index.tasks.len(),
            link_count: state.links.len(),
            retired_link_count: state.retired_link_count,
            plan,
            counters: state.counters,
            created_md_to_rem: state.created_md_to_rem,
            created_rem_to_md: state.created_rem_to_md,
            retired_md_duplicates: state.retired_md_duplicates,
            retired_rem_duplicates: state.retired_rem_duplicates,
            anomalies: state.anomalies,
            disposition,
            cancelled: state.cancelled,
        })
    }

    /// Rolls back the most recent persisted changeset.
    pub fn rollback_last(&self) -> Option<RollbackReport> {
        Changeset::load(
            &self.state_path(CHANGESET_FILE),
            self.config.json_size_cap_bytes,
        )
        .map(|cs| cs.rollback())
    }

    fn persist_index(&self, file: &str, index: &TaskIndex, anomalies: &mut Vec<String>) {
        if let Err(err) = index_store::save_index(&self.state_path(file), index, &index.meta.run_id)
        {
            let message = format!("failed to persist {file}: {err}");
            tracing::warn!("{message}");
            anomalies.push(message);
        }
    }

    fn apply_plan(
        &self,
        gateway: &mut dyn RemindersGateway,
        state: &mut RunState,
        plan: &SyncPlan,
        cancel: &CancelFlag,
    ) {
        // Group plan entries per link, preserving plan order.
        let mut groups: Vec<((TaskId, TaskId), Vec<&FieldUpdate>)> = Vec::new();
        for update in &plan.updates {
            let key = (update.md_id.clone(), update.rem_id.clone());
            match groups.last_mut() {
                Some((last_key, updates)) if *last_key == key => updates.push(update),
                _ => groups.push((key, vec![update])),
            }
        }

        let mut pending_md: Vec<PendingMdEdit> = Vec::new();
        for ((md_id, rem_id), updates) in groups {
            if cancel.is_cancelled() {
                return;
            }
            match updates[0].direction {
                Direction::RemToMd => {
                    self.stage_markdown_edit(state, &md_id, &rem_id, &updates, &mut pending_md);
                }
                Direction::MdToRem => {
                    self.push_reminder_update(gateway, state, &md_id, &rem_id, &updates);
                }
            }
        }
        self.flush_markdown_edits(state, pending_md);
    }

    /// Converts one link's rem→md updates into a pending line edit.
    fn stage_markdown_edit(
        &self,
        state: &mut RunState,
        md_id: &TaskId,
        rem_id: &TaskId,
        updates: &[&FieldUpdate],
        pending: &mut Vec<PendingMdEdit>,
    ) {
        let Some(task) = state.md_index.get(md_id) else {
            return;
        };
        let Some((file, line)) = self.absolute_md_path(&task.location) else {
            state.anomaly(format!("task {md_id} has no resolvable vault path"));
            state.counters.failed += updates.len();
            return;
        };
        let mut edit = LineEdit::default();
        let mut fields = Vec::new();
        for update in updates {
            fields.push(update.field);
            match (&update.field, &update.new) {
                (FieldKind::Title, FieldValue::Text(title)) => edit.title = Some(title.clone()),
                (FieldKind::Status, FieldValue::Status(status)) => {
                    edit.status = Some(*status);
                    edit.done_on = Some(match status {
                        TaskStatus::Done => Some(state.today),
                        TaskStatus::Todo => None,
                    });
                }
                (FieldKind::Due, FieldValue::Date(due)) => edit.due = Some(*due),
                (FieldKind::Priority, FieldValue::Priority(priority)) => {
                    edit.priority = Some(*priority)
                }
                _ => {}
            }
        }
        pending.push(PendingMdEdit {
            file,
            line,
            edit,
            md_id: md_id.clone(),
            rem_id: rem_id.clone(),
            fields,
        });
    }

    /// Applies all staged markdown edits, one atomic rewrite per file.
    fn flush_markdown_edits(&self, state: &mut RunState, pending: Vec<PendingMdEdit>) {
        let mut by_file: BTreeMap<PathBuf, Vec<PendingMdEdit>> = BTreeMap::new();
        for edit in pending {
            by_file.entry(edit.file.clone()).or_default().push(edit);
        }

        for (file, edits) in by_file {
            let text = match fs::read(&file) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    for edit in &edits {
                        state.counters.failed += edit.fields.len();
                    }
                    state.anomaly(format!("cannot read {}: {err}", file.display()));
                    continue;
                }
            };
            let lines: Vec<&str> = text.lines().collect();

            let mut mutations: Vec<FileMutation> = Vec::new();
            let mut mutation_sources: HashMap<usize, &PendingMdEdit> = HashMap::new();
            for edit in &edits {
                let Some(original) = edit.line.checked_sub(1).and_then(|i| lines.get(i)) else {
                    state.counters.failed += edit.fields.len();
                    state.anomaly(format!(
                        "line {} vanished from {}",
                        edit.line,
                        file.display()
                    ));
                    continue;
                };
                match taskline::rewrite_line(original, &edit.edit) {
                    Some(new) if new != *original => {
                        mutation_sources.insert(edit.line, edit);
                        mutations.push(FileMutation::ReplaceLine {
                            line: edit.line,
                            original: (*original).to_string(),
                            new,
                        });
                    }
                    Some(_) => {
                        // Already in the desired state.
                        state.counters.skipped += edit.fields.len();
                    }
                    None => {
                        state.counters.failed += edit.fields.len();
                        state.anomaly(format!(
                            "{}:{} no longer parses as a task",
                            file.display(),
                            edit.line
                        ));
                    }
                }
            }
            if mutations.is_empty() {
                continue;
            }

            match vault::apply_file_mutations(&file, &mutations) {
                Ok(report) => {
                    for applied in &report.applied {
                        let FileMutation::ReplaceLine { line, original, new } = &applied.mutation
                        else {
                            continue;
                        };
                        state.changeset.markdown_edits.push(MarkdownEditRecord {
                            file: file.clone(),
                            line: *line,
                            original: original.clone(),
                            new: new.clone(),
                            sha_before: line_sha(original),
                            sha_after: line_sha(new),
                        });
                        if let Some(edit) = mutation_sources.get(line) {
                            state.counters.applied += edit.fields.len();
                            let md_id = edit.md_id.clone();
                            let rem_id = edit.rem_id.clone();
                            let line_edit = edit.edit.clone();
                            update_md_task(state, &md_id, &line_edit);
                            state.mark_link_synced(&md_id, &rem_id, SyncDirection::RemToMd);
                        }
                    }
                    for failed in &report.failed {
                        let FileMutation::ReplaceLine { line, .. } = &failed.mutation else {
                            continue;
                        };
                        if let Some(edit) = mutation_sources.get(line) {
                            state.counters.failed += edit.fields.len();
                        }
                        state.anomaly(format!(
                            "{}:{} {}",
                            file.display(),
                            line,
                            failed.reason
                        ));
                    }
                }
                Err(err) => {
                    for edit in &edits {
                        state.counters.failed += edit.fields.len();
                    }
                    state.anomaly(format!("rewrite of {} failed: {err}", file.display()));
                }
            }
        }
    }

    /// Pushes one link's md→rem updates through the gateway.
    fn push_reminder_update(
        &self,
        gateway: &mut dyn RemindersGateway,
        state: &mut RunState,
        md_id: &TaskId,
        rem_id: &TaskId,
        updates: &[&FieldUpdate],
    ) {
        let Some(task) = state.rem_index.get(rem_id) else {
            return;
        };
        let TaskLocation::Reminders { list_id, item_id } = task.location.clone() else {
            return;
        };
        if state.err_lists.contains(&list_id) {
            state.counters.skipped += updates.len();
            state.anomaly(format!(
                "list {list_id} failed to enumerate; leaving {rem_id} untouched"
            ));
            return;
        }

        let mut fields = ItemFields::default();
        for update in updates {
            match (&update.field, &update.new) {
                (FieldKind::Title, FieldValue::Text(title)) => fields.title = Some(title.clone()),
                (FieldKind::Status, FieldValue::Status(status)) => fields.status = Some(*status),
                (FieldKind::Due, FieldValue::Date(due)) => fields.due = Some(*due),
                (FieldKind::Priority, FieldValue::Priority(priority)) => {
                    fields.priority = Some(*priority)
                }
                _ => {}
            }
        }

        match gateway_retry(|| gateway.update_item(&item_id, &fields, false)) {
            Ok(outcome) => {
                for change in &outcome.applied {
                    state.changeset.reminders_edits.push(ReminderEditRecord {
                        item_id: item_id.clone(),
                        field: change.field,
                        old_value: change.old_value.clone(),
                        new_value: change.new_value.clone(),
                    });
                }
                state.counters.applied += outcome.applied.len();
                for error in &outcome.errors {
                    state.counters.failed += 1;
                    state.anomaly(format!(
                        "updating {item_id} field {:?}: {}",
                        error.field, error.message
                    ));
                }
                if !outcome.applied.is_empty() {
                    update_rem_task(state, rem_id, &fields);
                    state.mark_link_synced(md_id, rem_id, SyncDirection::MdToRem);
                }
            }
            Err(err) => {
                state.counters.failed += updates.len();
                state.anomaly(format!("updating {item_id}: {err}"));
                if !err.is_transient() {
                    state.anomaly(format!("item {item_id} is gone; link left for rebuild"));
                }
            }
        }
    }

    /// Creates counterparts for unlinked tasks, respecting direction, age
    /// and per-direction caps.
    fn create_counterparts(
        &self,
        gateway: &mut dyn RemindersGateway,
        state: &mut RunState,
        options: &CounterpartOptions,
        cancel: &CancelFlag,
    ) {
        if options.direction.includes_md_to_rem() {
            self.create_md_to_rem(gateway, state, options, cancel);
        }
        if options.direction.includes_rem_to_md() && !cancel.is_cancelled() {
            self.create_rem_to_md(state, options, cancel);
        }
    }

    fn eligible_for_creation(&self, state: &RunState, task: &Task) -> bool {
        if task.is_done() {
            return false;
        }
        let age_days = (state.now - task.created_at).num_days();
        age_days <= self.config.creation_age_days
    }

    fn create_md_to_rem(
        &self,
        gateway: &mut dyn RemindersGateway,
        state: &mut RunState,
        options: &CounterpartOptions,
        cancel: &CancelFlag,
    ) {
        let Some(list_id) = self.config.creation_list().map(str::to_string) else {
            state.anomaly("no creation list configured; skipping md→rem".to_string());
            return;
        };
        let linked: BTreeSet<TaskId> = state.links.iter().map(|l| l.md_id.clone()).collect();
        let candidates: Vec<TaskId> = state
            .md_index
            .tasks
            .values()
            .filter(|t| !linked.contains(&t.id) && self.eligible_for_creation(state, t))
            .map(|t| t.id.clone())
            .take(self.config.creation_caps.md_to_rem)
            .collect();

        for md_id in candidates {
            if cancel.is_cancelled() {
                return;
            }
            let md_id = if options.write_anchors {
                self.ensure_anchor(state, &md_id).unwrap_or(md_id)
            } else {
                md_id
            };
            let Some(task) = state.md_index.get(&md_id) else {
                continue;
            };
            let fields = ItemFields {
                title: Some(task.title.clone()),
                due: Some(task.due),
                priority: Some(task.priority),
                status: Some(task.status),
            };
            let (title, due, priority, status) =
                (task.title.clone(), task.due, task.priority, task.status);
            match gateway_retry(|| gateway.create_item(&list_id, &fields)) {
                Ok(created) => {
                    let rem_id = identity::reminders_id(
                        created.external_id.as_deref(),
                        &created.list_id,
                        Some(&created.item_id),
                        &title,
                        due,
                    );
                    let mut rem_task = Task::new(
                        rem_id.clone(),
                        Origin::Reminders,
                        &title,
                        status,
                        TaskLocation::Reminders {
                            list_id: created.list_id.clone(),
                            item_id: created.item_id.clone(),
                        },
                        created.created_at,
                        created.created_at,
                    );
                    rem_task.due = due;
                    rem_task.priority = priority;
                    rem_task.content_digest =
                        content_digest(&title, due, status == TaskStatus::Done, &[]);
                    let link = Link::new(md_id.clone(), rem_id.clone(), 1.0, state.now);
                    state.changeset.reminders_creations.push(CreationRecord {
                        task: rem_task.clone(),
                        link: link.clone(),
                        file: None,
                        line_text: None,
                    });
                    state.rem_index.insert(rem_task);
                    state.links.push(link);
                    state.counters.applied += 1;
                    state.created_md_to_rem += 1;
                }
                Err(err) => {
                    state.counters.failed += 1;
                    state.anomaly(format!("creating reminder for {md_id}: {err}"));
                }
            }
        }
    }

    /// Writes a block anchor onto an unanchored markdown task and re-keys
    /// it to the anchor-derived id. Returns the new id on success.
    fn ensure_anchor(&self, state: &mut RunState, md_id: &TaskId) -> Option<TaskId> {
        let task = state.md_index.get(md_id)?;
        let TaskLocation::Markdown { vault, path, line } = task.location.clone() else {
            return None;
        };
        let file = self.vault_root(&vault)?.join(&path);
        let text = fs::read_to_string(&file).ok()?;
        let anchor_edit = vault::plan_anchor_for_line(&text, line)?;

        let mutation = FileMutation::ReplaceLine {
            line: anchor_edit.line,
            original: anchor_edit.original.clone(),
            new: anchor_edit.new.clone(),
        };
        let report = vault::apply_file_mutations(&file, &[mutation]).ok()?;
        if report.applied.is_empty() {
            return None;
        }
        state.changeset.markdown_edits.push(MarkdownEditRecord {
            file: file.clone(),
            line: anchor_edit.line,
            original: anchor_edit.original.clone(),
            new: anchor_edit.new.clone(),
            sha_before: line_sha(&anchor_edit.original),
            sha_after: line_sha(&anchor_edit.new),
        });

        let new_id = TaskId::from(format!("{vault}/{}", anchor_edit.anchor));
        let mut task = state.md_index.remove(md_id)?;
        task.id = new_id.clone();
        state.md_index.insert(task);
        Some(new_id)
    }

    fn create_rem_to_md(
        &self,
        state: &mut RunState,
        options: &CounterpartOptions,
        cancel: &CancelFlag,
    ) {
        let Some(vault) = self.config.creation_vault().cloned() else {
            state.anomaly("no creation vault configured; skipping rem→md".to_string());
            return;
        };
        let destination = (options.destination)(&vault.path, state.today);
        let rel_path = destination
            .strip_prefix(&vault.path)
            .unwrap_or(&destination)
            .to_string_lossy()
            .replace('\\', "/");

        let linked: BTreeSet<TaskId> = state.links.iter().map(|l| l.rem_id.clone()).collect();
        let err_lists = state.err_lists.clone();
        let candidates: Vec<TaskId> = state
            .rem_index
            .tasks
            .values()
            .filter(|t| !linked.contains(&t.id) && self.eligible_for_creation(state, t))
            .filter(|t| match &t.location {
                TaskLocation::Reminders { list_id, .. } => !err_lists.contains(list_id),
                _ => false,
            })
            .map(|t| t.id.clone())
            .take(self.config.creation_caps.rem_to_md)
            .collect();
        if candidates.is_empty() {
            return;
        }

        let mut taken: BTreeSet<String> = fs::read_to_string(&destination)
            .ok()
            .map(|text| {
                taskline::extract_tasks(&text)
                    .into_iter()
                    .filter_map(|t| t.task.block_anchor)
                    .collect()
            })
            .unwrap_or_default();

        let mut emitted: Vec<(TaskId, String, String)> = Vec::new();
        let mut mutations: Vec<FileMutation> = Vec::new();
        for rem_id in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let Some(task) = state.rem_index.get(&rem_id) else {
                continue;
            };
            let anchor = loop {
                let candidate = identity::new_block_anchor();
                if !taken.contains(&candidate) {
                    break candidate;
                }
            };
            taken.insert(anchor.clone());
            let line = taskline::emit_task_line(
                &task.title,
                task.status,
                task.due,
                task.priority,
                task.done_on,
                &task.tags,
                Some(&anchor),
            );
            mutations.push(FileMutation::AppendLine { new: line.clone() });
            emitted.push((rem_id, anchor, line));
        }
        if mutations.is_empty() {
            return;
        }

        let report = match vault::apply_file_mutations(&destination, &mutations) {
            Ok(report) => report,
            Err(err) => {
                state.counters.failed += mutations.len();
                state.anomaly(format!(
                    "appending to {} failed: {err}",
                    destination.display()
                ));
                return;
            }
        };

        for applied in &report.applied {
            let FileMutation::AppendLine { new } = &applied.mutation else {
                continue;
            };
            let Some((rem_id, anchor, _)) = emitted.iter().find(|(_, _, line)| line == new)
            else {
                continue;
            };
            let Some(rem_task) = state.rem_index.get(rem_id).cloned() else {
                continue;
            };
            let md_id = TaskId::from(format!("{}/{anchor}", vault.name));
            let mut md_task = Task::new(
                md_id.clone(),
                Origin::Markdown,
                &rem_task.title,
                rem_task.status,
                TaskLocation::Markdown {
                    vault: vault.name.clone(),
                    path: rel_path.clone(),
                    line: applied.line,
                },
                state.now,
                state.now,
            );
            md_task.due = rem_task.due;
            md_task.priority = rem_task.priority;
            md_task.done_on = rem_task.done_on;
            md_task.tags = rem_task.tags.clone();
            md_task.content_digest = content_digest(
                &md_task.title,
                md_task.due,
                md_task.is_done(),
                &md_task.tags,
            );
            let link = Link::new(md_id.clone(), rem_id.clone(), 1.0, state.now);
            state.changeset.markdown_creations.push(CreationRecord {
                task: md_task.clone(),
                link: link.clone(),
                file: Some(destination.clone()),
                line_text: Some(new.clone()),
            });
            state.md_index.insert(md_task);
            state.links.push(link);
            state.counters.applied += 1;
            state.created_rem_to_md += 1;
        }
    }

    /// Retires near-identical tasks in both universes.
    fn retire_duplicates(
        &self,
        gateway: &mut dyn RemindersGateway,
        state: &mut RunState,
        cancel: &CancelFlag,
    ) {
        let linked_md: BTreeSet<TaskId> = state.links.iter().map(|l| l.md_id.clone()).collect();
        let linked_rem: BTreeSet<TaskId> = state.links.iter().map(|l| l.rem_id.clone()).collect();

        // Markdown side: line deletions, collapsed per file.
        let groups = duplicates::find_duplicates(&state.md_index, &linked_md);
        let mut deletions: BTreeMap<PathBuf, Vec<(TaskId, usize)>> = BTreeMap::new();
        for group in &groups {
            for id in &group.skipped_linked {
                state.anomaly(format!("duplicate {id} is linked; left in place"));
            }
            for id in &group.retire {
                let Some(task) = state.md_index.get(id) else {
                    continue;
                };
                match self.absolute_md_path(&task.location) {
                    Some((file, line)) => {
                        deletions.entry(file).or_default().push((id.clone(), line));
                    }
                    None => state.counters.skipped += 1,
                }
            }
        }
        for (file, targets) in deletions {
            if cancel.is_cancelled() {
                return;
            }
            let Ok(text) = fs::read_to_string(&file) else {
                state.counters.failed += targets.len();
                continue;
            };
            let lines: Vec<&str> = text.lines().collect();
            let mut mutations = Vec::new();
            let mut by_line: HashMap<usize, TaskId> = HashMap::new();
            for (id, line) in targets {
                let Some(original) = line.checked_sub(1).and_then(|i| lines.get(i)) else {
                    state.counters.skipped += 1;
                    continue;
                };
                by_line.insert(line, id);
                mutations.push(FileMutation::DeleteLine {
                    line,
                    original: (*original).to_string(),
                });
            }
            match vault::apply_file_mutations(&file, &mutations) {
                Ok(report) => {
                    for applied in &report.applied {
                        let FileMutation::DeleteLine { line, original } = &applied.mutation
                        else {
                            continue;
                        };
                        let Some(id) = by_line.get(line) else { continue };
                        state
                            .changeset
                            .markdown_retirements
                            .push(MarkdownRetirementRecord {
                                id: id.clone(),
                                file: file.clone(),
                                line: *line,
                                original: original.clone(),
                            });
                        state.md_index.remove(id);
                        state.counters.applied += 1;
                        state.retired_md_duplicates += 1;
                    }
                    state.counters.failed += report.failed.len();
                }
                Err(err) => {
                    state.counters.failed += mutations.len();
                    state.anomaly(format!("dedupe of {} failed: {err}", file.display()));
                }
            }
        }

        // Reminders side: gateway deletions, skipping errored lists.
        let err_lists = state.err_lists.clone();
        let groups = duplicates::find_duplicates(&state.rem_index, &linked_rem);
        for group in groups {
            for id in &group.skipped_linked {
                state.anomaly(format!("duplicate {id} is linked; left in place"));
            }
            for id in group.retire {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(task) = state.rem_index.get(&id) else {
                    continue;
                };
                let TaskLocation::Reminders { list_id, item_id } = task.location.clone() else {
                    continue;
                };
                if err_lists.contains(&list_id) {
                    state.counters.skipped += 1;
                    continue;
                }
                let title = task.title.clone();
                match gateway_retry(|| gateway.delete_item(&item_id)) {
                    Ok(true) => {
                        state
                            .changeset
                            .reminders_retirements
                            .push(ReminderRetirementRecord {
                                id: id.clone(),
                                item_id,
                                title,
                            });
                        state.rem_index.remove(&id);
                        state.counters.applied += 1;
                        state.retired_rem_duplicates += 1;
                    }
                    Ok(false) => {
                        state.counters.skipped += 1;
                        state.anomaly(format!("duplicate {id} already gone"));
                    }
                    Err(err) => {
                        state.counters.failed += 1;
                        state.anomaly(format!("deleting {id}: {err}"));
                    }
                }
            }
        }
    }
}

/// Applies a successful rem→md edit back onto the in-memory task record so
/// the persisted index reflects the file.
fn update_md_task(state: &mut RunState, md_id: &TaskId, edit: &LineEdit) {
    let Some(task) = state.md_index.tasks.get_mut(md_id) else {
        return;
    };
    if let Some(title) = &edit.title {
        task.title = title.clone();
    }
    if let Some(status) = edit.status {
        task.status = status;
    }
    if let Some(done_on) = edit.done_on {
        task.done_on = done_on;
    }
    if let Some(due) = edit.due {
        task.due = due;
    }
    if let Some(priority) = edit.priority {
        task.priority = priority;
    }
    task.content_digest =
        content_digest(&task.title, task.due, task.is_done(), &task.tags);
}

/// Applies a successful md→rem update onto the in-memory reminders record.
fn update_rem_task(state: &mut RunState, rem_id: &TaskId, fields: &ItemFields) {
    let Some(task) = state.rem_index.tasks.get_mut(rem_id) else {
        return;
    };
    if let Some(title) = &fields.title {
        task.title = title.clone();
    }
    if let Some(status) = fields.status {
        task.status = status;
    }
    if let Some(due) = fields.due {
        task.due = due;
    }
    if let Some(priority) = fields.priority {
        task.priority = priority;
    }
    task.modified_at = state.now;
    task.content_digest =
        content_digest(&task.title, task.due, task.is_done(), &task.tags);
}
