use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::drag::{self, DragSession, DropRejection};
use crate::error::ErrorCode;
use crate::history::HistoryStack;
use crate::model::codec;
use crate::model::{Forest, NewTask, TaskEdit, TaskId};
use crate::store::{
    LocalStore, RemoteDocument, RemoteEvent, RemoteStore, SetOptions, SnapshotSink, Subscription,
};
use crate::sync::state::{self, Backend, Effect, Facts, Identity, Phase};
use crate::tree::{self, TreeError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a mutation did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    fn not_loaded() -> Self {
        Self {
            code: ErrorCode::NotLoaded,
            message: "no identity resolved yet".to_string(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<TreeError> for Rejection {
    fn from(err: TreeError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<DropRejection> for Rejection {
    fn from(err: DropRejection) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// One failed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistFailure {
    pub code: ErrorCode,
    pub task_id: Option<TaskId>,
    pub message: String,
}

/// What persisting one change did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub backend: Backend,
    pub upserted: usize,
    pub deleted: usize,
    pub failures: Vec<PersistFailure>,
}

impl PersistReport {
    const fn new(backend: Backend) -> Self {
        Self {
            backend,
            upserted: 0,
            deleted: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a mutation entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The tree changed and was persisted (possibly with failures).
    Applied {
        task_id: Option<TaskId>,
        report: PersistReport,
    },
    /// The operation was valid but produced an identical tree.
    Unchanged,
    /// Undo or redo with an empty stack.
    Unavailable,
    /// A precondition failed; nothing changed.
    NoOp(Rejection),
}

impl MutationOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Id of the task the mutation created or touched.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Applied { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn report(&self) -> Option<&PersistReport> {
        match self {
            Self::Applied { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Result of a migration batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub user: String,
    pub attempted: usize,
    pub failures: Vec<PersistFailure>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owner of the authoritative task tree and its history.
///
/// Every mutation goes through one funnel: compute the new tree with a pure
/// tree operation, record the previous tree in history if it changed, swap
/// it in, then write it to whichever backend the current [`Phase`] selects.
/// Undo and redo use the same funnel without recording.
///
/// Remote writes are optimistic: the in-memory tree is never rolled back
/// when a write fails. The failure is returned in the [`PersistReport`] and
/// kept as [`SyncEngine::last_sync_error`].
pub struct SyncEngine<L, R> {
    config: SyncConfig,
    local: L,
    remote: R,
    clock: Arc<dyn Clock>,
    tasks: Forest,
    history: HistoryStack,
    phase: Phase,
    subscription: Option<Subscription>,
    inbox: Option<Receiver<RemoteEvent>>,
    last_sync_error: Option<PersistFailure>,
    last_migration: Option<MigrationReport>,
}

impl<L, R> fmt::Debug for SyncEngine<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("phase", &self.phase)
            .field("tasks", &tree::count(&self.tasks))
            .field("undo", &self.history.undo_len())
            .field("redo", &self.history.redo_len())
            .field("subscribed", &self.subscription.is_some())
            .finish_non_exhaustive()
    }
}

impl<L: LocalStore, R: RemoteStore> SyncEngine<L, R> {
    /// Build an engine. Nothing is loaded until the first identity event.
    ///
    /// # Errors
    ///
    /// Fails when `config` does not validate.
    pub fn new(config: SyncConfig, local: L, remote: R, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let history = HistoryStack::new(config.max_history);
        Ok(Self {
            config,
            local,
            remote,
            clock,
            tasks: Forest::new(),
            history,
            phase: Phase::Unloaded,
            subscription: None,
            inbox: None,
            last_sync_error: None,
            last_migration: None,
        })
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub const fn tasks(&self) -> &Forest {
        &self.tasks
    }

    #[must_use]
    pub const fn phase(&self) -> &Phase {
        &self.phase
    }

    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.phase.backend()
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.phase.is_loaded()
    }

    /// A migration batch is in flight.
    #[must_use]
    pub const fn is_syncing(&self) -> bool {
        matches!(self.phase, Phase::Migrating { .. })
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase.user().is_some()
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    #[must_use]
    pub const fn history(&self) -> &HistoryStack {
        &self.history
    }

    #[must_use]
    pub const fn last_sync_error(&self) -> Option<&PersistFailure> {
        self.last_sync_error.as_ref()
    }

    #[must_use]
    pub const fn last_migration(&self) -> Option<&MigrationReport> {
        self.last_migration.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub const fn local(&self) -> &L {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut L {
        &mut self.local
    }

    #[must_use]
    pub const fn remote(&self) -> &R {
        &self.remote
    }

    // -- identity -----------------------------------------------------------

    /// Feed an identity event. Runs the planned effects, including a full
    /// migration when one is due, and drains the first remote snapshot.
    pub fn on_identity(&mut self, identity: &Identity) -> &Phase {
        let facts = self.read_facts();
        let transition = state::plan(&self.phase, identity, facts);
        if transition.next != self.phase {
            tracing::info!(from = %self.phase, to = %transition.next, "sync phase change");
        }

        let mut next = transition.next;
        for effect in transition.effects {
            if let Effect::Migrate(user) = effect {
                self.phase = next.clone();
                let succeeded = self.migrate(&user);
                let follow = state::plan_after_migration(&user, succeeded);
                for effect in follow.effects {
                    self.run(effect);
                }
                next = follow.next;
            } else {
                self.run(effect);
            }
        }
        self.phase = next;

        if self.phase.backend() == Backend::Remote {
            self.pump_remote();
        }
        &self.phase
    }

    fn read_facts(&self) -> Facts {
        let keys = &self.config.keys;
        let migrated = self
            .read_local(&keys.migration_flag)
            .is_some_and(|flag| flag.trim() == "true");
        // Once loaded, memory holds tasks whose local write may have failed.
        let local_task_count = if self.phase.is_loaded() {
            tree::count(&self.tasks)
        } else {
            self.read_local(&keys.tasks)
                .map_or(0, |blob| tree::count(&codec::decode_tree(&blob, self.clock.now())))
        };
        Facts {
            migrated,
            local_task_count,
        }
    }

    fn run(&mut self, effect: Effect) {
        tracing::debug!(?effect, "sync effect");
        match effect {
            Effect::LoadLocal => self.load_local(),
            Effect::Unsubscribe => self.unsubscribe(),
            Effect::Migrate(user) => {
                self.migrate(&user);
            }
            Effect::MarkMigrated => {
                let key = self.config.keys.migration_flag.clone();
                self.write_local(&key, "true");
            }
            Effect::RemoveLocalTasks => {
                let key = self.config.keys.tasks.clone();
                self.remove_local(&key);
            }
            Effect::Subscribe(user) => self.subscribe(&user),
            Effect::ClearLocalSession => {
                let keys = self.config.keys.clone();
                self.remove_local(&keys.tasks);
                self.remove_local(&keys.migration_flag);
            }
            Effect::ResetTree => self.tasks = Forest::new(),
            Effect::ClearHistory => {
                self.history.clear();
                let keys = self.config.keys.clone();
                self.remove_local(&keys.undo_history);
                self.remove_local(&keys.redo_history);
            }
        }
    }

    fn load_local(&mut self) {
        let now = self.clock.now();
        let keys = &self.config.keys;
        self.tasks = self
            .read_local(&keys.tasks)
            .map(|blob| codec::decode_tree(&blob, now))
            .unwrap_or_default();
        let undo = self
            .read_local(&keys.undo_history)
            .map(|blob| codec::decode_history(&blob, now))
            .unwrap_or_default();
        let redo = self
            .read_local(&keys.redo_history)
            .map(|blob| codec::decode_history(&blob, now))
            .unwrap_or_default();
        self.history = HistoryStack::from_parts(self.config.max_history, undo, redo);
        tracing::info!(
            count = tree::count(&self.tasks),
            undo = self.history.undo_len(),
            redo = self.history.redo_len(),
            "local tasks loaded"
        );
    }

    /// Upsert every local task for `user`. Returns whether all succeeded.
    fn migrate(&mut self, user: &str) -> bool {
        let records = tree::to_records(&self.tasks);
        tracing::info!(user_id = %user, count = records.len(), "migration started");

        let mut failures = Vec::new();
        for record in &records {
            if let Err(err) = self.remote.upsert(user, record) {
                tracing::error!(user_id = %user, task_id = %record.id, error = %err, "migration upsert failed");
                failures.push(PersistFailure {
                    code: ErrorCode::MigrationFailed,
                    task_id: Some(record.id.clone()),
                    message: err.to_string(),
                });
            }
        }

        let succeeded = failures.is_empty();
        if succeeded {
            tracing::info!(user_id = %user, count = records.len(), "migration finished");
        } else {
            tracing::warn!(user_id = %user, failed = failures.len(), "migration incomplete, will retry");
            self.last_sync_error = failures.first().cloned();
        }
        self.last_migration = Some(MigrationReport {
            user: user.to_string(),
            attempted: records.len(),
            failures,
        });
        succeeded
    }

    fn subscribe(&mut self, user: &str) {
        self.unsubscribe();
        let (sink, inbox) = SnapshotSink::channel();
        match self.remote.subscribe(user, sink) {
            Ok(subscription) => {
                tracing::info!(user_id = %user, "remote subscription active");
                self.subscription = Some(subscription);
                self.inbox = Some(inbox);
            }
            Err(err) => {
                tracing::error!(user_id = %user, error = %err, "remote subscription failed");
                self.last_sync_error = Some(PersistFailure {
                    code: err.code(),
                    task_id: None,
                    message: err.to_string(),
                });
            }
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
            tracing::debug!("remote subscription disposed");
        }
        self.inbox = None;
    }

    /// Tear down the live subscription. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.unsubscribe();
    }

    // -- remote inbox -------------------------------------------------------

    /// Drain delivered remote events and apply the newest snapshot.
    /// Returns whether the tree changed.
    pub fn pump_remote(&mut self) -> bool {
        let mut latest = None;
        let mut broken = None;
        if let Some(inbox) = &self.inbox {
            loop {
                match inbox.try_recv() {
                    Ok(RemoteEvent::Snapshot(docs)) => latest = Some(docs),
                    Ok(RemoteEvent::Error(err)) => {
                        broken = Some(err);
                        break;
                    }
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }

        if let Some(err) = broken {
            // Tasks already shown are kept; only live updates stop.
            tracing::error!(error = %err, "remote subscription broke");
            self.last_sync_error = Some(PersistFailure {
                code: err.code(),
                task_id: None,
                message: err.to_string(),
            });
            self.unsubscribe();
        }

        match latest {
            Some(docs) => self.apply_remote_snapshot(&docs),
            None => false,
        }
    }

    /// Replace the tree with one rebuilt from a remote snapshot. Ignored
    /// unless the remote backend is active; malformed documents are skipped.
    pub fn apply_remote_snapshot(&mut self, docs: &[RemoteDocument]) -> bool {
        if self.phase.backend() != Backend::Remote {
            tracing::debug!(phase = %self.phase, "remote snapshot ignored");
            return false;
        }

        let records: Vec<_> = docs
            .iter()
            .filter_map(|doc| match codec::decode_record(&doc.id, &doc.data) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(task_id = %doc.id, error = %err, "malformed remote task skipped");
                    None
                }
            })
            .collect();
        let next = tree::build_forest(records, self.clock.now());
        tracing::debug!(docs = docs.len(), count = tree::count(&next), "remote snapshot received");

        if next == self.tasks {
            return false;
        }
        self.tasks = next;
        true
    }

    // -- mutations ----------------------------------------------------------

    /// Create a task from `draft`.
    pub fn add_task(&mut self, draft: NewTask) -> MutationOutcome {
        let now = self.clock.now();
        let task = match draft.into_task(now) {
            Ok(task) => task,
            Err(err) => return self.reject("add", None, err.into()),
        };
        let id = task.id.clone();
        self.mutate("add", Some(id), |tasks, at| tree::add_task(tasks, task, at).map_err(Into::into))
    }

    /// Replace title and description of `id`.
    pub fn edit_task(&mut self, id: &str, edit: &TaskEdit) -> MutationOutcome {
        let (title, description) = match edit.cleaned() {
            Ok(cleaned) => cleaned,
            Err(err) => return self.reject("edit", Some(id), err.into()),
        };
        self.mutate("edit", Some(id.to_string()), |tasks, at| {
            tree::edit_task(tasks, id, title, description, at).map_err(Into::into)
        })
    }

    /// Flip completion of `id`, cascading to its descendants.
    pub fn toggle_task(&mut self, id: &str) -> MutationOutcome {
        self.mutate("toggle", Some(id.to_string()), |tasks, at| {
            tree::toggle_completion(tasks, id, at).map_err(Into::into)
        })
    }

    /// Remove `id` and its subtree.
    pub fn delete_task(&mut self, id: &str) -> MutationOutcome {
        self.mutate("delete", Some(id.to_string()), |tasks, at| {
            tree::delete_task(tasks, id, at).map_err(Into::into)
        })
    }

    /// Drop `source` onto `target`.
    pub fn move_task(&mut self, source: &str, target: &str) -> MutationOutcome {
        self.mutate("move", Some(source.to_string()), |tasks, at| {
            drag::resolve_drop(tasks, source, target, at).map_err(Into::into)
        })
    }

    /// Finish an interactive drag. The session is cleared whatever happens;
    /// a missing target leaves the tree alone.
    pub fn end_drag(&mut self, session: &mut DragSession, target: Option<&str>) -> MutationOutcome {
        let source = session.active().map(str::to_string);
        session.cancel();
        match (source, target) {
            (Some(source), Some(target)) => self.move_task(&source, target),
            _ => MutationOutcome::Unchanged,
        }
    }

    /// Restore the previous snapshot.
    pub fn undo(&mut self) -> MutationOutcome {
        if !self.phase.is_loaded() {
            return MutationOutcome::NoOp(Rejection::not_loaded());
        }
        let stale = self.history.drop_stale_undo(&self.tasks);
        match self.history.undo(&self.tasks) {
            Some(previous) => self.commit(previous, None, false),
            None => self.exhausted("undo", stale),
        }
    }

    /// Re-apply the snapshot undone last.
    pub fn redo(&mut self) -> MutationOutcome {
        if !self.phase.is_loaded() {
            return MutationOutcome::NoOp(Rejection::not_loaded());
        }
        let stale = self.history.drop_stale_redo(&self.tasks);
        match self.history.redo(&self.tasks) {
            Some(next) => self.commit(next, None, false),
            None => self.exhausted("redo", stale),
        }
    }

    fn exhausted(&mut self, op: &'static str, stale: usize) -> MutationOutcome {
        if stale > 0 {
            tracing::debug!(op, stale, "snapshots equal to the current tree dropped");
            self.persist_history();
        }
        MutationOutcome::Unavailable
    }

    fn mutate<F>(&mut self, op: &'static str, task_id: Option<TaskId>, compute: F) -> MutationOutcome
    where
        F: FnOnce(&Forest, DateTime<Utc>) -> Result<Forest, Rejection>,
    {
        if !self.phase.is_loaded() {
            return self.reject(op, task_id.as_deref(), Rejection::not_loaded());
        }
        let now = self.clock.now();
        match compute(&self.tasks, now) {
            Ok(next) => self.commit(next, task_id, true),
            Err(rejection) => self.reject(op, task_id.as_deref(), rejection),
        }
    }

    fn reject(&self, op: &'static str, task_id: Option<&str>, rejection: Rejection) -> MutationOutcome {
        tracing::warn!(
            op,
            task_id = task_id.unwrap_or("-"),
            code = %rejection.code,
            reason = %rejection.message,
            "mutation ignored"
        );
        MutationOutcome::NoOp(rejection)
    }

    fn commit(&mut self, next: Forest, task_id: Option<TaskId>, record: bool) -> MutationOutcome {
        if next == self.tasks {
            return MutationOutcome::Unchanged;
        }
        let previous = std::mem::replace(&mut self.tasks, next);
        if record {
            self.history.record_if_changed(&previous, &self.tasks);
        }
        let report = self.persist(&previous);
        self.persist_history();
        MutationOutcome::Applied { task_id, report }
    }

    // -- persistence --------------------------------------------------------

    fn persist(&mut self, previous: &Forest) -> PersistReport {
        match self.phase.clone() {
            Phase::Remote { user } => self.persist_remote(&user, previous),
            _ => self.persist_local(),
        }
    }

    fn persist_local(&mut self) -> PersistReport {
        let mut report = PersistReport::new(Backend::Local);
        let key = self.config.keys.tasks.clone();
        match codec::encode_tree(&self.tasks) {
            Ok(blob) => {
                if let Some(failure) = self.write_local(&key, &blob) {
                    report.failures.push(failure);
                } else {
                    report.upserted = tree::count(&self.tasks);
                }
            }
            Err(err) => report.failures.push(PersistFailure {
                code: ErrorCode::InternalUnexpected,
                task_id: None,
                message: err.to_string(),
            }),
        }
        report
    }

    fn persist_remote(&mut self, user: &str, previous: &Forest) -> PersistReport {
        let mut report = PersistReport::new(Backend::Remote);
        let current = tree::all_ids(&self.tasks);
        let removed: BTreeSet<TaskId> = tree::all_ids(previous)
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();

        for id in &removed {
            match self.remote.delete(user, id) {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    tracing::error!(user_id = %user, task_id = %id, error = %err, "remote delete failed");
                    report.failures.push(PersistFailure {
                        code: err.code(),
                        task_id: Some(id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }
        for record in tree::to_records(&self.tasks) {
            match self.remote.upsert(user, &record) {
                Ok(()) => report.upserted += 1,
                Err(err) => {
                    tracing::error!(user_id = %user, task_id = %record.id, error = %err, "remote upsert failed");
                    report.failures.push(PersistFailure {
                        code: err.code(),
                        task_id: Some(record.id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(first) = report.failures.first() {
            self.last_sync_error = Some(first.clone());
        }
        report
    }

    fn persist_history(&mut self) {
        let keys = self.config.keys.clone();
        let undo = codec::encode_history(self.history.undo_entries());
        let redo = codec::encode_history(self.history.redo_entries());
        match (undo, redo) {
            (Ok(undo), Ok(redo)) => {
                self.write_local(&keys.undo_history, &undo);
                self.write_local(&keys.redo_history, &redo);
            }
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(error = %err, "history could not be encoded");
            }
        }
    }

    fn read_local(&self, key: &str) -> Option<String> {
        match self.local.get(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, code = %err.code(), error = %err, "local read failed");
                None
            }
        }
    }

    fn write_local(&mut self, key: &str, blob: &str) -> Option<PersistFailure> {
        let options = SetOptions::expiring_in(self.config.expires_in_days);
        let err = self.local.set(key, blob, options).err()?;
        tracing::warn!(key, code = %err.code(), error = %err, "local write failed");
        let failure = PersistFailure {
            code: err.code(),
            task_id: None,
            message: err.to_string(),
        };
        self.last_sync_error = Some(failure.clone());
        Some(failure)
    }

    fn remove_local(&mut self, key: &str) {
        if let Err(err) = self.local.remove(key) {
            tracing::warn!(key, code = %err.code(), error = %err, "local remove failed");
        }
    }
}
