//! Seeded driver that pushes one [`SyncEngine`] through random user actions,
//! identity changes, foreign writes, and injected store faults.

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use ladder_core::clock::{Clock, ManualClock};
use ladder_core::config::SyncConfig;
use ladder_core::drag::DragSession;
use ladder_core::model::{Forest, Level, NewTask, TaskEdit, TaskRecord, codec};
use ladder_core::store::{LocalStore, MemoryLocalStore, MemoryRemoteStore, RemoteFault, RemoteStore};
use ladder_core::sync::{Backend, Identity, MutationOutcome, Phase, SyncEngine};
use ladder_core::tree;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::faults::{FaultConfig, StepFaults};
use crate::oracle::{InvariantViolation, OracleResult, ShapePolicy, TreeOracle};
use crate::rng::DeterministicRng;

const GHOST_ID: &str = "ghost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub steps: u64,
    /// Distinct accounts the run signs in as.
    pub users: usize,
    pub start_millis: i64,
    pub tick_millis: i64,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 200,
            users: 2,
            start_millis: 1_700_000_000_000,
            tick_millis: 1_000,
            fault: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error when a parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        if self.users == 0 {
            bail!("users must be > 0");
        }
        if self.tick_millis <= 0 {
            bail!("tick_millis must be > 0");
        }
        Ok(())
    }
}

/// One scripted user or environment action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimAction {
    Add {
        task_id: String,
        level: Level,
        parent_id: Option<String>,
        blank_title: bool,
    },
    Edit { task_id: String },
    Toggle { task_id: String },
    Delete { task_id: String },
    Drag { source: String, target: Option<String> },
    Undo,
    Redo,
    UndoRedo,
    SignIn { user: String },
    SignOut,
    ForeignWrite { user: String, change: ForeignChange },
}

impl SimAction {
    const fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Edit { .. } => "edit",
            Self::Toggle { .. } => "toggle",
            Self::Delete { .. } => "delete",
            Self::Drag { .. } => "drag",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::UndoRedo => "undo_redo",
            Self::SignIn { .. } => "sign_in",
            Self::SignOut => "sign_out",
            Self::ForeignWrite { .. } => "foreign_write",
        }
    }
}

/// What another session does to a user's remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForeignChange {
    AddGoal { task_id: String },
    Retitle { task_id: String },
    DeleteLeaf { task_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: u64,
    pub action: SimAction,
    pub outcome: String,
    pub phase: String,
    pub task_count: usize,
    pub faults: StepFaults,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub violations: Vec<InvariantViolation>,
    pub final_task_count: usize,
    /// A fault actually changed behaviour at least once.
    pub interesting_state_reached: bool,
}

impl SimulationResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Stable fingerprint of the trace for quick replay comparison.
    #[must_use]
    pub fn trace_fingerprint(&self) -> u64 {
        self.trace.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, event| {
            let line = serde_json::to_string(event).unwrap_or_default();
            line.bytes()
                .fold(hash, |h, byte| (h ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3))
        })
    }
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    clock: Arc<ManualClock>,
    remote: MemoryRemoteStore,
    engine: SyncEngine<MemoryLocalStore, MemoryRemoteStore>,
    drag: DragSession,
    trace: Vec<TraceEvent>,
    result: OracleResult,
    local_dirty: bool,
    remote_dirty: bool,
    interesting: bool,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let clock = Arc::new(ManualClock::from_millis(config.start_millis));
        let remote = MemoryRemoteStore::new();
        let engine = SyncEngine::new(
            SyncConfig::default(),
            MemoryLocalStore::new(clock.clone()),
            remote.clone(),
            clock.clone(),
        )?;
        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            config,
            clock,
            remote,
            engine,
            drag: DragSession::new(),
            trace: Vec::new(),
            result: OracleResult::pass(),
            local_dirty: false,
            remote_dirty: false,
            interesting: false,
        })
    }

    /// Run every step and return the trace plus any violations.
    #[must_use]
    pub fn run(mut self) -> SimulationResult {
        tracing::debug!(seed = self.config.seed, steps = self.config.steps, "simulation started");
        self.engine.on_identity(&Identity::Anonymous);

        for step in 0..self.config.steps {
            self.clock.advance(Duration::milliseconds(self.config.tick_millis));
            let faults = self.draw_faults();
            self.inject(&faults);

            let action = self.choose_action(step);
            let outcome = self.perform(step, &action);
            self.engine.pump_remote();
            self.heal();
            self.check(step);

            self.trace.push(TraceEvent {
                step,
                action,
                outcome,
                phase: self.engine.phase().to_string(),
                task_count: tree::count(self.engine.tasks()),
                faults,
            });
        }

        self.engine.shutdown();
        let result = SimulationResult {
            seed: self.config.seed,
            final_task_count: tree::count(self.engine.tasks()),
            trace: self.trace,
            violations: self.result.violations,
            interesting_state_reached: self.interesting,
        };
        tracing::debug!(
            seed = result.seed,
            violations = result.violations.len(),
            "simulation finished"
        );
        result
    }

    // -- faults -------------------------------------------------------------

    fn draw_faults(&mut self) -> StepFaults {
        let fault = self.config.fault;
        let ids: Vec<String> = tree::flatten(self.engine.tasks())
            .into_iter()
            .map(|task| task.id.clone())
            .collect();
        StepFaults {
            remote_offline: self.rng.hit_rate_percent(fault.remote_offline_percent),
            rejected_task: if self.rng.hit_rate_percent(fault.remote_reject_percent) {
                self.rng.pick(&ids).cloned()
            } else {
                None
            },
            break_subscription: self.rng.hit_rate_percent(fault.subscription_break_percent),
            local_failing: self.rng.hit_rate_percent(fault.local_fail_percent),
        }
    }

    fn inject(&mut self, faults: &StepFaults) {
        self.remote.set_fault(RemoteFault {
            offline: faults.remote_offline,
            reject_ids: faults.rejected_task.iter().cloned().collect(),
        });
        self.engine.local_mut().set_failing(faults.local_failing);
        if faults.local_failing {
            self.local_dirty = true;
        }
        if faults.break_subscription && self.engine.is_subscribed() {
            self.remote.fail_subscriptions("simulated disconnect");
            self.interesting = true;
        }
    }

    fn heal(&mut self) {
        self.remote.set_fault(RemoteFault::default());
        self.engine.local_mut().set_failing(false);
    }

    // -- actions ------------------------------------------------------------

    fn task_ids(&self) -> Vec<String> {
        tree::flatten(self.engine.tasks())
            .into_iter()
            .map(|task| task.id.clone())
            .collect()
    }

    /// A random existing id, or an unknown one now and then.
    fn pick_id(&mut self) -> String {
        let ids = self.task_ids();
        if self.rng.hit_rate_percent(5) {
            return GHOST_ID.to_string();
        }
        self.rng.pick(&ids).cloned().unwrap_or_else(|| GHOST_ID.to_string())
    }

    fn user_name(&mut self) -> String {
        let index = self.rng.next_index(self.config.users).unwrap_or(0);
        format!("user-{index}")
    }

    fn choose_action(&mut self, step: u64) -> SimAction {
        // add, edit, toggle, delete, drag, undo, redo, undo_redo, sign_in, sign_out, foreign
        const WEIGHTS: [u32; 11] = [30, 8, 14, 8, 12, 7, 4, 3, 4, 2, 5];
        match self.rng.weighted(&WEIGHTS).unwrap_or(0) {
            0 => self.choose_add(step),
            1 => SimAction::Edit {
                task_id: self.pick_id(),
            },
            2 => SimAction::Toggle {
                task_id: self.pick_id(),
            },
            3 => SimAction::Delete {
                task_id: self.pick_id(),
            },
            4 => {
                let source = self.pick_id();
                let target = if self.rng.hit_rate_percent(5) {
                    None
                } else {
                    Some(self.pick_id())
                };
                SimAction::Drag { source, target }
            }
            5 => SimAction::Undo,
            6 => SimAction::Redo,
            7 => SimAction::UndoRedo,
            8 => SimAction::SignIn {
                user: self.user_name(),
            },
            9 => SimAction::SignOut,
            _ => self.choose_foreign(step),
        }
    }

    fn choose_add(&mut self, step: u64) -> SimAction {
        let task_id = format!("t{step}");
        let blank_title = self.rng.hit_rate_percent(3);
        let level = match self.rng.weighted(&[3, 4, 5]) {
            Some(1) => Level::Metric,
            Some(2) => Level::Action,
            _ => Level::Goal,
        };
        let candidates: Vec<String> = tree::parent_candidates(self.engine.tasks(), level)
            .into_iter()
            .map(|task| task.id.clone())
            .collect();
        match (level, self.rng.pick(&candidates).cloned()) {
            (Level::Goal, _) | (_, None) => SimAction::Add {
                task_id,
                level: Level::Goal,
                parent_id: None,
                blank_title,
            },
            (level, Some(parent)) => SimAction::Add {
                task_id,
                level,
                parent_id: Some(parent),
                blank_title,
            },
        }
    }

    fn choose_foreign(&mut self, step: u64) -> SimAction {
        let signed_in = match self.engine.phase() {
            Phase::Remote { user } => Some(user.clone()),
            _ => None,
        };
        let user = match signed_in {
            Some(user) => user,
            None => self.user_name(),
        };
        let docs = self.remote.documents(&user);
        let parents: Vec<String> = docs
            .iter()
            .filter_map(|doc| doc.data.get("parentId").and_then(|p| p.as_str()).map(str::to_string))
            .collect();
        let leaves: Vec<String> = docs
            .iter()
            .map(|doc| doc.id.clone())
            .filter(|id| !parents.contains(id))
            .collect();
        let all: Vec<String> = docs.iter().map(|doc| doc.id.clone()).collect();

        let change = match self.rng.next_bounded(3) {
            0 if !all.is_empty() => ForeignChange::Retitle {
                task_id: self.rng.pick(&all).cloned().unwrap_or_default(),
            },
            1 if !leaves.is_empty() => ForeignChange::DeleteLeaf {
                task_id: self.rng.pick(&leaves).cloned().unwrap_or_default(),
            },
            _ => ForeignChange::AddGoal {
                task_id: format!("f{step}"),
            },
        };
        SimAction::ForeignWrite { user, change }
    }

    fn perform(&mut self, step: u64, action: &SimAction) -> String {
        let before = self.engine.tasks().clone();
        let outcome = match action {
            SimAction::Add {
                task_id,
                level,
                parent_id,
                blank_title,
            } => {
                let title = if *blank_title { "   ".to_string() } else { format!("Task {step}") };
                let draft = match parent_id {
                    Some(parent) => NewTask::child(parent.clone(), *level, title),
                    None => NewTask::goal(title),
                };
                self.engine.add_task(draft.with_id(task_id.clone()))
            }
            SimAction::Edit { task_id } => {
                let description = (step % 2 == 0).then(|| format!("note {step}"));
                self.engine
                    .edit_task(task_id, &TaskEdit::new(format!("Edited {step}"), description))
            }
            SimAction::Toggle { task_id } => self.engine.toggle_task(task_id),
            SimAction::Delete { task_id } => self.engine.delete_task(task_id),
            SimAction::Drag { source, target } => {
                self.drag.start(source.clone());
                let _droppable = self.drag.over(self.engine.tasks(), target.as_deref());
                self.engine.end_drag(&mut self.drag, target.as_deref())
            }
            SimAction::Undo => self.engine.undo(),
            SimAction::Redo => self.engine.redo(),
            SimAction::UndoRedo => {
                let undone = self.engine.undo();
                self.note_outcome(&undone);
                if !undone.is_applied() {
                    return label(&undone);
                }
                let redone = self.engine.redo();
                self.note_outcome(&redone);
                if redone.is_applied() {
                    let round_trip = TreeOracle::check_round_trip(step, &before, self.engine.tasks());
                    self.absorb(round_trip);
                }
                return label(&redone);
            }
            SimAction::SignIn { user } => return self.identity(&Identity::Authenticated(user.clone())),
            SimAction::SignOut => return self.identity(&Identity::Anonymous),
            SimAction::ForeignWrite { user, change } => return self.foreign_write(step, user, change),
        };

        self.note_outcome(&outcome);
        if !outcome.is_applied() {
            let unchanged = TreeOracle::check_unchanged(step, action.name(), &before, self.engine.tasks());
            self.absorb(unchanged);
        }
        label(&outcome)
    }

    fn identity(&mut self, identity: &Identity) -> String {
        let before = self.engine.phase().clone();
        let phase = self.engine.on_identity(identity).clone();
        if matches!(phase, Phase::PendingMigration { .. }) {
            self.interesting = true;
        }
        // A fresh subscription replaces the tree with the remote collection.
        if phase != before && phase.backend() == Backend::Remote && self.engine.is_subscribed() {
            self.remote_dirty = false;
        }
        phase.to_string()
    }

    fn foreign_write(&mut self, step: u64, user: &str, change: &ForeignChange) -> String {
        let now = self.clock.now();
        let written = match change {
            ForeignChange::AddGoal { task_id } => {
                let record = TaskRecord {
                    id: task_id.clone(),
                    title: format!("Foreign {step}"),
                    description: None,
                    completed: false,
                    level: Level::Goal,
                    parent_id: None,
                    order: None,
                    created_at: Some(now),
                    updated_at: None,
                };
                self.remote.upsert(user, &record)
            }
            ForeignChange::Retitle { task_id } => match self.remote_record(user, task_id) {
                Some(mut record) => {
                    record.title = format!("Renamed {step}");
                    record.updated_at = Some(now);
                    self.remote.upsert(user, &record)
                }
                None => return "missing".to_string(),
            },
            ForeignChange::DeleteLeaf { task_id } => self.remote.delete(user, task_id),
        };

        match written {
            Ok(()) => {
                if self.engine.phase().user() == Some(user) && self.engine.is_subscribed() {
                    self.interesting = true;
                    self.remote_dirty = false;
                }
                "written".to_string()
            }
            Err(err) => format!("failed:{}", err.code().code()),
        }
    }

    fn remote_record(&self, user: &str, task_id: &str) -> Option<TaskRecord> {
        self.remote
            .documents(user)
            .into_iter()
            .find(|doc| doc.id == task_id)
            .and_then(|doc| codec::decode_record(&doc.id, &doc.data).ok())
    }

    fn note_outcome(&mut self, outcome: &MutationOutcome) {
        let Some(report) = outcome.report() else {
            return;
        };
        match (report.backend, report.is_clean()) {
            (Backend::Local, true) => self.local_dirty = false,
            (Backend::Local, false) => {
                self.local_dirty = true;
                self.interesting = true;
            }
            (Backend::Remote, true) => self.remote_dirty = false,
            (Backend::Remote, false) => {
                self.remote_dirty = true;
                self.interesting = true;
            }
        }
    }

    // -- oracle -------------------------------------------------------------

    fn absorb(&mut self, result: OracleResult) {
        if !result.passed {
            for violation in &result.violations {
                tracing::warn!(seed = self.config.seed, ?violation, "invariant violated");
            }
        }
        let current = std::mem::replace(&mut self.result, OracleResult::pass());
        self.result = current.merge(result);
    }

    fn check(&mut self, step: u64) {
        let now: DateTime<Utc> = self.clock.now();
        let tasks: Forest = self.engine.tasks().clone();
        let policy = match self.engine.backend() {
            Backend::Local => ShapePolicy::Strict,
            Backend::Remote => ShapePolicy::OrphanRootsAllowed,
        };

        let mut result = TreeOracle::check_shape(step, &tasks, policy)
            .merge(TreeOracle::check_history(step, self.engine.history()));

        if self.engine.is_loaded() && self.engine.backend() == Backend::Local && !self.local_dirty {
            let key = self.engine.config().keys.tasks.clone();
            let blob = self.engine.local().get(&key).ok().flatten();
            result = result.merge(TreeOracle::check_local_mirror(step, &tasks, blob.as_deref(), now));
        }

        if let Phase::Remote { user } = self.engine.phase()
            && self.engine.is_subscribed()
            && !self.remote_dirty
        {
            let docs = self.remote.documents(user);
            result = result.merge(TreeOracle::check_remote_mirror(step, &tasks, &docs, now));
        }

        self.absorb(result);
    }
}

fn label(outcome: &MutationOutcome) -> String {
    match outcome {
        MutationOutcome::Applied { report, .. } if report.is_clean() => "applied".to_string(),
        MutationOutcome::Applied { report, .. } => format!("applied:{}-failures", report.failures.len()),
        MutationOutcome::Unchanged => "unchanged".to_string(),
        MutationOutcome::Unavailable => "unavailable".to_string(),
        MutationOutcome::NoOp(rejection) => format!("noop:{}", rejection.code.code()),
    }
}
