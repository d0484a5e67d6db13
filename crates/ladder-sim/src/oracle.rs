//! Invariant checks run after every simulation step.

use chrono::{DateTime, Utc};
use ladder_core::history::HistoryStack;
use ladder_core::model::{Forest, codec};
use ladder_core::store::RemoteDocument;
use ladder_core::tree::{self, ShapeViolation};
use std::collections::BTreeSet;

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub const fn fail(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }

    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        if violations.is_empty() {
            Self::pass()
        } else {
            Self::fail(violations)
        }
    }
}

/// One broken invariant, with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The tree shape is broken.
    Shape { step: u64, violation: ShapeViolation },
    /// A history stack grew past its capacity.
    HistoryOverflow {
        step: u64,
        undo: usize,
        redo: usize,
        capacity: usize,
    },
    /// A mutation reported as not applied still changed the tree.
    RejectedMutationChanged { step: u64, action: String },
    /// Undo followed by redo did not restore the tree.
    UndoRedoMismatch { step: u64 },
    /// The local blob does not decode to the in-memory tree.
    LocalMirror {
        step: u64,
        stored: usize,
        in_memory: usize,
    },
    /// With a healthy subscription the tree differs from the remote collection.
    RemoteMirror {
        step: u64,
        only_local: Vec<String>,
        only_remote: Vec<String>,
    },
}

/// How strictly tree shape is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapePolicy {
    /// Every shape invariant holds.
    Strict,
    /// Roots of other levels are allowed: a remote collection may hold
    /// children whose parent delete went through while theirs failed.
    OrphanRootsAllowed,
}

// ── Checks ───────────────────────────────────────────────────────────────────

pub struct TreeOracle;

impl TreeOracle {
    #[must_use]
    pub fn check_shape(step: u64, tree: &Forest, policy: ShapePolicy) -> OracleResult {
        let violations = tree::check_shape(tree)
            .into_iter()
            .filter(|violation| {
                policy == ShapePolicy::Strict || !matches!(violation, ShapeViolation::RootNotGoal { .. })
            })
            .map(|violation| InvariantViolation::Shape { step, violation })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_history(step: u64, history: &HistoryStack) -> OracleResult {
        let capacity = history.capacity();
        if history.undo_len() > capacity || history.redo_len() > capacity {
            return OracleResult::fail(vec![InvariantViolation::HistoryOverflow {
                step,
                undo: history.undo_len(),
                redo: history.redo_len(),
                capacity,
            }]);
        }
        OracleResult::pass()
    }

    #[must_use]
    pub fn check_unchanged(step: u64, action: &str, before: &Forest, after: &Forest) -> OracleResult {
        if before == after {
            OracleResult::pass()
        } else {
            OracleResult::fail(vec![InvariantViolation::RejectedMutationChanged {
                step,
                action: action.to_string(),
            }])
        }
    }

    #[must_use]
    pub fn check_round_trip(step: u64, before: &Forest, after: &Forest) -> OracleResult {
        if before == after {
            OracleResult::pass()
        } else {
            OracleResult::fail(vec![InvariantViolation::UndoRedoMismatch { step }])
        }
    }

    /// The stored blob (absent means empty) must decode to `tree`.
    #[must_use]
    pub fn check_local_mirror(
        step: u64,
        tree: &Forest,
        blob: Option<&str>,
        now: DateTime<Utc>,
    ) -> OracleResult {
        let stored = blob.map(|blob| codec::decode_tree(blob, now)).unwrap_or_default();
        if &stored == tree {
            return OracleResult::pass();
        }
        OracleResult::fail(vec![InvariantViolation::LocalMirror {
            step,
            stored: tree::count(&stored),
            in_memory: tree::count(tree),
        }])
    }

    /// `tree` must be exactly what the remote documents rebuild into.
    #[must_use]
    pub fn check_remote_mirror(
        step: u64,
        tree: &Forest,
        docs: &[RemoteDocument],
        now: DateTime<Utc>,
    ) -> OracleResult {
        let records = docs
            .iter()
            .filter_map(|doc| codec::decode_record(&doc.id, &doc.data).ok())
            .collect();
        let expected = tree::build_forest(records, now);
        if &expected == tree {
            return OracleResult::pass();
        }

        let local: BTreeSet<String> = tree::all_ids(tree).into_iter().collect();
        let remote: BTreeSet<String> = tree::all_ids(&expected).into_iter().collect();
        OracleResult::fail(vec![InvariantViolation::RemoteMirror {
            step,
            only_local: local.difference(&remote).cloned().collect(),
            only_remote: remote.difference(&local).cloned().collect(),
        }])
    }
}

/// Human-readable form of a violation.
#[must_use]
pub fn format_violation(violation: &InvariantViolation) -> String {
    match violation {
        InvariantViolation::Shape { step, violation } => format!("step {step}: Shape: {violation}"),
        InvariantViolation::HistoryOverflow {
            step,
            undo,
            redo,
            capacity,
        } => format!("step {step}: HistoryOverflow: undo={undo} redo={redo} capacity={capacity}"),
        InvariantViolation::RejectedMutationChanged { step, action } => {
            format!("step {step}: RejectedMutationChanged: {action} changed the tree")
        }
        InvariantViolation::UndoRedoMismatch { step } => {
            format!("step {step}: UndoRedoMismatch: redo did not restore the tree")
        }
        InvariantViolation::LocalMirror {
            step,
            stored,
            in_memory,
        } => format!("step {step}: LocalMirror: stored {stored} tasks, in memory {in_memory}"),
        InvariantViolation::RemoteMirror {
            step,
            only_local,
            only_remote,
        } => format!(
            "step {step}: RemoteMirror: only_local={only_local:?} only_remote={only_remote:?}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ladder_core::model::{Level, Task};

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn task(id: &str, level: Level, parent: Option<&str>) -> Task {
        Task {
            id: id.into(),
            title: id.into(),
            description: None,
            completed: false,
            level,
            parent_id: parent.map(str::to_string),
            children: Forest::new(),
            order: 0,
            created_at: at(),
            updated_at: None,
        }
    }

    #[test]
    fn orphan_roots_only_pass_leniently() {
        let tree: Forest = std::iter::once(task("a1", Level::Action, None)).collect();
        assert!(!TreeOracle::check_shape(1, &tree, ShapePolicy::Strict).passed);
        assert!(TreeOracle::check_shape(1, &tree, ShapePolicy::OrphanRootsAllowed).passed);
    }

    #[test]
    fn local_mirror_treats_missing_blob_as_empty() {
        assert!(TreeOracle::check_local_mirror(0, &Forest::new(), None, at()).passed);
        let tree: Forest = std::iter::once(task("g1", Level::Goal, None)).collect();
        let result = TreeOracle::check_local_mirror(3, &tree, None, at());
        assert_eq!(
            result.violations,
            [InvariantViolation::LocalMirror {
                step: 3,
                stored: 0,
                in_memory: 1
            }]
        );
    }

    #[test]
    fn remote_mirror_reports_id_differences() {
        let tree: Forest = std::iter::once(task("g1", Level::Goal, None)).collect();
        let doc = RemoteDocument {
            id: "g2".into(),
            data: serde_json::json!({"title": "G2", "level": "goal", "createdAt": at()}),
        };
        let result = TreeOracle::check_remote_mirror(5, &tree, &[doc], at());
        assert_eq!(
            result.violations,
            [InvariantViolation::RemoteMirror {
                step: 5,
                only_local: vec!["g1".into()],
                only_remote: vec!["g2".into()],
            }]
        );
    }

    #[test]
    fn merge_accumulates_failures() {
        let merged = OracleResult::pass()
            .merge(OracleResult::fail(vec![InvariantViolation::UndoRedoMismatch { step: 1 }]))
            .merge(OracleResult::pass());
        assert!(!merged.passed);
        assert_eq!(merged.violations.len(), 1);
        assert!(format_violation(&merged.violations[0]).contains("UndoRedoMismatch"));
    }
}
