//! Backend selection as a pure state machine.
//!
//! [`plan`] maps the current [`Phase`], the identity reported by the identity
//! provider, and a few facts read from the local store to the next phase and
//! the ordered list of [`Effect`]s the engine must perform. Nothing here
//! touches storage, so every transition is testable on its own.

use std::fmt;

/// Authenticated user identifier.
pub type UserId = String;

/// What the identity provider currently reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Still resolving; the engine waits.
    Loading,
    Anonymous,
    Authenticated(UserId),
}

/// Which store is authoritative for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Local,
    Remote,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Engine lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No identity resolved yet; nothing loaded.
    Unloaded,
    /// Anonymous session backed by the local store.
    Local,
    /// Local tasks are being copied to `user`'s remote collection.
    Migrating { user: UserId },
    /// A migration for `user` failed; local stays authoritative until the
    /// next identity event retries it.
    PendingMigration { user: UserId },
    /// Signed in; the remote subscription is authoritative.
    Remote { user: UserId },
}

impl Phase {
    #[must_use]
    pub const fn backend(&self) -> Backend {
        match self {
            Self::Remote { .. } => Backend::Remote,
            Self::Unloaded | Self::Local | Self::Migrating { .. } | Self::PendingMigration { .. } => {
                Backend::Local
            }
        }
    }

    /// The signed-in user, if any.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Migrating { user } | Self::PendingMigration { user } | Self::Remote { user } => {
                Some(user.as_str())
            }
            Self::Unloaded | Self::Local => None,
        }
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        !matches!(self, Self::Unloaded)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Local => f.write_str("local"),
            Self::Migrating { user } => write!(f, "migrating({user})"),
            Self::PendingMigration { user } => write!(f, "pending-migration({user})"),
            Self::Remote { user } => write!(f, "remote({user})"),
        }
    }
}

/// Local-store facts a transition depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Facts {
    /// The migration-complete flag is set.
    pub migrated: bool,
    /// Number of tasks in the local blob (all levels).
    pub local_task_count: usize,
}

/// A side effect the engine performs, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Read the task tree and history from the local store.
    LoadLocal,
    /// Dispose the live subscription, if any.
    Unsubscribe,
    /// Upsert every local task to `user`'s remote collection.
    Migrate(UserId),
    /// Set the migration-complete flag.
    MarkMigrated,
    /// Remove the local task blob.
    RemoveLocalTasks,
    /// Open a live subscription on `user`'s collection.
    Subscribe(UserId),
    /// Remove the local task blob and the migration flag.
    ClearLocalSession,
    /// Empty the in-memory tree.
    ResetTree,
    /// Empty both history stacks and their stored copies.
    ClearHistory,
}

/// Result of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(phase: &Phase) -> Self {
        Self {
            next: phase.clone(),
            effects: Vec::new(),
        }
    }
}

/// Decide the next phase and effects for an identity event.
#[must_use]
pub fn plan(phase: &Phase, identity: &Identity, facts: Facts) -> Transition {
    match identity {
        Identity::Loading => Transition::stay(phase),
        Identity::Anonymous => sign_out(phase),
        Identity::Authenticated(user) => match phase {
            Phase::Remote { user: current } | Phase::Migrating { user: current } if current == user => {
                Transition::stay(phase)
            }
            Phase::Remote { .. } | Phase::Migrating { .. } => {
                let mut out = sign_out(phase);
                let after = sign_in(user, Facts::default());
                out.effects.extend(after.effects);
                out.next = after.next;
                out
            }
            Phase::Unloaded => {
                let mut out = sign_in(user, facts);
                out.effects.insert(0, Effect::LoadLocal);
                out
            }
            Phase::Local | Phase::PendingMigration { .. } => sign_in(user, facts),
        },
    }
}

/// Follow-up once a [`Effect::Migrate`] batch finished.
#[must_use]
pub fn plan_after_migration(user: &str, succeeded: bool) -> Transition {
    if succeeded {
        Transition {
            next: Phase::Remote {
                user: user.to_string(),
            },
            effects: vec![
                Effect::MarkMigrated,
                Effect::RemoveLocalTasks,
                Effect::Subscribe(user.to_string()),
            ],
        }
    } else {
        Transition {
            next: Phase::PendingMigration {
                user: user.to_string(),
            },
            effects: Vec::new(),
        }
    }
}

fn sign_in(user: &str, facts: Facts) -> Transition {
    let user = user.to_string();
    if facts.migrated {
        return Transition {
            next: Phase::Remote { user: user.clone() },
            effects: vec![Effect::Subscribe(user)],
        };
    }
    if facts.local_task_count == 0 {
        return Transition {
            next: Phase::Remote { user: user.clone() },
            effects: vec![Effect::MarkMigrated, Effect::Subscribe(user)],
        };
    }
    Transition {
        next: Phase::Migrating { user: user.clone() },
        effects: vec![Effect::Migrate(user)],
    }
}

fn sign_out(phase: &Phase) -> Transition {
    match phase {
        Phase::Unloaded => Transition {
            next: Phase::Local,
            effects: vec![Effect::LoadLocal],
        },
        Phase::Local => Transition::stay(phase),
        // Local tasks were never copied out; keep them.
        Phase::PendingMigration { .. } => Transition {
            next: Phase::Local,
            effects: Vec::new(),
        },
        Phase::Migrating { .. } | Phase::Remote { .. } => Transition {
            next: Phase::Local,
            effects: vec![
                Effect::Unsubscribe,
                Effect::ClearLocalSession,
                Effect::ResetTree,
                Effect::ClearHistory,
            ],
        },
    }
}
