//! Backend selection, migration, and the engine that owns the task tree.

pub mod engine;
pub mod state;

pub use engine::{
    MigrationReport, MutationOutcome, PersistFailure, PersistReport, Rejection, SyncEngine,
};
pub use state::{Backend, Effect, Facts, Identity, Phase, Transition, UserId};
