//! ladder-core library.
//!
//! A three-level goal ladder (Goal → Metric → Action) kept as an immutable
//! forest, with drag-and-drop placement, bounded undo/redo, and a sync engine
//! that persists to a local store while signed out and to a per-user remote
//! collection while signed in.
//!
//! # Conventions
//!
//! - **Errors**: Each layer has a `thiserror` enum with a `code()` returning
//!   an [`error::ErrorCode`]. Configuration uses `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`)
//!   with structured fields.
//! - **Time**: Every timestamp comes from a [`clock::Clock`].

pub mod clock;
pub mod config;
pub mod drag;
pub mod error;
pub mod history;
pub mod model;
pub mod progress;
pub mod store;
pub mod sync;
pub mod tree;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use drag::{DragSession, DropRejection, Placement};
pub use error::ErrorCode;
pub use history::HistoryStack;
pub use model::{Forest, Level, NewTask, Task, TaskEdit, TaskId, TaskRecord};
pub use progress::{LevelSummary, Progress};
pub use sync::{Identity, MutationOutcome, Phase, SyncEngine};
pub use tree::TreeError;
