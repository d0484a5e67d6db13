//! Deterministic simulation harness for the ladder sync engine.
//!
//! A [`Simulator`] feeds one engine a seeded stream of edits, drags,
//! undo/redo, sign-ins and foreign writes while injecting store faults, and
//! checks tree invariants after every step. [`campaign`] runs many seeds.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod faults;
pub mod oracle;
pub mod rng;
pub mod simulator;

pub use campaign::{CampaignConfig, CampaignReport, replay_seed, run_campaign};
pub use faults::{FaultConfig, StepFaults};
pub use oracle::{InvariantViolation, OracleResult, TreeOracle};
pub use rng::DeterministicRng;
pub use simulator::{SimAction, SimulationConfig, SimulationResult, Simulator, TraceEvent};
