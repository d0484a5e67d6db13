//! Campaign runner: many seeds, one report.
//!
//! Every seed drives a fresh engine through a random session; the report
//! names the first failing seed so it can be replayed in detail.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::faults::FaultConfig;
use crate::oracle::{InvariantViolation, format_violation};
use crate::simulator::{SimulationConfig, SimulationResult, Simulator};

/// How many seeds to run and how each one is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    /// Steps per seed.
    pub steps: u64,
    /// Distinct accounts each run signs in as.
    pub users: usize,
    pub fault_remote_offline_percent: u8,
    pub fault_remote_reject_percent: u8,
    pub fault_subscription_break_percent: u8,
    pub fault_local_fail_percent: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let fault = FaultConfig::default();
        Self {
            seed_range: 0..100,
            steps: 200,
            users: 2,
            fault_remote_offline_percent: fault.remote_offline_percent,
            fault_remote_reject_percent: fault.remote_reject_percent,
            fault_subscription_break_percent: fault.subscription_break_percent,
            fault_local_fail_percent: fault.local_fail_percent,
        }
    }
}

impl CampaignConfig {
    /// Campaign with every fault rate derived from one overall probability.
    #[must_use]
    pub fn with_faults(seed_range: Range<u64>, steps: u64, users: usize, overall: f64) -> Self {
        let fault = FaultConfig::scaled(overall);
        Self {
            seed_range,
            steps,
            users,
            fault_remote_offline_percent: fault.remote_offline_percent,
            fault_remote_reject_percent: fault.remote_reject_percent,
            fault_subscription_break_percent: fault.subscription_break_percent,
            fault_local_fail_percent: fault.local_fail_percent,
        }
    }

    #[must_use]
    pub const fn fault(&self) -> FaultConfig {
        FaultConfig {
            remote_offline_percent: self.fault_remote_offline_percent,
            remote_reject_percent: self.fault_remote_reject_percent,
            subscription_break_percent: self.fault_subscription_break_percent,
            local_fail_percent: self.fault_local_fail_percent,
        }
    }

    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            steps: self.steps,
            users: self.users,
            fault: self.fault(),
            ..SimulationConfig::default()
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.users == 0 {
            bail!("users must be > 0");
        }
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds in which at least one fault changed behaviour.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything recorded while replaying one seed.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    /// Violations rendered with [`format_violation`].
    pub violations: Vec<String>,
}

impl DetailedTrace {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run every seed in `config`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let result = simulate(seed, config)?;
        if result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if result.passed() {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, violations = result.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: result.violations.iter().map(format_violation).collect(),
            });
        }
    }

    tracing::info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run one seed: `Ok(())` on pass, the violations otherwise.
///
/// # Errors
///
/// The outer error reports an invalid configuration.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let result = simulate(seed, config)?;
    if result.passed() {
        Ok(Ok(()))
    } else {
        Ok(Err(result.violations))
    }
}

/// Replay one seed with the full trace kept.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    let result = simulate(seed, config)?;
    let violations = result.violations.iter().map(format_violation).collect();
    Ok(DetailedTrace { result, violations })
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    Ok(Simulator::new(config.sim_config_for_seed(seed))?.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(seeds: Range<u64>, steps: u64) -> CampaignConfig {
        CampaignConfig::with_faults(seeds, steps, 2, 0.0)
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_rejected() {
        for config in [
            CampaignConfig {
                seed_range: 5..5,
                ..CampaignConfig::default()
            },
            CampaignConfig {
                users: 0,
                ..CampaignConfig::default()
            },
            CampaignConfig {
                steps: 0,
                ..CampaignConfig::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
            assert!(run_campaign(&config).is_err());
        }
    }

    #[test]
    fn sim_config_for_seed_carries_parameters() {
        let config = CampaignConfig::with_faults(0..1, 64, 3, 0.2);
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.steps, 64);
        assert_eq!(sim.users, 3);
        assert_eq!(sim.fault, FaultConfig::scaled(0.2));
    }

    #[test]
    fn quiet_campaign_passes() {
        let report = run_campaign(&quiet(0..10, 150)).expect("campaign should not error");
        assert_eq!(report.seeds_run, 10);
        assert_eq!(report.seeds_passed, 10);
        assert!(report.all_passed(), "{:?}", report.failures);
        assert!(report.first_failure.is_none());
    }

    #[test]
    fn faulty_campaign_passes_and_hits_faults() {
        let config = CampaignConfig {
            seed_range: 0..20,
            steps: 150,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert!(report.all_passed(), "{:?}", report.failures);
        assert!(report.interesting_states_reached > 0);
    }

    #[test]
    fn single_seed_passes() {
        let result = run_single_seed(3, &quiet(0..1, 100)).expect("sim should not error");
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn replay_is_deterministic() {
        let config = CampaignConfig::default();
        let first = replay_seed(7, &config).expect("replay 1");
        let second = replay_seed(7, &config).expect("replay 2");
        assert_eq!(first.result.trace, second.result.trace);
        assert_eq!(first.result.trace_fingerprint(), second.result.trace_fingerprint());
        assert_eq!(first.violations, second.violations);
        assert!(first.passed(), "{:?}", first.violations);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["step 3: UndoRedoMismatch".into()],
            }],
            interesting_states_reached: 4,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }
}
