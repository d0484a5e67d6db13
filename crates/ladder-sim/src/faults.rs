use serde::{Deserialize, Serialize};

/// Per-step fault probabilities, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Remote store rejects every call for the step.
    pub remote_offline_percent: u8,
    /// Remote store rejects writes touching one random task.
    pub remote_reject_percent: u8,
    /// Live subscriptions break.
    pub subscription_break_percent: u8,
    /// Local store writes fail for the step.
    pub local_fail_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            remote_offline_percent: 5,
            remote_reject_percent: 5,
            subscription_break_percent: 2,
            local_fail_percent: 3,
        }
    }
}

impl FaultConfig {
    /// No faults at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            remote_offline_percent: 0,
            remote_reject_percent: 0,
            subscription_break_percent: 0,
            local_fail_percent: 0,
        }
    }

    /// Every rate derived from one overall probability in `0.0..=1.0`.
    #[must_use]
    pub fn scaled(overall: f64) -> Self {
        Self {
            remote_offline_percent: scale(overall, 50),
            remote_reject_percent: scale(overall, 50),
            subscription_break_percent: scale(overall, 20),
            local_fail_percent: scale(overall, 30),
        }
    }

    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        self.remote_offline_percent == 0
            && self.remote_reject_percent == 0
            && self.subscription_break_percent == 0
            && self.local_fail_percent == 0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(base: f64, weight_pct: u8) -> u8 {
    (base * f64::from(weight_pct)).clamp(0.0, 100.0) as u8
}

/// Faults drawn for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFaults {
    pub remote_offline: bool,
    pub rejected_task: Option<String>,
    pub break_subscription: bool,
    pub local_failing: bool,
}

impl StepFaults {
    #[must_use]
    pub const fn any(&self) -> bool {
        self.remote_offline
            || self.rejected_task.is_some()
            || self.break_subscription
            || self.local_failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_clamps() {
        assert!(FaultConfig::scaled(0.0).is_quiet());
        let loud = FaultConfig::scaled(5.0);
        assert_eq!(loud.remote_offline_percent, 100);
        assert_eq!(FaultConfig::scaled(0.1).remote_reject_percent, 5);
    }

    #[test]
    fn step_faults_any() {
        assert!(!StepFaults::default().any());
        assert!(
            StepFaults {
                local_failing: true,
                ..StepFaults::default()
            }
            .any()
        );
    }
}
