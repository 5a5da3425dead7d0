//! Pre-execution safety simulation for constellation-scoped actions.
//!
//! Cheap closed-form risk estimates per action plus a single-hop cascade
//! model. Anything unverifiable is unsafe: missing or malformed parameters
//! fail closed.

use constellation_proto::ActionName;
use tracing::{debug, warn};

use crate::decision::Decision;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyConfig {
    /// Veto when total risk exceeds this.
    pub risk_threshold: f64,
    /// Per-neighbor multiplier in the cascade estimate.
    pub propagation_factor: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 0.10,
            propagation_factor: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyMetrics {
    pub validations: u64,
    pub vetoes: u64,
    pub fail_closed: u64,
}

#[derive(Debug, Clone)]
pub struct SafetySimulator {
    config: SafetyConfig,
    metrics: SafetyMetrics,
}

impl SafetySimulator {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            metrics: SafetyMetrics::default(),
        }
    }

    pub fn metrics(&self) -> SafetyMetrics {
        self.metrics
    }

    /// Estimates constellation-wide risk for the decision and returns
    /// whether it is safe to put before consensus.
    pub fn validate(&mut self, decision: &Decision, affected_neighbors: usize) -> bool {
        self.metrics.validations += 1;
        // Safe mode is the escape hatch; it must never be vetoed.
        if decision.action_name == ActionName::SafeMode {
            return true;
        }
        let base_risk = match base_risk(decision.action_name, &decision.params) {
            Some(risk) => risk,
            None => {
                self.metrics.fail_closed += 1;
                warn!(
                    action = %decision.action_name,
                    "unverifiable action parameters; failing closed"
                );
                return false;
            }
        };
        let cascade = base_risk * self.config.propagation_factor * affected_neighbors as f64;
        let total = base_risk + cascade;
        let safe = total <= self.config.risk_threshold;
        if safe {
            debug!(
                action = %decision.action_name,
                base_risk,
                cascade,
                "safety check passed"
            );
        } else {
            self.metrics.vetoes += 1;
            warn!(
                action = %decision.action_name,
                base_risk,
                cascade,
                total,
                threshold = self.config.risk_threshold,
                "safety veto"
            );
        }
        safe
    }
}

fn base_risk(action: ActionName, params: &serde_json::Value) -> Option<f64> {
    match action {
        ActionName::SafeMode => Some(0.0),
        ActionName::RoleReassign => Some(0.05),
        ActionName::AttitudeAdjust => {
            let angle = params.get("angle_degrees")?.as_f64()?;
            if !angle.is_finite() {
                return None;
            }
            Some((angle.abs() / 10.0) * 0.30)
        }
        ActionName::LoadShed => {
            let shed = params.get("shed_percent")?.as_f64()?;
            if !shed.is_finite() || shed < 0.0 {
                return None;
            }
            if shed <= 15.0 {
                Some(0.0)
            } else {
                Some((shed - 15.0) / 100.0)
            }
        }
        ActionName::ThermalManeuver => {
            let delta = params.get("delta_t_celsius")?.as_f64()?;
            if !delta.is_finite() {
                return None;
            }
            let delta = delta.abs();
            if delta <= 5.0 {
                Some(0.0)
            } else {
                Some(delta / 5.0 - 1.0)
            }
        }
    }
}
