//! Periodic health-summary exchange: publish our own summary on a fixed
//! interval, fold inbound summaries into the registry.

use constellation_net::MessageBus;
use constellation_proto::{topics, CoordError, HealthSummary, QosLevel};
use tracing::debug;

use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthBroadcasterConfig {
    pub interval_ms: i64,
}

impl Default for HealthBroadcasterConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl HealthBroadcasterConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.interval_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "health broadcast interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HealthBroadcaster {
    config: HealthBroadcasterConfig,
    last_broadcast_ms: Option<i64>,
}

impl HealthBroadcaster {
    pub fn new(config: HealthBroadcasterConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            last_broadcast_ms: None,
        })
    }

    /// Publishes the summary if the interval elapsed. A transient publish
    /// failure is dropped here; the next interval retries.
    pub fn tick(
        &mut self,
        summary: &HealthSummary,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<bool, CoordError> {
        let due = match self.last_broadcast_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.config.interval_ms,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        let payload = serde_json::to_vec(summary)?;
        match bus.publish(topics::HEALTH_SUMMARY, &payload, QosLevel::AtLeastOnce, now_ms) {
            Ok(_) => {
                self.last_broadcast_ms = Some(now_ms);
                Ok(true)
            }
            Err(err) => {
                debug!(error = %err, "health broadcast deferred to next interval");
                self.last_broadcast_ms = Some(now_ms);
                Ok(false)
            }
        }
    }

    /// Validates and folds one inbound summary into the registry. A summary
    /// with out-of-range fields is an error for the caller to log and drop.
    pub fn handle_summary(
        &self,
        summary: &HealthSummary,
        registry: &mut Registry,
        now_ms: i64,
    ) -> Result<(), CoordError> {
        if summary.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidMessage {
                reason: "health summary missing agent_id".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&summary.risk_score) {
            return Err(CoordError::InvalidMessage {
                reason: format!(
                    "health summary risk_score out of range: {}",
                    summary.risk_score
                ),
            });
        }
        registry.observe_health(summary, now_ms);
        Ok(())
    }
}
