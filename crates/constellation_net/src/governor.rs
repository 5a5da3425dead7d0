//! Bandwidth governor: a signal-only component that folds recent publish and
//! failure counts into a utilization number in [0, 1]. The swarm memory uses
//! the signal to decide when to evict peer replicas; the bus reads it as a
//! congestion hint.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorConfig {
    /// Length of the sliding observation window.
    pub window_ms: i64,
    /// Publishes per second the links are provisioned for. Utilization is
    /// the observed rate over this capacity, saturated at 1.
    pub nominal_publish_rate_per_s: f64,
    /// Extra utilization added per observed failure ratio point.
    pub failure_weight: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            nominal_publish_rate_per_s: 50.0,
            failure_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    Publish,
    Failure,
}

/// Sliding-window utilization estimator.
#[derive(Debug, Clone)]
pub struct BandwidthGovernor {
    config: GovernorConfig,
    samples: VecDeque<(i64, Sample)>,
}

impl BandwidthGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    pub fn record_publish(&mut self, now_ms: i64) {
        self.samples.push_back((now_ms, Sample::Publish));
        self.prune(now_ms);
    }

    pub fn record_failure(&mut self, now_ms: i64) {
        self.samples.push_back((now_ms, Sample::Failure));
        self.prune(now_ms);
    }

    /// Current utilization in [0, 1].
    pub fn utilization(&mut self, now_ms: i64) -> f64 {
        self.prune(now_ms);
        let mut publishes = 0usize;
        let mut failures = 0usize;
        for (_, sample) in &self.samples {
            match sample {
                Sample::Publish => publishes += 1,
                Sample::Failure => failures += 1,
            }
        }
        let window_s = (self.config.window_ms as f64 / 1_000.0).max(0.001);
        let rate = publishes as f64 / window_s;
        let rate_part = (rate / self.config.nominal_publish_rate_per_s).min(1.0);
        let total = publishes + failures;
        let failure_part = if total == 0 {
            0.0
        } else {
            (failures as f64 / total as f64) * self.config.failure_weight
        };
        (rate_part + failure_part).min(1.0)
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        while let Some((at_ms, _)) = self.samples.front() {
            if *at_ms < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for BandwidthGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_governor_reports_zero() {
        let mut governor = BandwidthGovernor::default();
        assert_eq!(governor.utilization(1_000), 0.0);
    }

    #[test]
    fn utilization_grows_with_publish_rate() {
        let mut governor = BandwidthGovernor::new(GovernorConfig {
            window_ms: 1_000,
            nominal_publish_rate_per_s: 10.0,
            failure_weight: 0.5,
        });
        for i in 0..5 {
            governor.record_publish(100 * i);
        }
        let half = governor.utilization(500);
        assert!(half > 0.4 && half <= 0.6, "got {half}");
        for i in 5..20 {
            governor.record_publish(50 * i);
        }
        assert_eq!(governor.utilization(1_000), 1.0);
    }

    #[test]
    fn failures_raise_utilization() {
        let mut governor = BandwidthGovernor::new(GovernorConfig {
            window_ms: 1_000,
            nominal_publish_rate_per_s: 1_000.0,
            failure_weight: 0.5,
        });
        governor.record_publish(0);
        governor.record_failure(1);
        let utilization = governor.utilization(10);
        assert!(utilization >= 0.25, "got {utilization}");
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut governor = BandwidthGovernor::new(GovernorConfig {
            window_ms: 1_000,
            nominal_publish_rate_per_s: 1.0,
            failure_weight: 0.5,
        });
        governor.record_publish(0);
        assert!(governor.utilization(100) > 0.0);
        assert_eq!(governor.utilization(2_000), 0.0);
    }
}
