//! Leader-side autonomous role maintenance.
//!
//! Classifies each peer's sliding health window into a failure mode and
//! proposes role changes through consensus. Hysteresis: no demotion is
//! proposed until the same peer has been below threshold for three
//! consecutive samples, so intermittent loss never causes role flapping.

use std::collections::{BTreeMap, VecDeque};

use constellation_proto::{AgentRole, CoordError};
use tracing::{debug, info};

use crate::metrics::ReassignerMetrics;
use crate::propagator::ComplianceWindow;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReassignerConfig {
    pub interval_ms: i64,
    /// Health samples older than this fall out of every window.
    pub window_ms: i64,
    pub max_samples: usize,
    /// A sample at or above this risk counts as below-threshold.
    pub degraded_risk_threshold: f64,
    /// Risk must stay under this for the whole promotion hold.
    pub promotion_risk_ceiling: f64,
    pub promotion_hold_ms: i64,
    /// Consecutive below-threshold samples required before any demotion.
    pub hysteresis_consecutive: u32,
    pub compliance_floor: f64,
    /// Reassigner cycles of sustained non-compliance before demotion.
    pub compliance_strikes: u32,
}

impl Default for ReassignerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            window_ms: 300_000,
            max_samples: 10,
            degraded_risk_threshold: 0.3,
            promotion_risk_ceiling: 0.2,
            promotion_hold_ms: 90_000,
            hysteresis_consecutive: 3,
            compliance_floor: 0.90,
            compliance_strikes: 3,
        }
    }
}

impl ReassignerConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.interval_ms <= 0 || self.window_ms <= 0 || self.promotion_hold_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "reassigner intervals must be positive".to_string(),
            });
        }
        if self.max_samples == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "reassigner max_samples must be positive".to_string(),
            });
        }
        if self.hysteresis_consecutive == 0 || self.compliance_strikes == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "reassigner hysteresis counters must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.degraded_risk_threshold)
            || !(0.0..=1.0).contains(&self.promotion_risk_ceiling)
            || !(0.0..=1.0).contains(&self.compliance_floor)
        {
            return Err(CoordError::InvalidConfig {
                reason: "reassigner thresholds must be in [0,1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Derived health classification over a peer's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Healthy,
    Intermittent,
    Degraded,
    Critical,
}

/// Bounded ring of (timestamp, risk) samples for one peer.
#[derive(Debug, Clone, Default)]
pub struct HealthHistory {
    samples: VecDeque<(i64, f64)>,
}

impl HealthHistory {
    pub fn push(&mut self, at_ms: i64, risk: f64, max_samples: usize) {
        self.samples.push_back((at_ms, risk));
        while self.samples.len() > max_samples {
            self.samples.pop_front();
        }
    }

    pub fn prune(&mut self, now_ms: i64, window_ms: i64) {
        while let Some((at, _)) = self.samples.front() {
            if now_ms.saturating_sub(*at) >= window_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn below_count(&self, threshold: f64) -> usize {
        self.samples
            .iter()
            .filter(|(_, risk)| *risk >= threshold)
            .count()
    }

    /// Length of the contiguous below-threshold run ending at the newest
    /// sample. This is the hysteresis counter.
    pub fn trailing_below(&self, threshold: f64) -> usize {
        self.samples
            .iter()
            .rev()
            .take_while(|(_, risk)| *risk >= threshold)
            .count()
    }

    pub fn mean_health(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let total: f64 = self.samples.iter().map(|(_, risk)| risk).sum();
        1.0 - total / self.samples.len() as f64
    }

    pub fn classify(&self, threshold: f64) -> FailureMode {
        let below = self.below_count(threshold);
        let trailing = self.trailing_below(threshold);
        if below == 0 {
            FailureMode::Healthy
        } else if below >= 4 && trailing >= 1 {
            FailureMode::Critical
        } else if trailing >= 3 {
            FailureMode::Degraded
        } else {
            FailureMode::Intermittent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChangeKind {
    Promote,
    Demote,
}

/// One proposed role change, fed to consensus as a `role_reassign` proposal
/// (one agent per proposal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleChange {
    pub agent_id: String,
    pub from_role: AgentRole,
    pub to_role: AgentRole,
    pub kind: RoleChangeKind,
    pub reason: String,
}

pub struct RoleReassigner {
    config: ReassignerConfig,
    histories: BTreeMap<String, HealthHistory>,
    consecutive_below: BTreeMap<String, u32>,
    low_risk_since: BTreeMap<String, i64>,
    compliance_strikes: BTreeMap<String, u32>,
    last_run_ms: Option<i64>,
    metrics: ReassignerMetrics,
}

impl RoleReassigner {
    pub fn new(config: ReassignerConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            histories: BTreeMap::new(),
            consecutive_below: BTreeMap::new(),
            low_risk_since: BTreeMap::new(),
            compliance_strikes: BTreeMap::new(),
            last_run_ms: None,
            metrics: ReassignerMetrics::default(),
        })
    }

    pub fn metrics(&self) -> ReassignerMetrics {
        self.metrics
    }

    pub fn history(&self, agent_id: &str) -> Option<&HealthHistory> {
        self.histories.get(agent_id)
    }

    /// Folds one health sample. Called for every inbound summary and for the
    /// local agent's own reports.
    pub fn observe(&mut self, agent_id: &str, risk: f64, now_ms: i64) {
        let history = self.histories.entry(agent_id.to_string()).or_default();
        history.push(now_ms, risk, self.config.max_samples);
        let counter = self.consecutive_below.entry(agent_id.to_string()).or_insert(0);
        if risk >= self.config.degraded_risk_threshold {
            *counter = counter.saturating_add(1);
        } else {
            *counter = 0;
        }
        if risk < self.config.promotion_risk_ceiling {
            self.low_risk_since
                .entry(agent_id.to_string())
                .or_insert(now_ms);
        } else {
            self.low_risk_since.remove(agent_id);
        }
    }

    /// Whether the evaluation interval elapsed.
    pub fn due(&self, now_ms: i64) -> bool {
        match self.last_run_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.config.interval_ms,
            None => true,
        }
    }

    /// One leader-side evaluation cycle. Returns role changes to propose,
    /// never applying anything directly.
    pub fn evaluate(
        &mut self,
        now_ms: i64,
        registry: &Registry,
        compliance: &ComplianceWindow,
    ) -> Vec<RoleChange> {
        self.last_run_ms = Some(now_ms);
        for history in self.histories.values_mut() {
            history.prune(now_ms, self.config.window_ms);
        }

        let mut changes: Vec<RoleChange> = Vec::new();
        let mut roster: BTreeMap<String, AgentRole> = BTreeMap::new();
        for record in registry.alive_peers(now_ms) {
            roster.insert(record.agent_id.clone(), record.role);
        }
        roster.insert(registry.self_id().to_string(), registry.own_role());

        self.evaluate_degraded_primaries(now_ms, &roster, &mut changes);
        self.evaluate_compliance(&roster, compliance, &mut changes);
        self.evaluate_promotions(now_ms, &roster, &mut changes);

        for change in &changes {
            self.metrics.role_changes_total += 1;
            match change.kind {
                RoleChangeKind::Promote => self.metrics.promotions_proposed += 1,
                RoleChangeKind::Demote => self.metrics.demotions_proposed += 1,
            }
            info!(
                agent_id = %change.agent_id,
                from = %change.from_role,
                to = %change.to_role,
                reason = %change.reason,
                "role change proposed"
            );
        }
        changes
    }

    fn evaluate_degraded_primaries(
        &mut self,
        _now_ms: i64,
        roster: &BTreeMap<String, AgentRole>,
        changes: &mut Vec<RoleChange>,
    ) {
        let threshold = self.config.degraded_risk_threshold;
        let hysteresis = self.config.hysteresis_consecutive;
        let mut reset_counters: Vec<String> = Vec::new();

        for (agent_id, role) in roster {
            let history = match self.histories.get(agent_id) {
                Some(history) if !history.is_empty() => history,
                _ => continue,
            };
            let mode = history.classify(threshold);
            let counter = self.consecutive_below.get(agent_id).copied().unwrap_or(0);

            if *role == AgentRole::Primary
                && matches!(mode, FailureMode::Degraded | FailureMode::Critical)
            {
                if counter < hysteresis {
                    // Hysteresis holds the line, either because the run is
                    // too short or because a proposal already consumed it.
                    self.metrics.flapping_events_blocked += 1;
                    continue;
                }
                let successor = self.healthiest_backup(roster, agent_id);
                match successor {
                    Some(backup_id) => {
                        changes.push(RoleChange {
                            agent_id: backup_id.clone(),
                            from_role: AgentRole::Backup,
                            to_role: AgentRole::Primary,
                            kind: RoleChangeKind::Promote,
                            reason: format!("replacing degraded primary {agent_id}"),
                        });
                        changes.push(RoleChange {
                            agent_id: agent_id.clone(),
                            from_role: AgentRole::Primary,
                            to_role: AgentRole::Backup,
                            kind: RoleChangeKind::Demote,
                            reason: format!("sustained degradation ({mode:?})"),
                        });
                        reset_counters.push(agent_id.clone());
                    }
                    None => {
                        debug!(
                            agent_id = %agent_id,
                            "degraded primary has no backup to promote"
                        );
                    }
                }
            } else if history.below_count(threshold) >= 1 && counter < hysteresis {
                // Intermittent degradation anywhere in the fleet: the
                // hysteresis counter is what keeps roles stable.
                self.metrics.flapping_events_blocked += 1;
            }
        }

        for agent_id in reset_counters {
            self.consecutive_below.insert(agent_id, 0);
        }
    }

    fn healthiest_backup(
        &self,
        roster: &BTreeMap<String, AgentRole>,
        excluding: &str,
    ) -> Option<String> {
        roster
            .iter()
            .filter(|(agent_id, role)| {
                **role == AgentRole::Backup && agent_id.as_str() != excluding
            })
            .map(|(agent_id, _)| {
                // A backup we have no samples for ranks last; promotion
                // wants demonstrated health, not absence of evidence.
                let mean = self
                    .histories
                    .get(agent_id)
                    .filter(|history| !history.is_empty())
                    .map(|history| history.mean_health())
                    .unwrap_or(0.0);
                (agent_id.clone(), mean)
            })
            .max_by(|(id_a, health_a), (id_b, health_b)| {
                health_a
                    .partial_cmp(health_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| id_a.cmp(id_b))
            })
            .map(|(agent_id, _)| agent_id)
    }

    fn evaluate_compliance(
        &mut self,
        roster: &BTreeMap<String, AgentRole>,
        compliance: &ComplianceWindow,
        changes: &mut Vec<RoleChange>,
    ) {
        let floor = self.config.compliance_floor;
        let anyone_compliant = compliance
            .tracked_agents()
            .iter()
            .any(|agent_id| {
                compliance
                    .agent_compliance(agent_id)
                    .map(|rate| rate >= floor)
                    .unwrap_or(false)
            });

        for (agent_id, role) in roster {
            let rate = match compliance.agent_compliance(agent_id) {
                Some(rate) => rate,
                None => {
                    self.compliance_strikes.remove(agent_id);
                    continue;
                }
            };
            if rate >= floor || !anyone_compliant {
                self.compliance_strikes.remove(agent_id);
                continue;
            }
            if matches!(role, AgentRole::Standby | AgentRole::SafeMode) {
                continue;
            }
            let strikes = self
                .compliance_strikes
                .entry(agent_id.clone())
                .or_insert(0);
            *strikes += 1;
            if *strikes < self.config.compliance_strikes {
                self.metrics.flapping_events_blocked += 1;
                continue;
            }
            changes.push(RoleChange {
                agent_id: agent_id.clone(),
                from_role: *role,
                to_role: AgentRole::Standby,
                kind: RoleChangeKind::Demote,
                reason: format!("compliance {rate:.2} below floor {floor:.2}"),
            });
            self.compliance_strikes.remove(agent_id);
        }
    }

    fn evaluate_promotions(
        &mut self,
        now_ms: i64,
        roster: &BTreeMap<String, AgentRole>,
        changes: &mut Vec<RoleChange>,
    ) {
        let hold = self.config.promotion_hold_ms;
        let mut promoted: Vec<String> = Vec::new();
        for (agent_id, role) in roster {
            let target = match role.promoted() {
                Some(target) => target,
                None => continue,
            };
            let since = match self.low_risk_since.get(agent_id) {
                Some(since) => *since,
                None => continue,
            };
            if now_ms.saturating_sub(since) < hold {
                continue;
            }
            changes.push(RoleChange {
                agent_id: agent_id.clone(),
                from_role: *role,
                to_role: target,
                kind: RoleChangeKind::Promote,
                reason: format!(
                    "risk below {:.2} for {} s",
                    self.config.promotion_risk_ceiling,
                    (now_ms - since) / 1_000
                ),
            });
            promoted.push(agent_id.clone());
        }
        // Restart the hold so the next step up needs a fresh quiet period.
        for agent_id in promoted {
            self.low_risk_since.insert(agent_id, now_ms);
        }
    }
}
