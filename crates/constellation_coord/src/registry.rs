//! Local view of the constellation's peers.
//!
//! The registry is mutated only from the bus-reader path (health summaries,
//! heartbeats) and read by every other component. Each agent's registry is
//! authoritative for its own decisions; views across agents converge within
//! one broadcast interval under bounded loss.

use std::collections::{BTreeMap, BTreeSet};

use constellation_proto::{AgentRole, CoordError, HealthSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// A peer is alive iff seen within this window (default 3x the
    /// health-broadcast interval).
    pub liveness_window_ms: i64,
    /// Dead peers are forgotten after liveness window + grace.
    pub prune_grace_ms: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window_ms: 90_000,
            prune_grace_ms: 90_000,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.liveness_window_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "registry liveness_window_ms must be positive".to_string(),
            });
        }
        if self.prune_grace_ms < 0 {
            return Err(CoordError::InvalidConfig {
                reason: "registry prune_grace_ms cannot be negative".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub agent_id: String,
    pub role: AgentRole,
    pub last_health: Option<HealthSummary>,
    pub last_seen_ms: i64,
    pub link_quality: f64,
}

impl PeerRecord {
    pub fn is_alive(&self, now_ms: i64, liveness_window_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) < liveness_window_ms
    }

    pub fn risk_score(&self) -> Option<f64> {
        self.last_health.as_ref().map(|health| health.risk_score)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    self_id: String,
    config: RegistryConfig,
    peers: BTreeMap<String, PeerRecord>,
    own_health: Option<HealthSummary>,
    own_role: AgentRole,
}

impl Registry {
    pub fn new(self_id: impl Into<String>, config: RegistryConfig) -> Result<Self, CoordError> {
        config.validate()?;
        let self_id = self_id.into();
        if self_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "registry self_id cannot be empty".to_string(),
            });
        }
        Ok(Self {
            self_id,
            config,
            peers: BTreeMap::new(),
            own_health: None,
            own_role: AgentRole::Backup,
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    pub fn own_role(&self) -> AgentRole {
        self.own_role
    }

    pub fn set_own_role(&mut self, role: AgentRole) {
        self.own_role = role;
    }

    pub fn record_own_health(&mut self, summary: HealthSummary) {
        self.own_health = Some(summary);
    }

    pub fn own_health(&self) -> Option<&HealthSummary> {
        self.own_health.as_ref()
    }

    /// Folds an inbound health summary into the peer map. Summaries are
    /// monotone per producer; stale timestamps refresh liveness but do not
    /// overwrite the newer health record.
    pub fn observe_health(&mut self, summary: &HealthSummary, now_ms: i64) {
        if summary.agent_id == self.self_id {
            return;
        }
        let record = self
            .peers
            .entry(summary.agent_id.clone())
            .or_insert_with(|| PeerRecord {
                agent_id: summary.agent_id.clone(),
                role: summary.role,
                last_health: None,
                last_seen_ms: now_ms,
                link_quality: 1.0,
            });
        record.last_seen_ms = now_ms;
        record.role = summary.role;
        let stale = record
            .last_health
            .as_ref()
            .map(|held| held.timestamp_ms > summary.timestamp_ms)
            .unwrap_or(false);
        if !stale {
            record.last_health = Some(summary.clone());
        }
    }

    /// Liveness refresh from a heartbeat; the leader's health record is
    /// untouched.
    pub fn observe_heartbeat(&mut self, agent_id: &str, now_ms: i64) {
        if agent_id == self.self_id {
            return;
        }
        let record = self
            .peers
            .entry(agent_id.to_string())
            .or_insert_with(|| PeerRecord {
                agent_id: agent_id.to_string(),
                role: AgentRole::Backup,
                last_health: None,
                last_seen_ms: now_ms,
                link_quality: 1.0,
            });
        record.last_seen_ms = now_ms;
    }

    pub fn observe_link_quality(&mut self, agent_id: &str, quality: f64) {
        if let Some(record) = self.peers.get_mut(agent_id) {
            record.link_quality = quality.clamp(0.0, 1.0);
        }
    }

    pub fn set_peer_role(&mut self, agent_id: &str, role: AgentRole) {
        if agent_id == self.self_id {
            self.own_role = role;
            return;
        }
        if let Some(record) = self.peers.get_mut(agent_id) {
            record.role = role;
        }
    }

    pub fn get_peer(&self, agent_id: &str) -> Option<&PeerRecord> {
        self.peers.get(agent_id)
    }

    pub fn alive_peers(&self, now_ms: i64) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|record| record.is_alive(now_ms, self.config.liveness_window_ms))
            .collect()
    }

    pub fn alive_peer_ids(&self, now_ms: i64) -> BTreeSet<String> {
        self.alive_peers(now_ms)
            .into_iter()
            .map(|record| record.agent_id.clone())
            .collect()
    }

    /// Alive constellation size, counting this agent.
    pub fn alive_count(&self, now_ms: i64) -> usize {
        self.alive_peers(now_ms).len() + 1
    }

    /// 1 minus the mean risk score over alive peers and self. An empty view
    /// reads as fully healthy.
    pub fn constellation_health(&self, now_ms: i64) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for record in self.alive_peers(now_ms) {
            if let Some(risk) = record.risk_score() {
                total += risk;
                count += 1;
            }
        }
        if let Some(own) = &self.own_health {
            total += own.risk_score;
            count += 1;
        }
        if count == 0 {
            1.0
        } else {
            (1.0 - total / count as f64).clamp(0.0, 1.0)
        }
    }

    /// Alive peers ordered by link quality, best first, for replica fanout.
    pub fn nearest_peers(&self, k: usize, now_ms: i64) -> Vec<String> {
        let mut alive: Vec<&PeerRecord> = self.alive_peers(now_ms);
        alive.sort_by(|a, b| {
            b.link_quality
                .partial_cmp(&a.link_quality)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        alive
            .into_iter()
            .take(k)
            .map(|record| record.agent_id.clone())
            .collect()
    }

    /// Drops peers silent past liveness + grace. Returns the pruned ids.
    pub fn prune(&mut self, now_ms: i64) -> Vec<String> {
        let horizon = self.config.liveness_window_ms + self.config.prune_grace_ms;
        let dead: Vec<String> = self
            .peers
            .values()
            .filter(|record| now_ms.saturating_sub(record.last_seen_ms) >= horizon)
            .map(|record| record.agent_id.clone())
            .collect();
        for agent_id in &dead {
            self.peers.remove(agent_id);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(agent_id: &str, risk: f64, at_ms: i64) -> HealthSummary {
        HealthSummary {
            agent_id: agent_id.to_string(),
            role: AgentRole::Backup,
            risk_score: risk,
            timestamp_ms: at_ms,
            subsystem_scores: Default::default(),
        }
    }

    fn registry() -> Registry {
        Registry::new("sat-a", RegistryConfig::default()).expect("registry")
    }

    #[test]
    fn observes_health_and_tracks_liveness() {
        let mut registry = registry();
        registry.observe_health(&summary("sat-b", 0.1, 1_000), 1_000);
        assert_eq!(registry.alive_count(1_500), 2);
        assert!(registry.get_peer("sat-b").is_some());

        // Past the liveness window the peer is dead but still remembered.
        assert_eq!(registry.alive_count(1_000 + 90_000), 1);
        assert!(registry.get_peer("sat-b").is_some());
    }

    #[test]
    fn ignores_own_summary_in_peer_map() {
        let mut registry = registry();
        registry.observe_health(&summary("sat-a", 0.5, 1_000), 1_000);
        assert!(registry.get_peer("sat-a").is_none());
    }

    #[test]
    fn stale_summary_refreshes_liveness_but_not_health() {
        let mut registry = registry();
        registry.observe_health(&summary("sat-b", 0.4, 2_000), 2_000);
        registry.observe_health(&summary("sat-b", 0.1, 1_000), 3_000);
        let record = registry.get_peer("sat-b").expect("record");
        assert_eq!(record.last_seen_ms, 3_000);
        assert_eq!(record.risk_score(), Some(0.4));
    }

    #[test]
    fn constellation_health_is_one_minus_mean_risk() {
        let mut registry = registry();
        registry.record_own_health(summary("sat-a", 0.2, 1_000));
        registry.observe_health(&summary("sat-b", 0.4, 1_000), 1_000);
        let health = registry.constellation_health(1_500);
        assert!((health - 0.7).abs() < 1e-9, "got {health}");
    }

    #[test]
    fn empty_view_reads_fully_healthy() {
        let registry = registry();
        assert_eq!(registry.constellation_health(0), 1.0);
    }

    #[test]
    fn prune_forgets_peers_after_grace() {
        let mut registry = registry();
        registry.observe_health(&summary("sat-b", 0.1, 0), 0);
        assert!(registry.prune(90_000).is_empty());
        let pruned = registry.prune(180_000);
        assert_eq!(pruned, vec!["sat-b".to_string()]);
        assert!(registry.get_peer("sat-b").is_none());
    }

    #[test]
    fn nearest_peers_orders_by_link_quality() {
        let mut registry = registry();
        for (id, quality) in [("sat-b", 0.3), ("sat-c", 0.9), ("sat-d", 0.6)] {
            registry.observe_health(&summary(id, 0.1, 1_000), 1_000);
            registry.observe_link_quality(id, quality);
        }
        assert_eq!(
            registry.nearest_peers(2, 1_500),
            vec!["sat-c".to_string(), "sat-d".to_string()]
        );
    }

    #[test]
    fn heartbeat_refreshes_liveness() {
        let mut registry = registry();
        registry.observe_health(&summary("sat-b", 0.1, 0), 0);
        registry.observe_heartbeat("sat-b", 80_000);
        assert_eq!(registry.alive_count(150_000), 2);
    }
}
