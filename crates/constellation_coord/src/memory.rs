//! Per-agent anomaly-pattern cache with best-effort replication.
//!
//! Local writes are authoritative. Each put fans the pattern out to the k
//! nearest peers by link quality; replicas are advisory and evicted first
//! under bandwidth pressure. A miss queries the same peer set with a bounded
//! timeout and settles for the first positive answer.

use std::collections::{BTreeMap, VecDeque};

use constellation_net::MessageBus;
use constellation_proto::{
    derive_id, topics, AnomalyPattern, CoordError, DecisionRecord, PatternQuery,
    PatternQueryResult, PatternReplica, QosLevel,
};
use tracing::debug;

use crate::metrics::MemoryMetrics;
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub agent_id: String,
    /// Replication fanout: patterns are pushed to this many nearest peers.
    pub replica_fanout_k: usize,
    pub query_timeout_ms: i64,
    /// Governor utilization above which replica eviction kicks in.
    pub eviction_utilization: f64,
    /// Fraction of the oldest replicas dropped per eviction pass.
    pub evict_fraction: f64,
    pub recent_decisions_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            replica_fanout_k: 3,
            query_timeout_ms: 2_000,
            eviction_utilization: 0.70,
            evict_fraction: 0.20,
            recent_decisions_capacity: 32,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "memory agent_id cannot be empty".to_string(),
            });
        }
        if self.query_timeout_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "memory query_timeout_ms must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.eviction_utilization)
            || !(0.0..=1.0).contains(&self.evict_fraction)
        {
            return Err(CoordError::InvalidConfig {
                reason: "memory eviction settings must be in [0,1]".to_string(),
            });
        }
        if self.recent_decisions_capacity == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "memory recent_decisions_capacity must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Progress of a peer lookup started by [`SwarmMemory::begin_remote_get`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteGet {
    Pending,
    Found(AnomalyPattern),
    Miss,
}

#[derive(Debug, Clone)]
struct PendingQuery {
    pattern_id: String,
    started_at_ms: i64,
    expected_responses: usize,
    negatives: usize,
    found: Option<AnomalyPattern>,
}

pub struct SwarmMemory {
    config: MemoryConfig,
    local: BTreeMap<String, AnomalyPattern>,
    replicas: BTreeMap<String, (AnomalyPattern, i64)>,
    pending: BTreeMap<String, PendingQuery>,
    query_counter: u64,
    recent_decisions: VecDeque<DecisionRecord>,
    metrics: MemoryMetrics,
}

impl SwarmMemory {
    pub fn new(config: MemoryConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            local: BTreeMap::new(),
            replicas: BTreeMap::new(),
            pending: BTreeMap::new(),
            query_counter: 0,
            recent_decisions: VecDeque::new(),
            metrics: MemoryMetrics::default(),
        })
    }

    pub fn metrics(&self) -> MemoryMetrics {
        self.metrics
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn replica_len(&self) -> usize {
        self.replicas.len()
    }

    /// Authoritative local write plus fire-and-forget replication to the
    /// nearest peers.
    pub fn put(
        &mut self,
        mut pattern: AnomalyPattern,
        now_ms: i64,
        registry: &Registry,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        if pattern.pattern_id.trim().is_empty() {
            return Err(CoordError::InvalidMessage {
                reason: "pattern_id cannot be empty".to_string(),
            });
        }
        pattern.origin_id = self.config.agent_id.clone();
        self.local.insert(pattern.pattern_id.clone(), pattern.clone());
        self.replicas.remove(&pattern.pattern_id);

        let targets = registry.nearest_peers(self.config.replica_fanout_k, now_ms);
        if targets.is_empty() {
            return Ok(());
        }
        let replica = PatternReplica {
            pattern,
            replicated_by: self.config.agent_id.clone(),
            targets: targets.into_iter().collect(),
        };
        let payload = serde_json::to_vec(&replica)?;
        if let Err(err) = bus.publish(
            topics::MEMORY_REPLICATE,
            &payload,
            QosLevel::AtLeastOnce,
            now_ms,
        ) {
            // Replication is best effort; the local write already landed.
            debug!(error = %err, "pattern replication deferred");
        }
        Ok(())
    }

    /// Stores an inbound replica if we are one of its targets. Local-authored
    /// entries always win over replicas of the same id.
    pub fn handle_replica(&mut self, replica: &PatternReplica, now_ms: i64) {
        if !replica.targets.contains(&self.config.agent_id) {
            return;
        }
        if replica.pattern.origin_id == self.config.agent_id {
            return;
        }
        if self.local.contains_key(&replica.pattern.pattern_id) {
            return;
        }
        self.replicas.insert(
            replica.pattern.pattern_id.clone(),
            (replica.pattern.clone(), now_ms),
        );
        self.metrics.replicas_stored += 1;
    }

    /// Local lookup: authored entries first, then replicas.
    pub fn get_local(&mut self, pattern_id: &str) -> Option<AnomalyPattern> {
        if let Some(pattern) = self.local.get(pattern_id) {
            self.metrics.local_hits += 1;
            return Some(pattern.clone());
        }
        if let Some((pattern, _)) = self.replicas.get(pattern_id) {
            self.metrics.replica_hits += 1;
            return Some(pattern.clone());
        }
        None
    }

    /// Starts a peer lookup after a local miss. Poll with
    /// [`SwarmMemory::poll_remote`].
    pub fn begin_remote_get(
        &mut self,
        pattern_id: &str,
        now_ms: i64,
        registry: &Registry,
        bus: &mut MessageBus,
    ) -> Result<String, CoordError> {
        self.query_counter += 1;
        let query_id = derive_id("query", &self.config.agent_id, self.query_counter, now_ms);
        let targets = registry.nearest_peers(self.config.replica_fanout_k, now_ms);
        let query = PatternQuery {
            query_id: query_id.clone(),
            pattern_id: pattern_id.to_string(),
            requester_id: self.config.agent_id.clone(),
            targets: targets.iter().cloned().collect(),
        };
        let payload = serde_json::to_vec(&query)?;
        if let Err(err) = bus.publish(topics::MEMORY_QUERY, &payload, QosLevel::AtLeastOnce, now_ms)
        {
            debug!(error = %err, "pattern query publish failed");
        }
        self.pending.insert(
            query_id.clone(),
            PendingQuery {
                pattern_id: pattern_id.to_string(),
                started_at_ms: now_ms,
                expected_responses: targets.len(),
                negatives: 0,
                found: None,
            },
        );
        Ok(query_id)
    }

    /// Responder side: answer queries addressed to us, positively or not.
    pub fn handle_query(
        &mut self,
        query: &PatternQuery,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        if !query.targets.contains(&self.config.agent_id) {
            return Ok(());
        }
        if query.requester_id == self.config.agent_id {
            return Ok(());
        }
        let pattern = self
            .local
            .get(&query.pattern_id)
            .cloned()
            .or_else(|| self.replicas.get(&query.pattern_id).map(|(p, _)| p.clone()));
        let result = PatternQueryResult {
            query_id: query.query_id.clone(),
            responder_id: self.config.agent_id.clone(),
            pattern,
        };
        let payload = serde_json::to_vec(&result)?;
        if let Err(err) = bus.publish(
            topics::MEMORY_QUERY_RESULT,
            &payload,
            QosLevel::AtLeastOnce,
            now_ms,
        ) {
            debug!(error = %err, "pattern query response failed");
        }
        Ok(())
    }

    /// Requester side: fold a peer's answer into the pending query.
    pub fn handle_query_result(&mut self, result: &PatternQueryResult) {
        let pending = match self.pending.get_mut(&result.query_id) {
            Some(pending) => pending,
            None => return,
        };
        match &result.pattern {
            Some(pattern) if pending.found.is_none() => {
                pending.found = Some(pattern.clone());
            }
            Some(_) => {}
            None => pending.negatives += 1,
        }
    }

    /// Resolves a peer lookup: first positive answer wins; all-negative or
    /// timeout resolves to a miss and the caller proceeds without the
    /// pattern.
    pub fn poll_remote(&mut self, query_id: &str, now_ms: i64) -> RemoteGet {
        let (resolved, pattern_id) = {
            let pending = match self.pending.get(query_id) {
                Some(pending) => pending,
                None => return RemoteGet::Miss,
            };
            if let Some(pattern) = &pending.found {
                (Some(pattern.clone()), pending.pattern_id.clone())
            } else if pending.expected_responses == 0
                || pending.negatives >= pending.expected_responses
                || now_ms.saturating_sub(pending.started_at_ms) >= self.config.query_timeout_ms
            {
                (None, pending.pattern_id.clone())
            } else {
                return RemoteGet::Pending;
            }
        };
        self.pending.remove(query_id);
        match resolved {
            Some(pattern) => {
                self.metrics.remote_hits += 1;
                self.replicas
                    .insert(pattern_id, (pattern.clone(), now_ms));
                RemoteGet::Found(pattern)
            }
            None => {
                self.metrics.misses += 1;
                RemoteGet::Miss
            }
        }
    }

    /// Drops the oldest replicas when the bandwidth governor reports
    /// pressure. Local-authored entries are never evicted. Returns the
    /// number of replicas dropped.
    pub fn evict_under_pressure(&mut self, utilization: f64) -> usize {
        if utilization <= self.config.eviction_utilization || self.replicas.is_empty() {
            return 0;
        }
        let count = ((self.replicas.len() as f64) * self.config.evict_fraction).ceil() as usize;
        let mut by_age: Vec<(String, i64)> = self
            .replicas
            .iter()
            .map(|(id, (_, at))| (id.clone(), *at))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let victims: Vec<String> = by_age.into_iter().take(count).map(|(id, _)| id).collect();
        for pattern_id in &victims {
            self.replicas.remove(pattern_id);
        }
        self.metrics.replicas_evicted += victims.len() as u64;
        victims.len()
    }

    /// Appends to the bounded recent-decisions ring consumed by the global
    /// context. Local only, never replicated.
    pub fn record_decision(&mut self, record: DecisionRecord) {
        self.recent_decisions.push_back(record);
        while self.recent_decisions.len() > self.config.recent_decisions_capacity {
            self.recent_decisions.pop_front();
        }
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.recent_decisions.iter().cloned().collect()
    }
}
