//! Per-component counters. Plain copyable structs; the agent runtime folds
//! them into one operator-facing snapshot.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElectionMetrics {
    pub elections_started: u64,
    pub elections_won: u64,
    pub stepdowns: u64,
    pub votes_granted: u64,
    pub votes_denied: u64,
    /// Milliseconds from lease loss to the next established leader, for the
    /// most recent completed failover.
    pub last_failover_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsensusMetrics {
    pub proposals_started: u64,
    pub proposals_approved: u64,
    pub proposals_denied: u64,
    pub proposals_timed_out: u64,
    /// Approvals minted by the leader's timeout fallback.
    pub leader_fallbacks: u64,
    pub duplicate_requests_answered: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagatorMetrics {
    pub actions_propagated: u64,
    pub actions_compliant: u64,
    pub actions_escalated: u64,
    pub duplicate_completions_ignored: u64,
    pub late_completions_recorded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassignerMetrics {
    pub role_changes_total: u64,
    pub promotions_proposed: u64,
    pub demotions_proposed: u64,
    pub flapping_events_blocked: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub local_hits: u64,
    pub replica_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub replicas_stored: u64,
    pub replicas_evicted: u64,
}

impl MemoryMetrics {
    /// Local-cache hit rate over all lookups observed so far.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.replica_hits;
        let total = hits + self.remote_hits + self.misses;
        if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        }
    }
}
