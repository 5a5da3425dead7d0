//! Global-context-wrapped decision loop.
//!
//! Wraps the external anomaly reasoner so that every agent facing the same
//! telemetry reasons against the same bounded snapshot of constellation
//! state. The snapshot is cached with a short TTL; the loop itself never
//! blocks the telemetry pipeline.

use constellation_proto::{ActionName, AgentRole, CoordError, DecisionRecord, DecisionScope};
use tracing::{debug, warn};

use crate::core::CoordinationCore;
use crate::types::TelemetrySample;

/// A scope-tagged action choice produced by the decision loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action_name: ActionName,
    pub params: serde_json::Value,
    pub scope: DecisionScope,
    pub confidence: f64,
    pub rationale: String,
}

impl Decision {
    /// The reasoning fallback: when judgment is unavailable, the only safe
    /// answer is constellation-wide safe mode at zero confidence.
    pub fn safe_mode_fallback(rationale: impl Into<String>) -> Self {
        Self {
            action_name: ActionName::SafeMode,
            params: serde_json::json!({}),
            scope: DecisionScope::Constellation,
            confidence: 0.0,
            rationale: rationale.into(),
        }
    }
}

/// Snapshot of constellation state the inner reasoner sees. Identical
/// context plus identical telemetry must yield identical decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalContext {
    pub leader_id: Option<String>,
    pub constellation_health: f64,
    pub quorum_size: usize,
    pub recent_decisions: Vec<DecisionRecord>,
    pub own_role: AgentRole,
    pub is_leader: bool,
    pub sampled_at_ms: i64,
}

/// The external anomaly reasoner. The wrapper guarantees every agent hands
/// it the same global context; the reasoner is the only place model-based
/// judgment enters.
pub trait InnerReasoner: Send {
    fn reason(
        &mut self,
        telemetry: &TelemetrySample,
        context: &GlobalContext,
    ) -> Result<Decision, CoordError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionLoopMetrics {
    pub decisions_total: u64,
    pub reasoning_fallbacks: u64,
    pub safe_mode_shortcuts: u64,
    pub context_cache_hits: u64,
    pub context_rebuilds: u64,
}

pub struct DecisionLoop {
    ttl_ms: i64,
    cached: Option<GlobalContext>,
    metrics: DecisionLoopMetrics,
}

impl DecisionLoop {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms: ttl_ms.max(1),
            cached: None,
            metrics: DecisionLoopMetrics::default(),
        }
    }

    pub fn metrics(&self) -> DecisionLoopMetrics {
        self.metrics
    }

    /// Fetches the cached context, rebuilding it synchronously on expiry.
    pub fn context(&mut self, core: &mut CoordinationCore, now_ms: i64) -> GlobalContext {
        if let Some(cached) = &self.cached {
            if now_ms.saturating_sub(cached.sampled_at_ms) < self.ttl_ms {
                self.metrics.context_cache_hits += 1;
                return cached.clone();
            }
        }
        self.metrics.context_rebuilds += 1;
        let context = GlobalContext {
            leader_id: core.election.leader_id(now_ms),
            constellation_health: core.registry.constellation_health(now_ms),
            quorum_size: core.quorum_size(now_ms),
            recent_decisions: core.memory.recent_decisions(),
            own_role: core.own_role(),
            is_leader: core.election.is_leader(),
            sampled_at_ms: now_ms,
        };
        self.cached = Some(context.clone());
        context
    }

    /// One decision step: attach the global context, shortcut to safe mode
    /// when the leader sees the constellation failing, otherwise defer to
    /// the inner reasoner with a safe-mode fallback on its failure.
    pub fn step(
        &mut self,
        core: &mut CoordinationCore,
        reasoner: &mut dyn InnerReasoner,
        telemetry: &TelemetrySample,
        now_ms: i64,
    ) -> Decision {
        let context = self.context(core, now_ms);
        let decision = if context.is_leader && context.constellation_health < 0.5 {
            self.metrics.safe_mode_shortcuts += 1;
            warn!(
                health = context.constellation_health,
                "constellation health low; leader shortcuts to safe mode"
            );
            Decision {
                rationale: "constellation health below 0.5".to_string(),
                confidence: 1.0,
                ..Decision::safe_mode_fallback("")
            }
        } else {
            match reasoner.reason(telemetry, &context) {
                Ok(decision) => decision,
                Err(err) => {
                    self.metrics.reasoning_fallbacks += 1;
                    warn!(error = %err, "inner reasoner failed; safe-mode fallback");
                    Decision::safe_mode_fallback(format!("reasoner failure: {err}"))
                }
            }
        };
        self.metrics.decisions_total += 1;
        core.memory.record_decision(DecisionRecord {
            action_name: decision.action_name,
            scope: decision.scope,
            confidence: decision.confidence,
            decided_at_ms: now_ms,
        });
        debug!(
            action = %decision.action_name,
            scope = %decision.scope,
            confidence = decision.confidence,
            "decision emitted"
        );
        decision
    }
}
