use std::collections::BTreeMap;
use std::time::Duration;

use constellation_coord::{
    ConsensusConfig, ElectionConfig, HealthBroadcasterConfig, MemoryConfig, PropagatorConfig,
    ReassignerConfig, RegistryConfig,
};
use constellation_proto::{ActionName, ActionOutcome, AgentRole};

use crate::error::AgentError;

/// One local telemetry sample handed to the decision loop by the
/// out-of-scope ingestion stack.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub source: String,
    pub readings: BTreeMap<String, f64>,
    pub captured_at_ms: i64,
}

/// Execution seam for LOCAL decisions and inbound action commands. The real
/// implementation lives with the spacecraft subsystems; tests mock it.
pub trait Effector: Send + Sync {
    fn apply(&self, action_name: ActionName, params: &serde_json::Value) -> ActionOutcome;
}

/// Effector that acknowledges everything. Useful for fleets whose execution
/// layer is wired up elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgingEffector;

impl Effector for AcknowledgingEffector {
    fn apply(&self, _action_name: ActionName, _params: &serde_json::Value) -> ActionOutcome {
        ActionOutcome::Success
    }
}

/// Pull seam for local telemetry; the runtime polls it every tick.
pub trait TelemetrySource: Send {
    fn poll(&mut self) -> Option<TelemetrySample>;
}

/// Full configuration for one agent, mirroring the deployment option table.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub initial_role: AgentRole,
    pub health_broadcast_interval_s: i64,
    pub liveness_window_s: i64,
    pub election_timeout_range_ms: (i64, i64),
    pub heartbeat_interval_s: i64,
    pub lease_duration_s: i64,
    pub consensus_default_timeout_s: i64,
    pub quorum_fraction_default: f64,
    pub action_deadline_default_s: i64,
    pub compliance_threshold: f64,
    pub constellation_compliance_threshold: f64,
    pub role_reassigner_interval_s: i64,
    pub hysteresis_consecutive_below: u32,
    pub memory_peer_replicas_k: usize,
    pub memory_eviction_utilization: f64,
    pub global_context_ttl_ms: i64,
    pub safety_risk_threshold: f64,
    pub safety_propagation_factor: f64,
    pub swarm_mode_enabled: bool,
    /// Deadline used when a SWARM decision fans out to the fleet.
    pub swarm_action_deadline_s: i64,
    pub tick_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            initial_role: AgentRole::Backup,
            health_broadcast_interval_s: 30,
            liveness_window_s: 90,
            election_timeout_range_ms: (150, 300),
            heartbeat_interval_s: 1,
            lease_duration_s: 10,
            consensus_default_timeout_s: 5,
            quorum_fraction_default: 2.0 / 3.0,
            action_deadline_default_s: 30,
            compliance_threshold: 0.90,
            constellation_compliance_threshold: 0.95,
            role_reassigner_interval_s: 30,
            hysteresis_consecutive_below: 3,
            memory_peer_replicas_k: 3,
            memory_eviction_utilization: 0.70,
            global_context_ttl_ms: 100,
            safety_risk_threshold: 0.10,
            safety_propagation_factor: 0.15,
            swarm_mode_enabled: true,
            swarm_action_deadline_s: 5,
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl AgentConfig {
    pub fn named(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent_id.trim().is_empty() {
            return Err(AgentError::InvalidConfig {
                reason: "agent_id is required".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(AgentError::InvalidConfig {
                reason: "tick_interval must be positive".to_string(),
            });
        }
        if self.swarm_action_deadline_s <= 0 || self.action_deadline_default_s <= 0 {
            return Err(AgentError::InvalidConfig {
                reason: "action deadlines must be positive".to_string(),
            });
        }
        if !(self.quorum_fraction_default > 0.0 && self.quorum_fraction_default <= 1.0) {
            return Err(AgentError::InvalidConfig {
                reason: format!(
                    "quorum_fraction_default out of (0,1]: {}",
                    self.quorum_fraction_default
                ),
            });
        }
        if self.global_context_ttl_ms <= 0 {
            return Err(AgentError::InvalidConfig {
                reason: "global_context_ttl_ms must be positive".to_string(),
            });
        }
        // Component configs re-validate on construction; build them here so
        // a bad aggregate fails fast with the underlying reason.
        self.registry_config().validate().map_err(AgentError::from)?;
        self.election_config().validate().map_err(AgentError::from)?;
        self.consensus_config().validate().map_err(AgentError::from)?;
        self.propagator_config()
            .validate()
            .map_err(AgentError::from)?;
        self.reassigner_config()
            .validate()
            .map_err(AgentError::from)?;
        self.memory_config().validate().map_err(AgentError::from)?;
        self.broadcaster_config()
            .validate()
            .map_err(AgentError::from)?;
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            liveness_window_ms: self.liveness_window_s * 1_000,
            prune_grace_ms: self.liveness_window_s * 1_000,
        }
    }

    pub fn broadcaster_config(&self) -> HealthBroadcasterConfig {
        HealthBroadcasterConfig {
            interval_ms: self.health_broadcast_interval_s * 1_000,
        }
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            agent_id: self.agent_id.clone(),
            election_timeout_min_ms: self.election_timeout_range_ms.0,
            election_timeout_max_ms: self.election_timeout_range_ms.1,
            heartbeat_interval_ms: self.heartbeat_interval_s * 1_000,
            lease_duration_ms: self.lease_duration_s * 1_000,
            candidacy_timeout_ms: (self.heartbeat_interval_s * 1_000).max(500),
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        let mut config = ConsensusConfig {
            agent_id: self.agent_id.clone(),
            ..ConsensusConfig::default()
        };
        config.default_policy.quorum_fraction = self.quorum_fraction_default;
        config.default_policy.timeout_ms = self.consensus_default_timeout_s * 1_000;
        config
    }

    pub fn propagator_config(&self) -> PropagatorConfig {
        PropagatorConfig {
            agent_id: self.agent_id.clone(),
            default_deadline_ms: self.action_deadline_default_s * 1_000,
            compliance_threshold: self.compliance_threshold,
            ..PropagatorConfig::default()
        }
    }

    pub fn reassigner_config(&self) -> ReassignerConfig {
        ReassignerConfig {
            interval_ms: self.role_reassigner_interval_s * 1_000,
            hysteresis_consecutive: self.hysteresis_consecutive_below,
            compliance_floor: self.compliance_threshold,
            ..ReassignerConfig::default()
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            agent_id: self.agent_id.clone(),
            replica_fanout_k: self.memory_peer_replicas_k,
            eviction_utilization: self.memory_eviction_utilization,
            ..MemoryConfig::default()
        }
    }
}
