use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// Operational role of an agent. Orthogonal to leadership: any role except
/// `SafeMode` may win an election, but only `Backup` agents are considered
/// for promotion when a `Primary` degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Primary,
    Backup,
    Standby,
    SafeMode,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Primary => "primary",
            AgentRole::Backup => "backup",
            AgentRole::Standby => "standby",
            AgentRole::SafeMode => "safe_mode",
        }
    }

    /// One-step promotion ladder used by the role reassigner.
    pub fn promoted(self) -> Option<AgentRole> {
        match self {
            AgentRole::SafeMode => Some(AgentRole::Standby),
            AgentRole::Standby => Some(AgentRole::Backup),
            AgentRole::Backup | AgentRole::Primary => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = CoordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(AgentRole::Primary),
            "backup" => Ok(AgentRole::Backup),
            "standby" => Ok(AgentRole::Standby),
            "safe_mode" => Ok(AgentRole::SafeMode),
            _ => Err(CoordError::InvalidMessage {
                reason: format!("unknown agent role: {raw}"),
            }),
        }
    }
}

/// The closed set of constellation-wide actions the fabric can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    SafeMode,
    RoleReassign,
    AttitudeAdjust,
    LoadShed,
    ThermalManeuver,
}

impl ActionName {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionName::SafeMode => "safe_mode",
            ActionName::RoleReassign => "role_reassign",
            ActionName::AttitudeAdjust => "attitude_adjust",
            ActionName::LoadShed => "load_shed",
            ActionName::ThermalManeuver => "thermal_maneuver",
        }
    }

    pub fn all() -> [ActionName; 5] {
        [
            ActionName::SafeMode,
            ActionName::RoleReassign,
            ActionName::AttitudeAdjust,
            ActionName::LoadShed,
            ActionName::ThermalManeuver,
        ]
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionName {
    type Err = CoordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe_mode" => Ok(ActionName::SafeMode),
            "role_reassign" => Ok(ActionName::RoleReassign),
            "attitude_adjust" => Ok(ActionName::AttitudeAdjust),
            "load_shed" => Ok(ActionName::LoadShed),
            "thermal_maneuver" => Ok(ActionName::ThermalManeuver),
            _ => Err(CoordError::UnknownAction {
                name: raw.to_string(),
            }),
        }
    }
}

/// Execution breadth of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionScope {
    Local,
    Swarm,
    Constellation,
}

impl fmt::Display for DecisionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DecisionScope::Local => "local",
            DecisionScope::Swarm => "swarm",
            DecisionScope::Constellation => "constellation",
        };
        f.write_str(label)
    }
}

/// Periodic self-report broadcast on `health/summary`.
///
/// `risk_score` is in [0,1]; 0.3 and above marks the producer degraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub agent_id: String,
    pub role: AgentRole,
    pub risk_score: f64,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subsystem_scores: BTreeMap<String, f64>,
}

impl HealthSummary {
    pub fn is_degraded(&self) -> bool {
        self.risk_score >= 0.3
    }
}

/// Leader lease renewal broadcast on `coord/heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub leader_id: String,
    pub term: u64,
    pub sent_at_ms: i64,
}

/// Candidacy announcement broadcast on `coord/vote_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub uptime_seconds: u64,
}

/// What a vote is about: a leadership election or a consensus proposal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ballot {
    Election { term: u64, candidate_id: String },
    Proposal { proposal_id: String },
}

/// Vote published on `coord/vote_grant` or `coord/vote_deny`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: u64,
    pub ballot: Ballot,
    pub voter_id: String,
    pub grant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Leader-originated proposal broadcast on `coord/proposal_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub action_name: ActionName,
    pub params: serde_json::Value,
    pub proposer_id: String,
    pub term: u64,
    pub deadline_ms: i64,
}

/// Binding approval broadcast on `coord/action_approved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionApproved {
    pub proposal_id: String,
    pub action_name: ActionName,
    pub params: serde_json::Value,
    pub approved_at_ms: i64,
    /// True when approval came from the leader's timeout fallback rather
    /// than a counted quorum.
    #[serde(default)]
    pub fallback: bool,
}

/// Reliable action broadcast on `control/action_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub action_id: String,
    pub action_name: ActionName,
    pub params: serde_json::Value,
    pub target_agents: BTreeSet<String>,
    pub deadline_ms: i64,
    pub originator_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Partial,
    Failed,
}

/// Per-target execution report published on `control/action_completion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCompletion {
    pub action_id: String,
    pub agent_id: String,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at_ms: i64,
}

/// Anomaly signature owned by its producing agent. Replicas held by peers
/// are advisory; the producer's copy is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPattern {
    pub pattern_id: String,
    pub signature: Vec<f32>,
    pub risk_score: f64,
    pub recurrence_count: u32,
    pub last_seen_ms: i64,
    pub origin_id: String,
}

/// Replication fanout payload on `memory/replicate`. The bus is a broadcast
/// medium, so the chosen replica holders ride along in `targets`; agents not
/// named there ignore the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReplica {
    pub pattern: AnomalyPattern,
    pub replicated_by: String,
    pub targets: BTreeSet<String>,
}

/// Cache-miss lookup broadcast on `memory/query`, addressed to the
/// requester's nearest peers via `targets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternQuery {
    pub query_id: String,
    pub pattern_id: String,
    pub requester_id: String,
    pub targets: BTreeSet<String>,
}

/// Lookup response on `memory/query_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternQueryResult {
    pub query_id: String,
    pub responder_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<AnomalyPattern>,
}

/// Compact entry in the recent-decisions ring that feeds the global context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub action_name: ActionName,
    pub scope: DecisionScope,
    pub confidence: f64,
    pub decided_at_ms: i64,
}

/// Typed union over every coordination payload. Inbound dispatch decodes a
/// (topic, bytes) pair into one of these; transports that multiplex all
/// topics over a single socket can also carry it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordEnvelope {
    HealthSummary(HealthSummary),
    Heartbeat(Heartbeat),
    VoteRequest(VoteRequest),
    Vote(Vote),
    Proposal(Proposal),
    ActionApproved(ActionApproved),
    ActionCommand(ActionCommand),
    ActionCompletion(ActionCompletion),
    PatternReplica(PatternReplica),
    PatternQuery(PatternQuery),
    PatternQueryResult(PatternQueryResult),
}

impl CoordEnvelope {
    /// Decodes a payload according to the topic it arrived on.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, CoordError> {
        let envelope = match topic {
            crate::topics::HEALTH_SUMMARY => {
                CoordEnvelope::HealthSummary(serde_json::from_slice(payload)?)
            }
            crate::topics::COORD_HEARTBEAT => {
                CoordEnvelope::Heartbeat(serde_json::from_slice(payload)?)
            }
            crate::topics::COORD_VOTE_REQUEST => {
                CoordEnvelope::VoteRequest(serde_json::from_slice(payload)?)
            }
            crate::topics::COORD_VOTE_GRANT | crate::topics::COORD_VOTE_DENY => {
                CoordEnvelope::Vote(serde_json::from_slice(payload)?)
            }
            crate::topics::COORD_PROPOSAL_REQUEST => {
                CoordEnvelope::Proposal(serde_json::from_slice(payload)?)
            }
            crate::topics::COORD_ACTION_APPROVED => {
                CoordEnvelope::ActionApproved(serde_json::from_slice(payload)?)
            }
            crate::topics::CONTROL_ACTION_COMMAND => {
                CoordEnvelope::ActionCommand(serde_json::from_slice(payload)?)
            }
            crate::topics::CONTROL_ACTION_COMPLETION => {
                CoordEnvelope::ActionCompletion(serde_json::from_slice(payload)?)
            }
            crate::topics::MEMORY_REPLICATE => {
                CoordEnvelope::PatternReplica(serde_json::from_slice(payload)?)
            }
            crate::topics::MEMORY_QUERY => {
                CoordEnvelope::PatternQuery(serde_json::from_slice(payload)?)
            }
            crate::topics::MEMORY_QUERY_RESULT => {
                CoordEnvelope::PatternQueryResult(serde_json::from_slice(payload)?)
            }
            other => {
                return Err(CoordError::InvalidMessage {
                    reason: format!("no payload mapping for topic: {other}"),
                })
            }
        };
        Ok(envelope)
    }
}
