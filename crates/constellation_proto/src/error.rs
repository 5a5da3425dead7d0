use std::fmt;

/// Coordination-fabric error shared across the bus and protocol crates.
///
/// Protocol outcomes with a specified fallback (quorum timeout, compliance
/// shortfall, safety veto) are values, not errors; this type covers the
/// failures a caller can actually act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    InvalidConfig { reason: String },
    Transport { reason: String },
    Backpressure { topic: String, queued: usize },
    InvalidMessage { reason: String },
    NotLeader { agent_id: String },
    LeaseExpired { agent_id: String },
    Serialization { reason: String },
    UnknownAction { name: String },
    UnknownPeer { agent_id: String },
    ProposalInFlight { action: String },
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordError::InvalidConfig { reason } => write!(f, "invalid config: {}", reason),
            CoordError::Transport { reason } => write!(f, "transport failure: {}", reason),
            CoordError::Backpressure { topic, queued } => {
                write!(f, "publish backpressure on {}: {} frames queued", topic, queued)
            }
            CoordError::InvalidMessage { reason } => write!(f, "invalid message: {}", reason),
            CoordError::NotLeader { agent_id } => {
                write!(f, "agent {} is not the elected leader", agent_id)
            }
            CoordError::LeaseExpired { agent_id } => {
                write!(f, "leader lease expired on agent {}", agent_id)
            }
            CoordError::Serialization { reason } => write!(f, "serialization failed: {}", reason),
            CoordError::UnknownAction { name } => write!(f, "unknown action name: {}", name),
            CoordError::UnknownPeer { agent_id } => write!(f, "unknown peer: {}", agent_id),
            CoordError::ProposalInFlight { action } => {
                write!(f, "a proposal for {} is already in flight", action)
            }
        }
    }
}

impl std::error::Error for CoordError {}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<serde_cbor::Error> for CoordError {
    fn from(err: serde_cbor::Error) -> Self {
        CoordError::Serialization {
            reason: err.to_string(),
        }
    }
}
