use std::fmt;

use constellation_proto::CoordError;

/// Agent-runtime lifecycle and orchestration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    InvalidConfig { reason: String },
    Coordination { reason: String },
    AlreadyRunning { agent_id: String },
    NotRunning { agent_id: String },
    ThreadSpawnFailed { reason: String },
    ThreadJoinFailed { agent_id: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::InvalidConfig { reason } => write!(f, "invalid agent config: {}", reason),
            AgentError::Coordination { reason } => write!(f, "coordination error: {}", reason),
            AgentError::AlreadyRunning { agent_id } => {
                write!(f, "agent runtime already running: {}", agent_id)
            }
            AgentError::NotRunning { agent_id } => {
                write!(f, "agent runtime not running: {}", agent_id)
            }
            AgentError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn agent worker: {}", reason)
            }
            AgentError::ThreadJoinFailed { agent_id } => {
                write!(f, "failed to join agent worker: {}", agent_id)
            }
        }
    }
}

impl std::error::Error for AgentError {}

impl From<CoordError> for AgentError {
    fn from(err: CoordError) -> Self {
        AgentError::Coordination {
            reason: err.to_string(),
        }
    }
}
