//! Bus topic names. The set is closed; transports may multiplex all of them
//! over a single datagram socket using [`crate::CoordEnvelope`].

pub const HEALTH_SUMMARY: &str = "health/summary";
pub const COORD_HEARTBEAT: &str = "coord/heartbeat";
pub const COORD_VOTE_REQUEST: &str = "coord/vote_request";
pub const COORD_VOTE_GRANT: &str = "coord/vote_grant";
pub const COORD_VOTE_DENY: &str = "coord/vote_deny";
pub const COORD_PROPOSAL_REQUEST: &str = "coord/proposal_request";
pub const COORD_ACTION_APPROVED: &str = "coord/action_approved";
pub const CONTROL_ACTION_COMMAND: &str = "control/action_command";
pub const CONTROL_ACTION_COMPLETION: &str = "control/action_completion";
pub const MEMORY_REPLICATE: &str = "memory/replicate";
pub const MEMORY_QUERY: &str = "memory/query";
pub const MEMORY_QUERY_RESULT: &str = "memory/query_result";

/// Per-agent acknowledgement topic used by the bus QoS layer.
pub fn ack_topic(agent_id: &str) -> String {
    format!("bus/ack/{agent_id}")
}

/// All broadcast topics an agent subscribes to at start.
pub fn broadcast_topics() -> Vec<&'static str> {
    vec![
        HEALTH_SUMMARY,
        COORD_HEARTBEAT,
        COORD_VOTE_REQUEST,
        COORD_VOTE_GRANT,
        COORD_VOTE_DENY,
        COORD_PROPOSAL_REQUEST,
        COORD_ACTION_APPROVED,
        CONTROL_ACTION_COMMAND,
        CONTROL_ACTION_COMPLETION,
        MEMORY_REPLICATE,
        MEMORY_QUERY,
        MEMORY_QUERY_RESULT,
    ]
}
