//! Shared wire surface for the constellation coordination fabric.
//!
//! Every payload that crosses an inter-satellite link is defined here, along
//! with the topic names they travel on, the transport abstraction the bus is
//! layered over, and the coordination error type shared by the fabric crates.

mod bus;
mod error;
mod ids;
mod messages;
mod time;
pub mod topics;

pub use bus::{BusTransport, QosLevel, TopicInbox, TopicSubscription};
pub use error::CoordError;
pub use ids::{blake3_hex, derive_id};
pub use messages::{
    ActionApproved, ActionCommand, ActionCompletion, ActionName, ActionOutcome, AgentRole,
    AnomalyPattern, Ballot, CoordEnvelope, DecisionRecord, DecisionScope, HealthSummary,
    Heartbeat, PatternQuery, PatternQueryResult, PatternReplica, Proposal, Vote, VoteRequest,
};
pub use time::{now_unix_ms, Uptime};
