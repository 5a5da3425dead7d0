//! Distributed coordination core: peer registry, health exchange, leader
//! election, quorum consensus, action propagation, role reassignment and the
//! replicated anomaly-pattern memory.
//!
//! Every state machine in this crate is tick-driven and takes `now_ms`
//! explicitly; only the agent runtime reads the wall clock.

mod consensus;
mod election;
mod health;
mod memory;
mod metrics;
mod propagator;
mod registry;
mod reassigner;

pub use consensus::{
    ActionPolicy, ConsensusConfig, ConsensusEngine, ProposalRecord, ProposalStatus, VotePolicy,
};
pub use election::{
    ElectionConfig, ElectionReport, ElectionState, HeartbeatLease, LeaderElection,
};
pub use health::{HealthBroadcaster, HealthBroadcasterConfig};
pub use memory::{MemoryConfig, RemoteGet, SwarmMemory};
pub use metrics::{
    ConsensusMetrics, ElectionMetrics, MemoryMetrics, PropagatorMetrics, ReassignerMetrics,
};
pub use propagator::{
    ActionPropagator, ActionState, ActionStatus, ComplianceWindow, PropagatorConfig,
};
pub use registry::{PeerRecord, Registry, RegistryConfig};
pub use reassigner::{
    FailureMode, HealthHistory, ReassignerConfig, RoleChange, RoleChangeKind, RoleReassigner,
};

#[cfg(test)]
mod election_tests;
#[cfg(test)]
mod consensus_tests;
