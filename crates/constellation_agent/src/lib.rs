//! Per-agent decision layer and runtime for the constellation coordination
//! fabric.
//!
//! A running agent owns one [`CoordinationCore`] (registry, bus, election,
//! consensus, propagation, reassignment, swarm memory) driven by a worker
//! thread, a [`DecisionLoop`] that wraps the external anomaly reasoner with
//! a cached global context, and a [`ResponseOrchestrator`] that routes each
//! decision through its scope's gates: nothing for LOCAL, consensus for
//! SWARM, safety simulation plus consensus for CONSTELLATION.

mod core;
mod decision;
mod error;
mod orchestrator;
mod runtime;
mod safety;
mod types;

pub use crate::core::{CoordinationCore, CoreCounters};
pub use decision::{Decision, DecisionLoop, DecisionLoopMetrics, GlobalContext, InnerReasoner};
pub use error::AgentError;
pub use orchestrator::{
    OrchestratorConfig, OrchestratorMetrics, ResponseOrchestrator, SystemWaitClock, WaitClock,
};
pub use runtime::{AgentMetricsSnapshot, AgentRuntime, AgentSnapshot};
pub use safety::{SafetyConfig, SafetyMetrics, SafetySimulator};
pub use types::{
    AcknowledgingEffector, AgentConfig, Effector, TelemetrySample, TelemetrySource,
};

pub use constellation_proto::{
    ActionName, ActionOutcome, AgentRole, AnomalyPattern, DecisionScope,
};

#[cfg(test)]
mod tests_runtime;
#[cfg(test)]
mod tests_scenarios;
