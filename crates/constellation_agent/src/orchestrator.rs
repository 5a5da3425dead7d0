//! Scope-routed execution of decisions.
//!
//! LOCAL runs straight through the effector. SWARM requires leadership and
//! quorum consensus before fanning out. CONSTELLATION adds the safety
//! simulator in front of consensus and raises the compliance bar. A master
//! feature flag reduces every scope to LOCAL as a graceful fallback.
//!
//! Every timestamp in here comes from the installed [`WaitClock`], never
//! from the wall clock directly: the agent runtime installs the system
//! clock, tests install virtual time, and the blocking proposal waits
//! replay deterministically either way.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use constellation_proto::{now_unix_ms, ActionOutcome, CoordError, DecisionScope};
use tracing::{info, warn};

use crate::core::CoordinationCore;
use crate::decision::Decision;
use crate::safety::{SafetyConfig, SafetySimulator};
use crate::types::AgentConfig;

/// Source of protocol timestamps for the orchestrator's blocking waits.
pub trait WaitClock: Send {
    /// Current protocol time.
    fn now_ms(&mut self) -> i64;

    /// Blocks (or, under test, advances virtual time) until the next poll
    /// opportunity.
    fn wait(&mut self);
}

/// Wall-clock [`WaitClock`] the agent runtime installs.
#[derive(Debug, Clone, Copy)]
pub struct SystemWaitClock {
    poll_interval: Duration,
}

impl SystemWaitClock {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl WaitClock for SystemWaitClock {
    fn now_ms(&mut self) -> i64 {
        now_unix_ms()
    }

    fn wait(&mut self) {
        std::thread::sleep(self.poll_interval);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub swarm_mode_enabled: bool,
    pub swarm_deadline_ms: i64,
    pub constellation_deadline_ms: i64,
    pub swarm_compliance_bar: f64,
    pub constellation_compliance_bar: f64,
    /// Cadence of the proposal-wait loop.
    pub poll_interval: Duration,
    /// How long to wait for a per-action proposal slot before giving up.
    pub propose_slot_wait_ms: i64,
}

impl OrchestratorConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            swarm_mode_enabled: config.swarm_mode_enabled,
            swarm_deadline_ms: config.swarm_action_deadline_s * 1_000,
            constellation_deadline_ms: config.action_deadline_default_s * 1_000,
            swarm_compliance_bar: config.compliance_threshold,
            constellation_compliance_bar: config.constellation_compliance_threshold,
            poll_interval: Duration::from_millis(5),
            propose_slot_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorMetrics {
    pub local_executions: u64,
    pub swarm_executions: u64,
    pub constellation_executions: u64,
    pub denied_not_leader: u64,
    pub safety_gate_blocks: u64,
    pub consensus_denials: u64,
    pub failures: u64,
}

pub struct ResponseOrchestrator {
    config: OrchestratorConfig,
    safety: SafetySimulator,
    clock: Box<dyn WaitClock>,
    metrics: OrchestratorMetrics,
}

impl ResponseOrchestrator {
    pub fn new(config: OrchestratorConfig, safety_config: SafetyConfig) -> Self {
        let clock = Box::new(SystemWaitClock::new(config.poll_interval));
        Self {
            config,
            safety: SafetySimulator::new(safety_config),
            clock,
            metrics: OrchestratorMetrics::default(),
        }
    }

    /// Replaces the installed clock. Tests use this to drive the blocking
    /// waits on virtual time.
    pub fn with_clock(mut self, clock: Box<dyn WaitClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        self.metrics
    }

    pub fn safety_metrics(&self) -> crate::safety::SafetyMetrics {
        self.safety.metrics()
    }

    /// Executes a decision according to its scope tag (or an explicit
    /// override). Returns whether every stage of the chosen path succeeded.
    /// Never raises: failures surface as `false` plus counters.
    pub fn execute(
        &mut self,
        core: &Arc<Mutex<CoordinationCore>>,
        decision: &Decision,
        scope_override: Option<DecisionScope>,
    ) -> bool {
        let scope = if self.config.swarm_mode_enabled {
            scope_override.unwrap_or(decision.scope)
        } else {
            // Feature flag off: everything degrades to local execution.
            DecisionScope::Local
        };
        match scope {
            DecisionScope::Local => self.execute_local(core, decision),
            DecisionScope::Swarm => self.execute_swarm(core, decision),
            DecisionScope::Constellation => self.execute_constellation(core, decision),
        }
    }

    fn execute_local(&mut self, core: &Arc<Mutex<CoordinationCore>>, decision: &Decision) -> bool {
        let outcome = {
            let mut guard = lock_core(core);
            guard.execute_local(decision.action_name, &decision.params)
        };
        self.metrics.local_executions += 1;
        outcome == ActionOutcome::Success
    }

    fn execute_swarm(&mut self, core: &Arc<Mutex<CoordinationCore>>, decision: &Decision) -> bool {
        if !self.gate_leadership(core) {
            return false;
        }
        match self.propose_and_wait(core, decision) {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.consensus_denials += 1;
                return false;
            }
            Err(err) => {
                self.metrics.failures += 1;
                warn!(error = %err, "swarm proposal failed");
                return false;
            }
        }
        let deadline = self.config.swarm_deadline_ms;
        let bar = self.config.swarm_compliance_bar;
        if !self.fan_out(core, decision, deadline, bar) {
            return false;
        }
        self.metrics.swarm_executions += 1;
        true
    }

    fn execute_constellation(
        &mut self,
        core: &Arc<Mutex<CoordinationCore>>,
        decision: &Decision,
    ) -> bool {
        if !self.gate_leadership(core) {
            return false;
        }
        let neighbors = {
            let now = self.clock.now_ms();
            let guard = lock_core(core);
            guard.registry.alive_count(now).saturating_sub(1)
        };
        // The safety gate runs before any consensus budget is spent.
        if !self.safety.validate(decision, neighbors) {
            self.metrics.safety_gate_blocks += 1;
            return false;
        }
        match self.propose_and_wait(core, decision) {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.consensus_denials += 1;
                return false;
            }
            Err(err) => {
                self.metrics.failures += 1;
                warn!(error = %err, "constellation proposal failed");
                return false;
            }
        }
        let deadline = self.config.constellation_deadline_ms;
        let bar = self.config.constellation_compliance_bar;
        if !self.fan_out(core, decision, deadline, bar) {
            return false;
        }
        self.metrics.constellation_executions += 1;
        true
    }

    fn gate_leadership(&mut self, core: &Arc<Mutex<CoordinationCore>>) -> bool {
        let now = self.clock.now_ms();
        let guard = lock_core(core);
        if guard.is_acting_leader(now) {
            return true;
        }
        self.metrics.denied_not_leader += 1;
        info!(
            agent_id = guard.agent_id(),
            "fleet-scoped decision denied: not the leader"
        );
        false
    }

    /// Opens a proposal and pumps the core until quorum or the protocol's
    /// deadline fallback resolves it. Time advances only through the
    /// installed clock.
    fn propose_and_wait(
        &mut self,
        core: &Arc<Mutex<CoordinationCore>>,
        decision: &Decision,
    ) -> Result<bool, CoordError> {
        let started = self.clock.now_ms();
        let proposal_id = loop {
            let now = self.clock.now_ms();
            let mut guard = lock_core(core);
            match guard.begin_decision_proposal(decision.action_name, decision.params.clone(), now)
            {
                Ok(proposal_id) => break proposal_id,
                Err(CoordError::ProposalInFlight { .. })
                    if now.saturating_sub(started) < self.config.propose_slot_wait_ms =>
                {
                    drop(guard);
                    self.clock.wait();
                }
                Err(err) => return Err(err),
            }
        };
        loop {
            self.clock.wait();
            let now = self.clock.now_ms();
            let mut guard = lock_core(core);
            guard.pump(now)?;
            if let Some(approved) = guard.poll_decision_proposal(&proposal_id, now)? {
                return Ok(approved);
            }
        }
    }

    /// Propagates the approved action to every alive peer and applies it
    /// locally (the leader never hears its own broadcast).
    fn fan_out(
        &mut self,
        core: &Arc<Mutex<CoordinationCore>>,
        decision: &Decision,
        deadline_ms: i64,
        compliance_bar: f64,
    ) -> bool {
        let now = self.clock.now_ms();
        let mut guard = lock_core(core);
        match guard.propagate_approved(
            decision.action_name,
            decision.params.clone(),
            deadline_ms,
            compliance_bar,
            now,
        ) {
            Ok(_) => {
                guard.execute_local(decision.action_name, &decision.params);
                true
            }
            Err(err) => {
                self.metrics.failures += 1;
                warn!(error = %err, "action propagation failed");
                false
            }
        }
    }
}

fn lock_core(core: &Arc<Mutex<CoordinationCore>>) -> MutexGuard<'_, CoordinationCore> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
