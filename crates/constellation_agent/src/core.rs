//! The coordination core: one struct owning the bus and every protocol
//! component, advanced by a single `pump` call per scheduling tick.
//!
//! The runtime worker thread and the response orchestrator share the core
//! behind one mutex; all methods take explicit timestamps so the whole
//! machine is deterministic under test.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use constellation_coord::{
    ActionPropagator, ConsensusEngine, HealthBroadcaster, LeaderElection, Registry, RoleChange,
    RoleReassigner, SwarmMemory,
};
use constellation_net::{BusConfig, MessageBus};
use constellation_proto::{
    topics, ActionApproved, ActionCommand, ActionName, AgentRole, Ballot, BusTransport,
    CoordError, CoordEnvelope, DecisionScope, HealthSummary, QosLevel,
};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::types::{AgentConfig, Effector};

/// Counters owned directly by the core (everything else lives in the
/// component metrics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreCounters {
    pub invalid_messages: u64,
    pub commands_executed: u64,
    pub role_changes_applied: u64,
    pub solo_safe_mode_entries: u64,
    pub decision_divergence: u64,
}

pub struct CoordinationCore {
    config: AgentConfig,
    pub bus: MessageBus,
    pub registry: Registry,
    pub broadcaster: HealthBroadcaster,
    pub election: LeaderElection,
    pub consensus: ConsensusEngine,
    pub propagator: ActionPropagator,
    pub reassigner: RoleReassigner,
    pub memory: SwarmMemory,
    effector: Arc<dyn Effector>,
    own_risk: f64,
    degraded_risk_threshold: f64,
    peers_ever_seen: bool,
    /// Role changes awaiting their turn through consensus, one per proposal.
    role_change_queue: VecDeque<RoleChange>,
    active_role_proposal: Option<(String, RoleChange)>,
    counters: CoreCounters,
}

impl CoordinationCore {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn BusTransport>,
        effector: Arc<dyn Effector>,
        started_at_ms: i64,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let mut bus = MessageBus::new(transport, BusConfig::default()).map_err(AgentError::from)?;
        for topic in topics::broadcast_topics() {
            bus.subscribe(topic, QosLevel::ExactlyOnce)
                .map_err(AgentError::from)?;
        }
        let mut registry = Registry::new(&config.agent_id, config.registry_config())
            .map_err(AgentError::from)?;
        registry.set_own_role(config.initial_role);
        let mut election = LeaderElection::new(config.election_config(), started_at_ms)
            .map_err(AgentError::from)?;
        election.set_eligibility(config.initial_role != AgentRole::SafeMode);
        let broadcaster =
            HealthBroadcaster::new(config.broadcaster_config()).map_err(AgentError::from)?;
        let consensus =
            ConsensusEngine::new(config.consensus_config()).map_err(AgentError::from)?;
        let propagator =
            ActionPropagator::new(config.propagator_config()).map_err(AgentError::from)?;
        let reassigner =
            RoleReassigner::new(config.reassigner_config()).map_err(AgentError::from)?;
        let memory = SwarmMemory::new(config.memory_config()).map_err(AgentError::from)?;
        let degraded_risk_threshold = config.reassigner_config().degraded_risk_threshold;
        Ok(Self {
            config,
            bus,
            registry,
            broadcaster,
            election,
            consensus,
            propagator,
            reassigner,
            memory,
            effector,
            own_risk: 0.0,
            degraded_risk_threshold,
            peers_ever_seen: false,
            role_change_queue: VecDeque::new(),
            active_role_proposal: None,
            counters: CoreCounters::default(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent_id(&self) -> &str {
        self.registry.self_id()
    }

    pub fn counters(&self) -> CoreCounters {
        self.counters
    }

    pub fn own_role(&self) -> AgentRole {
        self.registry.own_role()
    }

    /// The local anomaly stack reports its current risk here; health
    /// broadcasts and the reassigner's self-history consume it.
    pub fn set_own_risk(&mut self, risk: f64) {
        self.own_risk = risk.clamp(0.0, 1.0);
    }

    pub fn own_risk(&self) -> f64 {
        self.own_risk
    }

    /// Quorum the consensus layer would require right now, for the global
    /// context snapshot.
    pub fn quorum_size(&self, now_ms: i64) -> usize {
        let alive = self.registry.alive_count(now_ms);
        ((alive as f64 * self.config.quorum_fraction_default).ceil() as usize).max(1)
    }

    /// One full scheduling step: QoS bus, inbound dispatch, periodic
    /// broadcasts, election, sweeps and leader duties.
    pub fn pump(&mut self, now_ms: i64) -> Result<(), CoordError> {
        self.bus.tick(now_ms)?;
        self.dispatch_inbound(now_ms)?;
        self.broadcast_own_health(now_ms)?;

        let alive = self.registry.alive_count(now_ms);
        self.election.tick(now_ms, alive, &mut self.bus)?;
        self.guard_solo_operation(now_ms, alive);

        self.consensus.sweep(now_ms);
        self.propagator.sweep(now_ms);
        self.leader_duties(now_ms)?;

        self.registry.prune(now_ms);
        let utilization = self.bus.utilization(now_ms);
        self.memory.evict_under_pressure(utilization);
        // Safe-mode agents are not electable, and a degraded agent has no
        // business leading either: it abdicates and defers until it
        // recovers, so the next election lands on a healthy peer.
        self.election.set_eligibility(
            self.registry.own_role() != AgentRole::SafeMode
                && self.own_risk < self.degraded_risk_threshold,
        );
        Ok(())
    }

    /// Leader check used by the orchestrator's scope gates.
    pub fn is_acting_leader(&self, now_ms: i64) -> bool {
        self.election.is_leader_with_lease(now_ms)
    }

    /// Runs a LOCAL decision through the execution effector.
    pub fn execute_local(
        &mut self,
        action_name: ActionName,
        params: &serde_json::Value,
    ) -> constellation_proto::ActionOutcome {
        self.counters.commands_executed += 1;
        self.effector.apply(action_name, params)
    }

    /// Opens an orchestrator-driven proposal with the action's configured
    /// quorum and timeout.
    pub fn begin_decision_proposal(
        &mut self,
        action: ActionName,
        params: serde_json::Value,
        now_ms: i64,
    ) -> Result<String, CoordError> {
        let alive = self.registry.alive_count(now_ms);
        self.consensus.begin_proposal(
            action,
            params,
            None,
            &self.election,
            alive,
            now_ms,
            &mut self.bus,
        )
    }

    pub fn poll_decision_proposal(
        &mut self,
        proposal_id: &str,
        now_ms: i64,
    ) -> Result<Option<bool>, CoordError> {
        self.consensus
            .poll_proposal(proposal_id, now_ms, &mut self.bus)
    }

    /// Fans an approved action out to every alive peer. Returns `None` when
    /// there is no peer to target (a lone agent executes locally only).
    pub fn propagate_approved(
        &mut self,
        action: ActionName,
        params: serde_json::Value,
        deadline_ms: i64,
        compliance_bar: f64,
        now_ms: i64,
    ) -> Result<Option<String>, CoordError> {
        let targets = self.registry.alive_peer_ids(now_ms);
        if targets.is_empty() {
            return Ok(None);
        }
        self.propagator
            .propagate_with_bar(
                action,
                params,
                targets,
                deadline_ms,
                compliance_bar,
                &self.election,
                now_ms,
                &mut self.bus,
            )
            .map(Some)
    }

    /// Dispatch order matters in two places: vote denies land before grants
    /// (a candidacy yield must precede tallying), and registry-feeding
    /// topics come first so later handlers see fresh liveness.
    const DISPATCH_ORDER: [&'static str; 12] = [
        topics::HEALTH_SUMMARY,
        topics::COORD_HEARTBEAT,
        topics::COORD_VOTE_REQUEST,
        topics::COORD_VOTE_DENY,
        topics::COORD_VOTE_GRANT,
        topics::COORD_PROPOSAL_REQUEST,
        topics::COORD_ACTION_APPROVED,
        topics::CONTROL_ACTION_COMMAND,
        topics::CONTROL_ACTION_COMPLETION,
        topics::MEMORY_REPLICATE,
        topics::MEMORY_QUERY,
        topics::MEMORY_QUERY_RESULT,
    ];

    fn dispatch_inbound(&mut self, now_ms: i64) -> Result<(), CoordError> {
        for topic in Self::DISPATCH_ORDER {
            for payload in self.bus.take_delivered(topic) {
                match CoordEnvelope::decode(topic, &payload) {
                    Ok(envelope) => self.dispatch_envelope(envelope, now_ms)?,
                    Err(err) => self.drop_invalid(topic, &err),
                }
            }
        }
        Ok(())
    }

    fn dispatch_envelope(
        &mut self,
        envelope: CoordEnvelope,
        now_ms: i64,
    ) -> Result<(), CoordError> {
        match envelope {
            CoordEnvelope::HealthSummary(summary) => {
                match self
                    .broadcaster
                    .handle_summary(&summary, &mut self.registry, now_ms)
                {
                    Ok(()) => {
                        self.reassigner
                            .observe(&summary.agent_id, summary.risk_score, now_ms);
                        if self.registry.alive_count(now_ms) > 1 {
                            self.peers_ever_seen = true;
                        }
                    }
                    Err(err) => self.drop_invalid("health summary", &err),
                }
            }
            CoordEnvelope::Heartbeat(heartbeat) => {
                self.registry.observe_heartbeat(&heartbeat.leader_id, now_ms);
                self.election.handle_heartbeat(&heartbeat, now_ms);
            }
            CoordEnvelope::VoteRequest(request) => {
                self.election
                    .handle_vote_request(&request, now_ms, &mut self.bus)?;
            }
            CoordEnvelope::Vote(vote) => match vote.ballot {
                Ballot::Election { .. } => {
                    let alive = self.registry.alive_count(now_ms);
                    self.election
                        .handle_vote(&vote, now_ms, alive, &mut self.bus)?;
                }
                Ballot::Proposal { .. } => self.consensus.handle_vote(&vote),
            },
            CoordEnvelope::Proposal(proposal) => {
                self.consensus
                    .handle_proposal_request(&proposal, now_ms, &mut self.bus)?;
            }
            CoordEnvelope::ActionApproved(approved) => {
                self.note_divergence(&approved, now_ms);
                self.consensus.handle_action_approved(&approved, now_ms);
            }
            CoordEnvelope::ActionCommand(command) => {
                self.handle_action_command(&command, now_ms)?;
            }
            CoordEnvelope::ActionCompletion(completion) => {
                self.propagator.handle_completion(&completion, now_ms);
            }
            CoordEnvelope::PatternReplica(replica) => {
                self.memory.handle_replica(&replica, now_ms);
            }
            CoordEnvelope::PatternQuery(query) => {
                self.memory.handle_query(&query, now_ms, &mut self.bus)?;
            }
            CoordEnvelope::PatternQueryResult(result) => {
                self.memory.handle_query_result(&result);
            }
        }
        Ok(())
    }

    fn drop_invalid(&mut self, what: &str, err: &CoordError) {
        self.counters.invalid_messages += 1;
        warn!(what, error = %err, "dropping malformed message");
    }

    fn broadcast_own_health(&mut self, now_ms: i64) -> Result<(), CoordError> {
        let summary = HealthSummary {
            agent_id: self.registry.self_id().to_string(),
            role: self.registry.own_role(),
            risk_score: self.own_risk,
            timestamp_ms: now_ms,
            subsystem_scores: Default::default(),
        };
        if self.broadcaster.tick(&summary, now_ms, &mut self.bus)? {
            self.registry.record_own_health(summary.clone());
            self.reassigner
                .observe(&summary.agent_id, summary.risk_score, now_ms);
        }
        Ok(())
    }

    /// Constellation-wide actions a peer approved while our own recent
    /// decision chose differently point at context divergence.
    fn note_divergence(&mut self, approved: &ActionApproved, now_ms: i64) {
        let horizon = self.config.global_context_ttl_ms * 10;
        if let Some(recent) = self.memory.recent_decisions().last() {
            if recent.scope != DecisionScope::Local
                && now_ms.saturating_sub(recent.decided_at_ms) <= horizon
                && recent.action_name != approved.action_name
            {
                self.counters.decision_divergence += 1;
                debug!(
                    ours = %recent.action_name,
                    approved = %approved.action_name,
                    "decision divergence observed"
                );
            }
        }
    }

    fn handle_action_command(
        &mut self,
        command: &ActionCommand,
        now_ms: i64,
    ) -> Result<(), CoordError> {
        // Everyone folds role changes into their constellation view, even
        // when they are not the reassigned agent.
        if command.action_name == ActionName::RoleReassign {
            if let Some((agent_id, to_role)) = parse_role_params(&command.params) {
                self.apply_role(&agent_id, to_role);
            } else {
                self.drop_invalid(
                    "role reassign command",
                    &CoordError::InvalidMessage {
                        reason: "missing agent_id/to_role params".to_string(),
                    },
                );
                return Ok(());
            }
        }

        let to_execute = match self.propagator.handle_command(command, now_ms) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(err) => {
                self.drop_invalid("action command", &err);
                return Ok(());
            }
        };

        // Role reassignment was already applied above; everything else goes
        // through the execution effector.
        let outcome = if to_execute.action_name == ActionName::RoleReassign {
            constellation_proto::ActionOutcome::Success
        } else {
            self.effector
                .apply(to_execute.action_name, &to_execute.params)
        };
        self.counters.commands_executed += 1;
        self.propagator.publish_completion(
            &to_execute.action_id,
            outcome,
            None,
            now_ms,
            &mut self.bus,
        )?;
        Ok(())
    }

    fn apply_role(&mut self, agent_id: &str, to_role: AgentRole) {
        self.counters.role_changes_applied += 1;
        if agent_id == self.registry.self_id() {
            info!(role = %to_role, "applying own role change");
            self.registry.set_own_role(to_role);
            self.election
                .set_eligibility(to_role != AgentRole::SafeMode);
        } else {
            self.registry.set_peer_role(agent_id, to_role);
        }
    }

    /// With every peer gone after having had company, fall to SAFE_MODE and
    /// stop proposing rather than acting as a one-node quorum.
    fn guard_solo_operation(&mut self, _now_ms: i64, alive: usize) {
        if alive > 1 {
            self.peers_ever_seen = true;
            return;
        }
        if self.peers_ever_seen && self.registry.own_role() != AgentRole::SafeMode {
            warn!("all peers lost; entering safe mode");
            self.counters.solo_safe_mode_entries += 1;
            self.registry.set_own_role(AgentRole::SafeMode);
            self.election.set_eligibility(false);
        }
    }

    fn leader_duties(&mut self, now_ms: i64) -> Result<(), CoordError> {
        if !self.election.is_leader_with_lease(now_ms) {
            // Leadership lapsed: queued role work is the next leader's call.
            if self.active_role_proposal.is_some() || !self.role_change_queue.is_empty() {
                self.active_role_proposal = None;
                self.role_change_queue.clear();
            }
            return Ok(());
        }

        if self.reassigner.due(now_ms) {
            let changes = self.reassigner.evaluate(
                now_ms,
                &self.registry,
                self.propagator.compliance_window(),
            );
            self.role_change_queue.extend(changes);
        }

        self.drive_role_proposals(now_ms)
    }

    /// Serializes queued role changes through consensus, one agent per
    /// proposal, propagating each approval to the affected agent.
    fn drive_role_proposals(&mut self, now_ms: i64) -> Result<(), CoordError> {
        if let Some((proposal_id, change)) = self.active_role_proposal.take() {
            match self
                .consensus
                .poll_proposal(&proposal_id, now_ms, &mut self.bus)?
            {
                None => {
                    self.active_role_proposal = Some((proposal_id, change));
                    return Ok(());
                }
                Some(false) => {
                    info!(agent_id = %change.agent_id, "role change denied by quorum");
                }
                Some(true) => {
                    if change.agent_id == self.registry.self_id() {
                        // The leader never hears its own broadcast; a change
                        // to itself is applied directly and peers pick the
                        // role up from the next health summary.
                        self.apply_role(&change.agent_id, change.to_role);
                    } else {
                        let params = role_params(&change);
                        let targets = [change.agent_id.clone()].into_iter().collect();
                        match self.propagator.propagate(
                            ActionName::RoleReassign,
                            params,
                            targets,
                            5_000,
                            &self.election,
                            now_ms,
                            &mut self.bus,
                        ) {
                            Ok(_) => {
                                // Keep the leader's own view in step with
                                // the command it just issued.
                                self.apply_role(&change.agent_id, change.to_role);
                            }
                            Err(err) => {
                                warn!(error = %err, "role change propagation failed");
                            }
                        }
                    }
                }
            }
        }

        if self.active_role_proposal.is_none() {
            if let Some(change) = self.role_change_queue.pop_front() {
                let alive = self.registry.alive_count(now_ms);
                match self.consensus.begin_proposal(
                    ActionName::RoleReassign,
                    role_params(&change),
                    None,
                    &self.election,
                    alive,
                    now_ms,
                    &mut self.bus,
                ) {
                    Ok(proposal_id) => {
                        self.active_role_proposal = Some((proposal_id, change));
                    }
                    Err(CoordError::ProposalInFlight { .. }) => {
                        // An orchestrator-driven reassignment holds the
                        // slot; retry next pump.
                        self.role_change_queue.push_front(change);
                    }
                    Err(err) => {
                        warn!(error = %err, "role change proposal failed");
                    }
                }
            }
        }
        Ok(())
    }
}

fn role_params(change: &RoleChange) -> serde_json::Value {
    serde_json::json!({
        "agent_id": change.agent_id,
        "from_role": change.from_role.as_str(),
        "to_role": change.to_role.as_str(),
        "reason": change.reason,
    })
}

fn parse_role_params(params: &serde_json::Value) -> Option<(String, AgentRole)> {
    let agent_id = params.get("agent_id")?.as_str()?.to_string();
    let to_role = AgentRole::from_str(params.get("to_role")?.as_str()?).ok()?;
    Some((agent_id, to_role))
}
