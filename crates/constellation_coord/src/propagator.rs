//! Leader-originated reliable action broadcast with deadline-bounded
//! compliance tracking.
//!
//! The leader fans an [`ActionCommand`] out to a target set, accumulates
//! completions until the deadline, then scores compliance as the fraction of
//! targets that reported success. Sub-threshold compliance is not an error;
//! it surfaces the non-compliant set to the role reassigner.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use constellation_net::MessageBus;
use constellation_proto::{
    derive_id, topics, ActionCommand, ActionCompletion, ActionName, ActionOutcome, CoordError,
    QosLevel,
};
use tracing::{debug, info, warn};

use crate::election::LeaderElection;
use crate::metrics::PropagatorMetrics;

#[derive(Debug, Clone, PartialEq)]
pub struct PropagatorConfig {
    pub agent_id: String,
    pub default_deadline_ms: i64,
    pub compliance_threshold: f64,
    /// Finalized actions are kept this long past their deadline to answer
    /// late queries and record late completions.
    pub retention_ms: i64,
    /// Window over which per-agent compliance is aggregated for the role
    /// reassigner.
    pub compliance_window_ms: i64,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            default_deadline_ms: 30_000,
            compliance_threshold: 0.90,
            retention_ms: 60_000,
            compliance_window_ms: 300_000,
        }
    }
}

impl PropagatorConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "propagator agent_id cannot be empty".to_string(),
            });
        }
        if self.default_deadline_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "propagator default_deadline_ms must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.compliance_threshold) {
            return Err(CoordError::InvalidConfig {
                reason: format!(
                    "compliance_threshold out of [0,1]: {}",
                    self.compliance_threshold
                ),
            });
        }
        if self.retention_ms <= 0 || self.compliance_window_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "propagator retention windows must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    TimedOut,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionState {
    pub command: ActionCommand,
    pub completed_by: BTreeSet<String>,
    pub failed_by: BTreeSet<String>,
    pub partial_by: BTreeSet<String>,
    pub created_at_ms: i64,
    pub status: ActionStatus,
    pub compliance: Option<f64>,
    /// Compliance required before the action counts as cleanly completed.
    /// Constellation-scoped actions raise this above the swarm default.
    pub compliance_bar: f64,
    pub escalated: bool,
    pub finalized_at_ms: Option<i64>,
}

impl ActionState {
    fn successful_targets(&self) -> BTreeSet<String> {
        self.completed_by
            .intersection(&self.command.target_agents)
            .cloned()
            .collect()
    }

    fn live_compliance(&self) -> f64 {
        let targets = self.command.target_agents.len();
        if targets == 0 {
            return 1.0;
        }
        self.successful_targets().len() as f64 / targets as f64
    }
}

/// Rolling per-agent compliance over recently finalized actions.
#[derive(Debug, Clone, Default)]
pub struct ComplianceWindow {
    entries: VecDeque<(i64, BTreeSet<String>, BTreeSet<String>)>,
}

impl ComplianceWindow {
    pub(crate) fn record(&mut self, finalized_at_ms: i64, targets: BTreeSet<String>, completed: BTreeSet<String>) {
        self.entries.push_back((finalized_at_ms, targets, completed));
    }

    fn prune(&mut self, now_ms: i64, window_ms: i64) {
        while let Some((at, _, _)) = self.entries.front() {
            if now_ms.saturating_sub(*at) >= window_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fraction of recent targeted actions the agent completed. `None` when
    /// the agent was never targeted in the window.
    pub fn agent_compliance(&self, agent_id: &str) -> Option<f64> {
        let mut targeted = 0usize;
        let mut completed = 0usize;
        for (_, targets, done) in &self.entries {
            if targets.contains(agent_id) {
                targeted += 1;
                if done.contains(agent_id) {
                    completed += 1;
                }
            }
        }
        if targeted == 0 {
            None
        } else {
            Some(completed as f64 / targeted as f64)
        }
    }

    pub fn tracked_agents(&self) -> BTreeSet<String> {
        let mut agents = BTreeSet::new();
        for (_, targets, _) in &self.entries {
            agents.extend(targets.iter().cloned());
        }
        agents
    }
}

pub struct ActionPropagator {
    config: PropagatorConfig,
    action_counter: u64,
    actions: BTreeMap<String, ActionState>,
    /// Commands this agent already executed, for replay dedup.
    executed: BTreeSet<String>,
    compliance: ComplianceWindow,
    metrics: PropagatorMetrics,
}

impl ActionPropagator {
    pub fn new(config: PropagatorConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            action_counter: 0,
            actions: BTreeMap::new(),
            executed: BTreeSet::new(),
            compliance: ComplianceWindow::default(),
            metrics: PropagatorMetrics::default(),
        })
    }

    pub fn metrics(&self) -> PropagatorMetrics {
        self.metrics
    }

    pub fn state(&self, action_id: &str) -> Option<&ActionState> {
        self.actions.get(action_id)
    }

    pub fn compliance_window(&self) -> &ComplianceWindow {
        &self.compliance
    }

    /// Leader-only reliable broadcast of an approved action, scored against
    /// the default compliance threshold.
    #[allow(clippy::too_many_arguments)]
    pub fn propagate(
        &mut self,
        action_name: ActionName,
        params: serde_json::Value,
        targets: BTreeSet<String>,
        deadline_ms: i64,
        election: &LeaderElection,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<String, CoordError> {
        let bar = self.config.compliance_threshold;
        self.propagate_with_bar(action_name, params, targets, deadline_ms, bar, election, now_ms, bus)
    }

    /// Same as [`ActionPropagator::propagate`] with an explicit compliance
    /// bar for the stricter constellation floor.
    #[allow(clippy::too_many_arguments)]
    pub fn propagate_with_bar(
        &mut self,
        action_name: ActionName,
        params: serde_json::Value,
        targets: BTreeSet<String>,
        deadline_ms: i64,
        compliance_bar: f64,
        election: &LeaderElection,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<String, CoordError> {
        if !election.is_leader_with_lease(now_ms) {
            return Err(CoordError::NotLeader {
                agent_id: self.config.agent_id.clone(),
            });
        }
        if targets.is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "action targets cannot be empty".to_string(),
            });
        }
        if deadline_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "action deadline must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&compliance_bar) {
            return Err(CoordError::InvalidConfig {
                reason: format!("compliance bar out of [0,1]: {compliance_bar}"),
            });
        }
        self.action_counter += 1;
        let action_id = derive_id("act", &self.config.agent_id, self.action_counter, now_ms);
        let command = ActionCommand {
            action_id: action_id.clone(),
            action_name,
            params,
            target_agents: targets,
            deadline_ms: now_ms + deadline_ms,
            originator_id: self.config.agent_id.clone(),
        };
        let mut state = ActionState {
            command: command.clone(),
            completed_by: BTreeSet::new(),
            failed_by: BTreeSet::new(),
            partial_by: BTreeSet::new(),
            created_at_ms: now_ms,
            status: ActionStatus::Pending,
            compliance: None,
            compliance_bar,
            escalated: false,
            finalized_at_ms: None,
        };
        let payload = serde_json::to_vec(&command)?;
        bus.publish(
            topics::CONTROL_ACTION_COMMAND,
            &payload,
            QosLevel::ExactlyOnce,
            now_ms,
        )?;
        state.status = ActionStatus::InProgress;
        self.actions.insert(action_id.clone(), state);
        self.metrics.actions_propagated += 1;
        info!(
            action_id = %action_id,
            action = %action_name,
            deadline_ms,
            "action propagated"
        );
        Ok(action_id)
    }

    /// Target side: returns the command for local execution if this agent is
    /// targeted and has not executed it before.
    pub fn handle_command(
        &mut self,
        command: &ActionCommand,
        now_ms: i64,
    ) -> Result<Option<ActionCommand>, CoordError> {
        if command.action_id.trim().is_empty() {
            return Err(CoordError::InvalidMessage {
                reason: "action command missing action_id".to_string(),
            });
        }
        if !command.target_agents.contains(&self.config.agent_id) {
            return Ok(None);
        }
        if self.executed.contains(&command.action_id) {
            return Ok(None);
        }
        if now_ms >= command.deadline_ms {
            debug!(
                action_id = %command.action_id,
                "command arrived past its deadline; executing anyway for record"
            );
        }
        self.executed.insert(command.action_id.clone());
        Ok(Some(command.clone()))
    }

    /// Publishes this agent's completion report for an executed command.
    pub fn publish_completion(
        &mut self,
        action_id: &str,
        outcome: ActionOutcome,
        error: Option<String>,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        let completion = ActionCompletion {
            action_id: action_id.to_string(),
            agent_id: self.config.agent_id.clone(),
            outcome,
            error,
            completed_at_ms: now_ms,
        };
        let payload = serde_json::to_vec(&completion)?;
        bus.publish(
            topics::CONTROL_ACTION_COMPLETION,
            &payload,
            QosLevel::ExactlyOnce,
            now_ms,
        )?;
        Ok(())
    }

    /// Leader side: folds a completion into the action's tally. Duplicates
    /// never double-count; completions after finalization are recorded but
    /// do not alter the compliance determination.
    pub fn handle_completion(&mut self, completion: &ActionCompletion, now_ms: i64) {
        let state = match self.actions.get_mut(&completion.action_id) {
            Some(state) => state,
            None => return,
        };
        let agent = completion.agent_id.clone();
        let already_counted = state.completed_by.contains(&agent)
            || state.failed_by.contains(&agent)
            || state.partial_by.contains(&agent);
        if already_counted {
            self.metrics.duplicate_completions_ignored += 1;
            return;
        }
        match completion.outcome {
            ActionOutcome::Success => state.completed_by.insert(agent),
            ActionOutcome::Partial => state.partial_by.insert(agent),
            ActionOutcome::Failed => state.failed_by.insert(agent),
        };
        if state.status.is_terminal() {
            self.metrics.late_completions_recorded += 1;
            return;
        }
        // Everyone reported success: no reason to wait out the deadline.
        if state.successful_targets().len() == state.command.target_agents.len() {
            self.finalize(&completion.action_id.clone(), now_ms);
        }
    }

    /// Deadline sweeper: finalizes overdue actions, prunes old state.
    /// Returns the ids finalized this pass.
    pub fn sweep(&mut self, now_ms: i64) -> Vec<String> {
        let due: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, state)| {
                !state.status.is_terminal() && now_ms >= state.command.deadline_ms
            })
            .map(|(id, _)| id.clone())
            .collect();
        for action_id in &due {
            self.finalize(action_id, now_ms);
        }

        let expired: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, state)| {
                state
                    .finalized_at_ms
                    .map(|at| now_ms.saturating_sub(at) >= self.config.retention_ms)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for action_id in expired {
            self.actions.remove(&action_id);
            self.executed.remove(&action_id);
        }
        self.compliance.prune(now_ms, self.config.compliance_window_ms);
        due
    }

    fn finalize(&mut self, action_id: &str, now_ms: i64) {
        let state = match self.actions.get_mut(action_id) {
            Some(state) => state,
            None => return,
        };
        if state.status.is_terminal() {
            return;
        }
        let threshold = state.compliance_bar;
        let compliance = state.live_compliance();
        state.compliance = Some(compliance);
        state.finalized_at_ms = Some(now_ms);
        if compliance >= threshold {
            state.status = ActionStatus::Completed;
        } else if compliance > 0.0 {
            state.status = ActionStatus::Completed;
            state.escalated = true;
        } else {
            state.status = ActionStatus::TimedOut;
            state.escalated = true;
        }
        let completed = state.successful_targets();
        let targets = state.command.target_agents.clone();
        let escalated = state.escalated;
        self.compliance.record(now_ms, targets, completed);
        if escalated {
            self.metrics.actions_escalated += 1;
            warn!(
                action_id,
                compliance,
                threshold,
                "action finalized below compliance threshold"
            );
        } else {
            self.metrics.actions_compliant += 1;
            info!(action_id, compliance, "action finalized");
        }
    }

    /// Targets that never reported success, once the action is finalized.
    pub fn get_non_compliant(&self, action_id: &str) -> Option<BTreeSet<String>> {
        let state = self.actions.get(action_id)?;
        state.finalized_at_ms?;
        Some(
            state
                .command
                .target_agents
                .difference(&state.completed_by)
                .cloned()
                .collect(),
        )
    }

    pub fn compliance(&self, action_id: &str) -> Option<f64> {
        self.actions.get(action_id).and_then(|state| state.compliance)
    }
}
