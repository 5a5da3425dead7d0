//! Quorum consensus over leader proposals.
//!
//! The elected leader broadcasts a proposal, every alive agent votes, and
//! the leader tallies grants against ceil(alive * quorum_fraction). When the
//! action's deadline elapses without a decision the leader falls back to its
//! own judgment and approves, tagging the approval for audit.

use std::collections::{BTreeMap, BTreeSet};

use constellation_net::MessageBus;
use constellation_proto::{
    derive_id, topics, ActionApproved, ActionName, Ballot, CoordError, Proposal, QosLevel, Vote,
};
use tracing::{debug, info, warn};

use crate::election::LeaderElection;
use crate::metrics::ConsensusMetrics;

/// Per-action quorum fraction and voting deadline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionPolicy {
    pub quorum_fraction: f64,
    pub timeout_ms: i64,
}

impl ActionPolicy {
    pub fn validate(&self) -> Result<(), CoordError> {
        if !(self.quorum_fraction > 0.0 && self.quorum_fraction <= 1.0) {
            return Err(CoordError::InvalidConfig {
                reason: format!("quorum_fraction out of (0,1]: {}", self.quorum_fraction),
            });
        }
        if self.timeout_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "action timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusConfig {
    pub agent_id: String,
    pub policies: BTreeMap<ActionName, ActionPolicy>,
    pub default_policy: ActionPolicy,
    /// Terminal proposals are kept this long to answer duplicate requests.
    pub retention_ms: i64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let policies: BTreeMap<ActionName, ActionPolicy> = [
            (
                ActionName::SafeMode,
                ActionPolicy {
                    quorum_fraction: 2.0 / 3.0,
                    timeout_ms: 3_000,
                },
            ),
            (
                ActionName::RoleReassign,
                ActionPolicy {
                    quorum_fraction: 2.0 / 3.0,
                    timeout_ms: 10_000,
                },
            ),
            (
                ActionName::AttitudeAdjust,
                ActionPolicy {
                    quorum_fraction: 0.5,
                    timeout_ms: 5_000,
                },
            ),
            (
                ActionName::LoadShed,
                ActionPolicy {
                    quorum_fraction: 2.0 / 3.0,
                    timeout_ms: 5_000,
                },
            ),
            (
                ActionName::ThermalManeuver,
                ActionPolicy {
                    quorum_fraction: 2.0 / 3.0,
                    timeout_ms: 5_000,
                },
            ),
        ]
        .into_iter()
        .collect();
        Self {
            agent_id: String::new(),
            policies,
            default_policy: ActionPolicy {
                quorum_fraction: 2.0 / 3.0,
                timeout_ms: 5_000,
            },
            retention_ms: 300_000,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "consensus agent_id cannot be empty".to_string(),
            });
        }
        for policy in self.policies.values() {
            policy.validate()?;
        }
        self.default_policy.validate()?;
        if self.retention_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "consensus retention_ms must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn policy_for(&self, action: ActionName) -> ActionPolicy {
        self.policies
            .get(&action)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        self != ProposalStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRecord {
    pub proposal: Proposal,
    pub status: ProposalStatus,
    pub grants: BTreeSet<String>,
    pub denies: BTreeSet<String>,
    /// Grants needed, counting the proposer's implicit self-grant.
    pub quorum: usize,
    /// Alive constellation size when the proposal opened.
    pub electorate: usize,
    pub decided_at_ms: Option<i64>,
    pub fallback: bool,
    /// True on the proposing leader; false on voter-side read-only copies.
    pub owned: bool,
}

impl ProposalRecord {
    /// Grant tally including the proposer's implicit grant.
    pub fn grant_tally(&self) -> usize {
        self.grants.len() + 1
    }
}

/// Hook for local vote constraints. Returning an error denies the proposal
/// with that reason.
pub type VotePolicy = Box<dyn Fn(&Proposal) -> Result<(), String> + Send>;

pub struct ConsensusEngine {
    config: ConsensusConfig,
    proposal_counter: u64,
    records: BTreeMap<String, ProposalRecord>,
    /// Our own vote per proposal id, replayed on duplicate requests.
    votes_cast: BTreeMap<String, Vote>,
    in_flight: BTreeSet<ActionName>,
    vote_policy: Option<VotePolicy>,
    metrics: ConsensusMetrics,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            proposal_counter: 0,
            records: BTreeMap::new(),
            votes_cast: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            vote_policy: None,
            metrics: ConsensusMetrics::default(),
        })
    }

    pub fn metrics(&self) -> ConsensusMetrics {
        self.metrics
    }

    pub fn set_vote_policy(&mut self, policy: VotePolicy) {
        self.vote_policy = Some(policy);
    }

    pub fn status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        self.records.get(proposal_id).map(|record| record.status)
    }

    pub fn record(&self, proposal_id: &str) -> Option<&ProposalRecord> {
        self.records.get(proposal_id)
    }

    /// Opens a proposal and broadcasts it. Leader-only; one proposal per
    /// action name may be in flight at a time (later callers queue).
    pub fn begin_proposal(
        &mut self,
        action: ActionName,
        params: serde_json::Value,
        timeout_override_ms: Option<i64>,
        election: &LeaderElection,
        alive_count: usize,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<String, CoordError> {
        if !election.is_leader_with_lease(now_ms) {
            return Err(CoordError::NotLeader {
                agent_id: self.config.agent_id.clone(),
            });
        }
        if self.in_flight.contains(&action) {
            return Err(CoordError::ProposalInFlight {
                action: action.to_string(),
            });
        }
        let policy = self.config.policy_for(action);
        let timeout_ms = timeout_override_ms.unwrap_or(policy.timeout_ms);
        if timeout_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "proposal timeout must be positive".to_string(),
            });
        }
        self.proposal_counter += 1;
        let proposal_id = derive_id("prop", &self.config.agent_id, self.proposal_counter, now_ms);
        let proposal = Proposal {
            proposal_id: proposal_id.clone(),
            action_name: action,
            params,
            proposer_id: self.config.agent_id.clone(),
            term: election.term(),
            deadline_ms: now_ms + timeout_ms,
        };
        let quorum = quorum_size(alive_count, policy.quorum_fraction);
        let payload = serde_json::to_vec(&proposal)?;
        bus.publish(
            topics::COORD_PROPOSAL_REQUEST,
            &payload,
            QosLevel::ExactlyOnce,
            now_ms,
        )?;
        self.records.insert(
            proposal_id.clone(),
            ProposalRecord {
                proposal,
                status: ProposalStatus::Pending,
                grants: BTreeSet::new(),
                denies: BTreeSet::new(),
                quorum,
                electorate: alive_count,
                decided_at_ms: None,
                fallback: false,
                owned: true,
            },
        );
        self.in_flight.insert(action);
        self.metrics.proposals_started += 1;
        info!(
            proposal_id = %proposal_id,
            action = %action,
            quorum,
            electorate = alive_count,
            self_grant = "implicit",
            "proposal opened"
        );
        Ok(proposal_id)
    }

    /// Checks an owned proposal for a decision. `Some(approved)` once
    /// terminal; `None` while votes are still outstanding.
    pub fn poll_proposal(
        &mut self,
        proposal_id: &str,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<Option<bool>, CoordError> {
        let record = match self.records.get_mut(proposal_id) {
            Some(record) => record,
            None => {
                return Err(CoordError::InvalidMessage {
                    reason: format!("unknown proposal: {proposal_id}"),
                })
            }
        };
        if !record.owned {
            return Err(CoordError::InvalidMessage {
                reason: format!("proposal {proposal_id} is not owned by this agent"),
            });
        }
        match record.status {
            ProposalStatus::Approved => return Ok(Some(true)),
            ProposalStatus::Denied | ProposalStatus::TimedOut => return Ok(Some(false)),
            ProposalStatus::Pending => {}
        }

        if record.grant_tally() >= record.quorum {
            record.status = ProposalStatus::Approved;
            record.decided_at_ms = Some(now_ms);
            let approved = ActionApproved {
                proposal_id: proposal_id.to_string(),
                action_name: record.proposal.action_name,
                params: record.proposal.params.clone(),
                approved_at_ms: now_ms,
                fallback: false,
            };
            let action = record.proposal.action_name;
            info!(
                proposal_id,
                action = %action,
                grants = record.grant_tally(),
                quorum = record.quorum,
                "proposal approved by quorum"
            );
            self.finish_owned(action, &approved, now_ms, bus)?;
            self.metrics.proposals_approved += 1;
            return Ok(Some(true));
        }

        // Denial: even if every remaining voter granted, quorum is out of
        // reach.
        let max_possible = record.electorate.saturating_sub(record.denies.len());
        if max_possible < record.quorum {
            record.status = ProposalStatus::Denied;
            record.decided_at_ms = Some(now_ms);
            let action = record.proposal.action_name;
            info!(
                proposal_id,
                action = %action,
                denies = record.denies.len(),
                "proposal denied"
            );
            self.in_flight.remove(&action);
            self.metrics.proposals_denied += 1;
            return Ok(Some(false));
        }

        if now_ms >= record.proposal.deadline_ms {
            // Quorum never materialized; the elected leader falls back to
            // its own judgment and approves.
            record.status = ProposalStatus::Approved;
            record.decided_at_ms = Some(now_ms);
            record.fallback = true;
            let approved = ActionApproved {
                proposal_id: proposal_id.to_string(),
                action_name: record.proposal.action_name,
                params: record.proposal.params.clone(),
                approved_at_ms: now_ms,
                fallback: true,
            };
            let action = record.proposal.action_name;
            warn!(
                proposal_id,
                action = %action,
                grants = record.grant_tally(),
                quorum = record.quorum,
                audit = "fallback",
                rationale = "elected-leader fallback",
                "quorum timeout; leader self-approval"
            );
            self.finish_owned(action, &approved, now_ms, bus)?;
            self.metrics.leader_fallbacks += 1;
            self.metrics.proposals_timed_out += 1;
            return Ok(Some(true));
        }
        Ok(None)
    }

    fn finish_owned(
        &mut self,
        action: ActionName,
        approved: &ActionApproved,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        self.in_flight.remove(&action);
        let payload = serde_json::to_vec(approved)?;
        if let Err(err) = bus.publish(
            topics::COORD_ACTION_APPROVED,
            &payload,
            QosLevel::ExactlyOnce,
            now_ms,
        ) {
            warn!(error = %err, "action approval broadcast failed");
        }
        Ok(())
    }

    /// Voter side: evaluate a proposal request and publish our vote. A
    /// duplicate request is answered with the previously cast vote.
    pub fn handle_proposal_request(
        &mut self,
        proposal: &Proposal,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        if proposal.proposer_id == self.config.agent_id {
            return Ok(());
        }
        if proposal.proposal_id.trim().is_empty() {
            return Err(CoordError::InvalidMessage {
                reason: "proposal missing proposal_id".to_string(),
            });
        }
        if let Some(prior) = self.votes_cast.get(&proposal.proposal_id) {
            self.metrics.duplicate_requests_answered += 1;
            let vote = prior.clone();
            return self.publish_vote(&vote, now_ms, bus);
        }

        let mut reason = None;
        if now_ms >= proposal.deadline_ms {
            reason = Some("proposal deadline already passed".to_string());
        } else if let Some(policy) = &self.vote_policy {
            if let Err(veto) = policy(proposal) {
                reason = Some(veto);
            }
        }
        let grant = reason.is_none();
        let vote = Vote {
            term: proposal.term,
            ballot: Ballot::Proposal {
                proposal_id: proposal.proposal_id.clone(),
            },
            voter_id: self.config.agent_id.clone(),
            grant,
            reason,
        };
        self.votes_cast
            .insert(proposal.proposal_id.clone(), vote.clone());
        self.records
            .entry(proposal.proposal_id.clone())
            .or_insert_with(|| ProposalRecord {
                proposal: proposal.clone(),
                status: ProposalStatus::Pending,
                grants: BTreeSet::new(),
                denies: BTreeSet::new(),
                quorum: 0,
                electorate: 0,
                decided_at_ms: None,
                fallback: false,
                owned: false,
            });
        debug!(
            proposal_id = %proposal.proposal_id,
            action = %proposal.action_name,
            grant,
            "voting on proposal"
        );
        self.publish_vote(&vote, now_ms, bus)
    }

    fn publish_vote(
        &mut self,
        vote: &Vote,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        let topic = if vote.grant {
            topics::COORD_VOTE_GRANT
        } else {
            topics::COORD_VOTE_DENY
        };
        let payload = serde_json::to_vec(vote)?;
        if let Err(err) = bus.publish(topic, &payload, QosLevel::ExactlyOnce, now_ms) {
            debug!(error = %err, "vote publish failed");
        }
        Ok(())
    }

    /// Leader side: fold one proposal vote into the tally. At most one vote
    /// per (proposal, voter) counts; extras are ignored.
    pub fn handle_vote(&mut self, vote: &Vote) {
        let proposal_id = match &vote.ballot {
            Ballot::Proposal { proposal_id } => proposal_id,
            Ballot::Election { .. } => return,
        };
        let record = match self.records.get_mut(proposal_id) {
            Some(record) => record,
            None => return,
        };
        if !record.owned || record.status.is_terminal() {
            return;
        }
        if vote.voter_id == self.config.agent_id {
            return;
        }
        if record.grants.contains(&vote.voter_id) || record.denies.contains(&vote.voter_id) {
            return;
        }
        if vote.grant {
            record.grants.insert(vote.voter_id.clone());
        } else {
            record.denies.insert(vote.voter_id.clone());
        }
    }

    /// Voter side: a broadcast approval settles our read-only copy.
    pub fn handle_action_approved(&mut self, approved: &ActionApproved, now_ms: i64) {
        if let Some(record) = self.records.get_mut(&approved.proposal_id) {
            if record.owned || record.status.is_terminal() {
                return;
            }
            record.status = ProposalStatus::Approved;
            record.fallback = approved.fallback;
            record.decided_at_ms = Some(now_ms);
        }
    }

    /// Expires voter-side pending copies and prunes old terminal records.
    pub fn sweep(&mut self, now_ms: i64) {
        for record in self.records.values_mut() {
            if !record.owned
                && record.status == ProposalStatus::Pending
                && now_ms >= record.proposal.deadline_ms
            {
                record.status = ProposalStatus::TimedOut;
                record.decided_at_ms = Some(now_ms);
            }
        }
        let retention = self.config.retention_ms;
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| {
                record.status.is_terminal()
                    && record
                        .decided_at_ms
                        .map(|at| now_ms.saturating_sub(at) >= retention)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for proposal_id in expired {
            self.records.remove(&proposal_id);
            self.votes_cast.remove(&proposal_id);
        }
    }
}

/// ceil(alive * fraction), at least 1.
pub(crate) fn quorum_size(alive_count: usize, fraction: f64) -> usize {
    let raw = (alive_count as f64 * fraction).ceil() as usize;
    raw.max(1)
}
