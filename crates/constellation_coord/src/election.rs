//! Raft-inspired leader election with lease heartbeats.
//!
//! One state machine per agent: FOLLOWER listens for heartbeats and renews a
//! lease; on lease expiry it waits a per-(agent, term) jittered delay and
//! campaigns; CANDIDATE tallies grants until majority; LEADER broadcasts
//! heartbeats every interval and steps down on observing a higher term.
//!
//! All tie breaks are deterministic: voters prefer the lexicographically
//! greater candidate id, so simultaneous candidacies converge on one winner.

use std::collections::BTreeSet;

use constellation_net::MessageBus;
use constellation_proto::{
    blake3_hex, topics, Ballot, CoordError, Heartbeat, QosLevel, Uptime, Vote, VoteRequest,
};
use tracing::{debug, info, warn};

use crate::metrics::ElectionMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub agent_id: String,
    /// Jitter range applied to the FOLLOWER -> CANDIDATE transition.
    pub election_timeout_min_ms: i64,
    pub election_timeout_max_ms: i64,
    pub heartbeat_interval_ms: i64,
    pub lease_duration_ms: i64,
    /// How long a candidate waits for a decision before starting a new term.
    pub candidacy_timeout_ms: i64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 1_000,
            lease_duration_ms: 10_000,
            candidacy_timeout_ms: 1_000,
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "election agent_id cannot be empty".to_string(),
            });
        }
        if self.election_timeout_min_ms <= 0
            || self.election_timeout_max_ms < self.election_timeout_min_ms
        {
            return Err(CoordError::InvalidConfig {
                reason: "election timeout range must be positive and ordered".to_string(),
            });
        }
        if self.heartbeat_interval_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "heartbeat_interval_ms must be positive".to_string(),
            });
        }
        if self.lease_duration_ms <= self.heartbeat_interval_ms {
            return Err(CoordError::InvalidConfig {
                reason: "lease_duration_ms must exceed heartbeat_interval_ms".to_string(),
            });
        }
        if self.candidacy_timeout_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "candidacy_timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatLease {
    pub leader_id: String,
    pub term: u64,
    pub expires_at_ms: i64,
}

impl HeartbeatLease {
    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Point-in-time view for snapshots and the global context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionReport {
    pub agent_id: String,
    pub state: ElectionState,
    pub term: u64,
    pub leader_id: Option<String>,
    pub votes_granted: usize,
    pub lease_expires_at_ms: Option<i64>,
}

#[derive(Debug)]
pub struct LeaderElection {
    config: ElectionConfig,
    term: u64,
    state: ElectionState,
    voted_for: Option<String>,
    lease: Option<HeartbeatLease>,
    votes_granted: BTreeSet<String>,
    election_due_ms: Option<i64>,
    candidacy_deadline_ms: i64,
    last_heartbeat_sent_ms: i64,
    last_heartbeat_ok_ms: i64,
    lease_lost_at_ms: Option<i64>,
    uptime: Uptime,
    /// SAFE_MODE agents are not electable: they never campaign and defer
    /// to any valid candidate when voting.
    eligible: bool,
    metrics: ElectionMetrics,
}

impl LeaderElection {
    pub fn new(config: ElectionConfig, started_at_ms: i64) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self {
            config,
            term: 0,
            state: ElectionState::Follower,
            voted_for: None,
            lease: None,
            votes_granted: BTreeSet::new(),
            election_due_ms: None,
            candidacy_deadline_ms: 0,
            last_heartbeat_sent_ms: 0,
            last_heartbeat_ok_ms: started_at_ms,
            lease_lost_at_ms: None,
            uptime: Uptime::starting_at(started_at_ms),
            eligible: true,
            metrics: ElectionMetrics::default(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn metrics(&self) -> ElectionMetrics {
        self.metrics
    }

    pub fn uptime_seconds(&self, now_ms: i64) -> u64 {
        self.uptime.seconds(now_ms)
    }

    /// Called by the runtime when the local role crosses into or out of
    /// SAFE_MODE. An ineligible leader abdicates on its next tick.
    pub fn set_eligibility(&mut self, eligible: bool) {
        self.eligible = eligible;
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    /// Leader-only operations gate on this: an agent that lost its lease
    /// (or never held one) may not act as leader.
    pub fn is_leader_with_lease(&self, now_ms: i64) -> bool {
        self.state == ElectionState::Leader
            && now_ms.saturating_sub(self.last_heartbeat_ok_ms) <= self.config.lease_duration_ms
    }

    pub fn leader_id(&self, now_ms: i64) -> Option<String> {
        match self.state {
            ElectionState::Leader => Some(self.config.agent_id.clone()),
            _ => self
                .lease
                .as_ref()
                .filter(|lease| lease.is_valid(now_ms))
                .map(|lease| lease.leader_id.clone()),
        }
    }

    pub fn report(&self, now_ms: i64) -> ElectionReport {
        ElectionReport {
            agent_id: self.config.agent_id.clone(),
            state: self.state,
            term: self.term,
            leader_id: self.leader_id(now_ms),
            votes_granted: self.votes_granted.len(),
            lease_expires_at_ms: self.lease.as_ref().map(|lease| lease.expires_at_ms),
        }
    }

    /// One scheduling step of the state machine.
    pub fn tick(
        &mut self,
        now_ms: i64,
        alive_count: usize,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        match self.state {
            ElectionState::Follower => self.tick_follower(now_ms, bus)?,
            ElectionState::Candidate => self.tick_candidate(now_ms, alive_count, bus)?,
            ElectionState::Leader => self.tick_leader(now_ms, bus)?,
        }
        Ok(())
    }

    fn tick_follower(&mut self, now_ms: i64, bus: &mut MessageBus) -> Result<(), CoordError> {
        let lease_valid = self
            .lease
            .as_ref()
            .map(|lease| lease.is_valid(now_ms))
            .unwrap_or(false);
        if lease_valid {
            self.election_due_ms = None;
            return Ok(());
        }
        if !self.eligible {
            self.election_due_ms = None;
            return Ok(());
        }
        match self.election_due_ms {
            None => {
                if self.lease_lost_at_ms.is_none() {
                    self.lease_lost_at_ms = Some(now_ms);
                }
                let delay = self.jitter_ms(self.term.wrapping_add(1));
                self.election_due_ms = Some(now_ms + delay);
                debug!(
                    agent_id = %self.config.agent_id,
                    delay_ms = delay,
                    "lease expired; election scheduled"
                );
            }
            Some(due) if now_ms >= due => self.start_election(now_ms, bus)?,
            Some(_) => {}
        }
        Ok(())
    }

    fn tick_candidate(
        &mut self,
        now_ms: i64,
        alive_count: usize,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        if !self.eligible {
            self.step_down(now_ms);
            return Ok(());
        }
        if self.votes_granted.len() >= majority(alive_count) {
            self.become_leader(now_ms, bus)?;
            return Ok(());
        }
        if now_ms >= self.candidacy_deadline_ms {
            self.start_election(now_ms, bus)?;
        }
        Ok(())
    }

    fn tick_leader(&mut self, now_ms: i64, bus: &mut MessageBus) -> Result<(), CoordError> {
        if !self.eligible {
            info!(
                agent_id = %self.config.agent_id,
                term = self.term,
                "leader entered safe mode; abdicating"
            );
            self.step_down(now_ms);
            return Ok(());
        }
        if now_ms.saturating_sub(self.last_heartbeat_sent_ms) >= self.config.heartbeat_interval_ms
        {
            self.broadcast_heartbeat(now_ms, bus);
        }
        if now_ms.saturating_sub(self.last_heartbeat_ok_ms) > self.config.lease_duration_ms {
            warn!(
                agent_id = %self.config.agent_id,
                term = self.term,
                "heartbeat publishes failing; stepping down"
            );
            self.step_down(now_ms);
        }
        Ok(())
    }

    fn start_election(&mut self, now_ms: i64, bus: &mut MessageBus) -> Result<(), CoordError> {
        self.term += 1;
        self.state = ElectionState::Candidate;
        self.voted_for = Some(self.config.agent_id.clone());
        self.votes_granted = [self.config.agent_id.clone()].into_iter().collect();
        self.candidacy_deadline_ms =
            now_ms + self.config.candidacy_timeout_ms + self.jitter_ms(self.term);
        self.election_due_ms = None;
        self.metrics.elections_started += 1;
        info!(
            agent_id = %self.config.agent_id,
            term = self.term,
            "starting election"
        );
        let request = VoteRequest {
            term: self.term,
            candidate_id: self.config.agent_id.clone(),
            uptime_seconds: self.uptime.seconds(now_ms),
        };
        let payload = serde_json::to_vec(&request)?;
        if let Err(err) = bus.publish(
            topics::COORD_VOTE_REQUEST,
            &payload,
            QosLevel::AtLeastOnce,
            now_ms,
        ) {
            debug!(error = %err, "vote request publish failed; candidacy will time out");
        }
        Ok(())
    }

    fn become_leader(&mut self, now_ms: i64, bus: &mut MessageBus) -> Result<(), CoordError> {
        self.state = ElectionState::Leader;
        self.lease = None;
        self.election_due_ms = None;
        self.last_heartbeat_ok_ms = now_ms;
        self.metrics.elections_won += 1;
        if let Some(lost_at) = self.lease_lost_at_ms.take() {
            self.metrics.last_failover_ms = Some(now_ms.saturating_sub(lost_at));
        }
        info!(
            agent_id = %self.config.agent_id,
            term = self.term,
            votes = self.votes_granted.len(),
            "elected leader"
        );
        self.broadcast_heartbeat(now_ms, bus);
        Ok(())
    }

    fn step_down(&mut self, now_ms: i64) {
        if self.state == ElectionState::Leader {
            self.metrics.stepdowns += 1;
        }
        self.state = ElectionState::Follower;
        self.votes_granted.clear();
        self.election_due_ms = None;
        if self.lease.is_none() && self.lease_lost_at_ms.is_none() {
            self.lease_lost_at_ms = Some(now_ms);
        }
    }

    fn broadcast_heartbeat(&mut self, now_ms: i64, bus: &mut MessageBus) {
        let heartbeat = Heartbeat {
            leader_id: self.config.agent_id.clone(),
            term: self.term,
            sent_at_ms: now_ms,
        };
        self.last_heartbeat_sent_ms = now_ms;
        let payload = match serde_json::to_vec(&heartbeat) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match bus.publish(
            topics::COORD_HEARTBEAT,
            &payload,
            QosLevel::AtLeastOnce,
            now_ms,
        ) {
            Ok(_) => self.last_heartbeat_ok_ms = now_ms,
            Err(err) => debug!(error = %err, "heartbeat publish failed"),
        }
    }

    /// Heartbeat observation: adopt greater terms, renew the lease, step
    /// down from stale leadership.
    pub fn handle_heartbeat(&mut self, heartbeat: &Heartbeat, now_ms: i64) {
        if heartbeat.leader_id == self.config.agent_id {
            return;
        }
        if heartbeat.term < self.term {
            return;
        }
        if heartbeat.term > self.term {
            self.term = heartbeat.term;
            self.voted_for = None;
            self.step_down(now_ms);
        } else if self.state == ElectionState::Leader {
            // Two leaders in one term should be impossible; resolve to the
            // greater id so the fleet converges anyway.
            if heartbeat.leader_id.as_str() > self.config.agent_id.as_str() {
                warn!(
                    agent_id = %self.config.agent_id,
                    other = %heartbeat.leader_id,
                    term = self.term,
                    "observed rival leader in same term; yielding"
                );
                self.step_down(now_ms);
            } else {
                return;
            }
        } else if self.state == ElectionState::Candidate {
            self.step_down(now_ms);
        }
        self.lease = Some(HeartbeatLease {
            leader_id: heartbeat.leader_id.clone(),
            term: heartbeat.term,
            expires_at_ms: now_ms + self.config.lease_duration_ms,
        });
        self.election_due_ms = None;
        // A re-established lease ends the failover clock for followers.
        self.lease_lost_at_ms = None;
    }

    /// Applies the deterministic vote-granting rule and publishes the vote.
    pub fn handle_vote_request(
        &mut self,
        request: &VoteRequest,
        now_ms: i64,
        bus: &mut MessageBus,
    ) -> Result<(), CoordError> {
        if request.candidate_id == self.config.agent_id {
            return Ok(());
        }
        let mut grant;
        let mut reason = None;
        let mut preempt = false;
        if request.term < self.term {
            grant = false;
            reason = Some(format!("stale term {} < {}", request.term, self.term));
        } else {
            if request.term > self.term {
                self.term = request.term;
                self.voted_for = None;
                self.step_down(now_ms);
                grant = self.prefers(request, now_ms);
                preempt = !grant;
            } else {
                let preferred = self.prefers(request, now_ms);
                grant = self.state == ElectionState::Follower
                    && self.voted_for.is_none()
                    && preferred;
                preempt = self.state == ElectionState::Follower
                    && self.voted_for.is_none()
                    && !preferred;
            }
            if grant {
                self.voted_for = Some(request.candidate_id.clone());
            } else if reason.is_none() {
                reason = Some("candidate not preferred or vote already cast".to_string());
            }
        }
        // A follower holding a fresh lease already has a leader; its vote
        // would only help split the fleet.
        let leased = self
            .lease
            .as_ref()
            .map(|lease| lease.is_valid(now_ms) && lease.term >= request.term)
            .unwrap_or(false);
        if grant && leased {
            grant = false;
            self.voted_for = None;
            reason = Some("active leader lease".to_string());
        }
        // Denying on preference means this agent is the better candidate;
        // campaign on the next tick instead of waiting out a fresh jitter,
        // so the fleet converges on the greatest id in bounded rounds.
        if preempt && self.eligible && self.state == ElectionState::Follower && !leased {
            self.election_due_ms = Some(now_ms);
        }

        if grant {
            self.metrics.votes_granted += 1;
        } else {
            self.metrics.votes_denied += 1;
        }
        let vote = Vote {
            term: request.term,
            ballot: Ballot::Election {
                term: request.term,
                candidate_id: request.candidate_id.clone(),
            },
            voter_id: self.config.agent_id.clone(),
            grant,
            reason,
        };
        let topic = if grant {
            topics::COORD_VOTE_GRANT
        } else {
            topics::COORD_VOTE_DENY
        };
        let payload = serde_json::to_vec(&vote)?;
        if let Err(err) = bus.publish(topic, &payload, QosLevel::ExactlyOnce, now_ms) {
            debug!(error = %err, "vote publish failed");
        }
        Ok(())
    }

    fn prefers(&self, request: &VoteRequest, now_ms: i64) -> bool {
        if !self.eligible {
            // A safe-mode agent cannot lead, so it defers to any candidate.
            return true;
        }
        let own_id = self.config.agent_id.as_str();
        request.candidate_id.as_str() > own_id
            || (request.candidate_id.as_str() == own_id
                && request.uptime_seconds >= self.uptime.seconds(now_ms))
    }

    /// Tallies an election vote addressed to this candidate. Returns true
    /// if the tally reached majority and this agent became leader.
    pub fn handle_vote(
        &mut self,
        vote: &Vote,
        now_ms: i64,
        alive_count: usize,
        bus: &mut MessageBus,
    ) -> Result<bool, CoordError> {
        let (ballot_term, candidate_id) = match &vote.ballot {
            Ballot::Election { term, candidate_id } => (*term, candidate_id),
            Ballot::Proposal { .. } => return Ok(false),
        };
        if candidate_id != &self.config.agent_id
            || ballot_term != self.term
            || self.state != ElectionState::Candidate
        {
            return Ok(false);
        }
        if !vote.grant {
            // A deny from a higher id means a preferred candidate is alive;
            // yield so the fleet converges on it instead of racing terms.
            if vote.voter_id.as_str() > self.config.agent_id.as_str() {
                debug!(
                    agent_id = %self.config.agent_id,
                    voter = %vote.voter_id,
                    term = self.term,
                    "yielding candidacy to better-placed peer"
                );
                self.step_down(now_ms);
            }
            return Ok(false);
        }
        self.votes_granted.insert(vote.voter_id.clone());
        if self.votes_granted.len() >= majority(alive_count) {
            self.become_leader(now_ms, bus)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Deterministic per-(agent, term) delay in the configured jitter range.
    fn jitter_ms(&self, term: u64) -> i64 {
        let span =
            (self.config.election_timeout_max_ms - self.config.election_timeout_min_ms + 1) as u64;
        let digest = blake3_hex(format!("{}:{}", self.config.agent_id, term).as_bytes());
        let word = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
        self.config.election_timeout_min_ms + (word % span) as i64
    }
}

/// Votes needed to win: a strict majority of the alive constellation,
/// counting the candidate itself. One lone agent elects itself.
pub(crate) fn majority(alive_count: usize) -> usize {
    alive_count.max(1) / 2 + 1
}
