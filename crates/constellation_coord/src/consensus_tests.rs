//! Proposal voting over the in-memory switchboard: quorum approval, denial,
//! the leader's timeout fallback, and vote deduplication.

use std::sync::Arc;

use constellation_net::{BusConfig, MessageBus, Switchboard};
use constellation_proto::{
    topics, ActionApproved, ActionName, Ballot, CoordError, Heartbeat, Proposal, QosLevel, Vote,
    VoteRequest,
};

use crate::consensus::{ConsensusConfig, ConsensusEngine, ProposalStatus};
use crate::election::{ElectionConfig, ElectionState, LeaderElection};

struct CoordNode {
    election: LeaderElection,
    consensus: ConsensusEngine,
    bus: MessageBus,
}

struct CoordFleet {
    switchboard: Switchboard,
    nodes: Vec<CoordNode>,
    alive: usize,
}

const ALL_TOPICS: [&str; 6] = [
    topics::COORD_HEARTBEAT,
    topics::COORD_VOTE_REQUEST,
    topics::COORD_VOTE_DENY,
    topics::COORD_VOTE_GRANT,
    topics::COORD_PROPOSAL_REQUEST,
    topics::COORD_ACTION_APPROVED,
];

impl CoordFleet {
    fn new(ids: &[&str]) -> Self {
        let switchboard = Switchboard::new();
        let mut nodes = Vec::new();
        for id in ids {
            let mut bus = MessageBus::new(
                Arc::new(switchboard.attach(id)),
                BusConfig::default(),
            )
            .expect("bus");
            for topic in ALL_TOPICS {
                bus.subscribe(topic, QosLevel::ExactlyOnce).expect("subscribe");
            }
            nodes.push(CoordNode {
                election: LeaderElection::new(
                    ElectionConfig {
                        agent_id: id.to_string(),
                        ..ElectionConfig::default()
                    },
                    0,
                )
                .expect("election"),
                consensus: ConsensusEngine::new(ConsensusConfig {
                    agent_id: id.to_string(),
                    ..ConsensusConfig::default()
                })
                .expect("consensus"),
                bus,
            });
        }
        let alive = nodes.len();
        Self {
            switchboard,
            nodes,
            alive,
        }
    }

    fn step(&mut self, now_ms: i64) {
        let alive = self.alive;
        let mut batches: Vec<Vec<(&'static str, Vec<Vec<u8>>)>> = Vec::new();
        for node in &mut self.nodes {
            node.bus.tick(now_ms).expect("bus tick");
            let mut batch = Vec::new();
            for topic in ALL_TOPICS {
                batch.push((topic, node.bus.take_delivered(topic)));
            }
            batches.push(batch);
        }
        for (node, batch) in self.nodes.iter_mut().zip(batches) {
            let CoordNode {
                election,
                consensus,
                bus,
            } = node;
            for (topic, payloads) in batch {
                for payload in payloads {
                    match topic {
                        topics::COORD_HEARTBEAT => {
                            if let Ok(heartbeat) = serde_json::from_slice::<Heartbeat>(&payload) {
                                election.handle_heartbeat(&heartbeat, now_ms);
                            }
                        }
                        topics::COORD_VOTE_REQUEST => {
                            if let Ok(request) = serde_json::from_slice::<VoteRequest>(&payload) {
                                election
                                    .handle_vote_request(&request, now_ms, bus)
                                    .expect("vote request");
                            }
                        }
                        topics::COORD_PROPOSAL_REQUEST => {
                            if let Ok(proposal) = serde_json::from_slice::<Proposal>(&payload) {
                                consensus
                                    .handle_proposal_request(&proposal, now_ms, bus)
                                    .expect("proposal request");
                            }
                        }
                        topics::COORD_ACTION_APPROVED => {
                            if let Ok(approved) =
                                serde_json::from_slice::<ActionApproved>(&payload)
                            {
                                consensus.handle_action_approved(&approved, now_ms);
                            }
                        }
                        _ => {
                            if let Ok(vote) = serde_json::from_slice::<Vote>(&payload) {
                                match vote.ballot {
                                    Ballot::Election { .. } => {
                                        election
                                            .handle_vote(&vote, now_ms, alive, bus)
                                            .expect("election vote");
                                    }
                                    Ballot::Proposal { .. } => consensus.handle_vote(&vote),
                                }
                            }
                        }
                    }
                }
            }
            election.tick(now_ms, alive, bus).expect("election tick");
            consensus.sweep(now_ms);
        }
    }

    fn run(&mut self, from_ms: i64, to_ms: i64, step_ms: i64) {
        let mut t = from_ms;
        while t <= to_ms {
            self.step(t);
            t += step_ms;
        }
    }

    fn leader_index(&self) -> usize {
        self.nodes
            .iter()
            .position(|node| node.election.state() == ElectionState::Leader)
            .expect("a leader")
    }

    fn node_mut(&mut self, id: &str) -> &mut CoordNode {
        self.nodes
            .iter_mut()
            .find(|node| node.election.agent_id() == id)
            .expect("node")
    }
}

#[test]
fn quorum_approves_proposal() {
    let mut fleet = CoordFleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 4_000, 50);
    let leader = fleet.leader_index();

    let proposal_id = {
        let node = &mut fleet.nodes[leader];
        node.consensus
            .begin_proposal(
                ActionName::SafeMode,
                serde_json::json!({}),
                None,
                &node.election,
                5,
                4_050,
                &mut node.bus,
            )
            .expect("proposal")
    };

    let mut approved = None;
    let mut t = 4_100;
    while t <= 6_000 && approved.is_none() {
        fleet.step(t);
        let node = &mut fleet.nodes[leader];
        approved = node
            .consensus
            .poll_proposal(&proposal_id, t, &mut node.bus)
            .expect("poll");
        t += 50;
    }
    assert_eq!(approved, Some(true));
    let record = fleet.nodes[leader]
        .consensus
        .record(&proposal_id)
        .expect("record");
    assert!(!record.fallback, "quorum approval should not be a fallback");
    assert!(record.grant_tally() >= record.quorum);

    // Followers converge on the approval broadcast.
    fleet.run(t, t + 500, 50);
    for node in &fleet.nodes {
        if node.election.state() == ElectionState::Leader {
            continue;
        }
        assert_eq!(
            node.consensus.status(&proposal_id),
            Some(ProposalStatus::Approved)
        );
    }
}

#[test]
fn quorum_timeout_falls_back_to_leader_judgment() {
    let mut fleet = CoordFleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 4_000, 50);
    let leader = fleet.leader_index();
    let leader_id = fleet.nodes[leader].election.agent_id().to_string();

    // Cut the leader off from two voters; 2 grants + self < quorum of 4.
    for cut in ["A", "B"] {
        if cut != leader_id {
            fleet.switchboard.block_link(&leader_id, cut);
        }
    }

    let proposal_id = {
        let node = &mut fleet.nodes[leader];
        node.consensus
            .begin_proposal(
                ActionName::SafeMode,
                serde_json::json!({}),
                None,
                &node.election,
                5,
                4_050,
                &mut node.bus,
            )
            .expect("proposal")
    };

    let mut outcome = None;
    let mut t = 4_100;
    while t <= 9_000 && outcome.is_none() {
        fleet.step(t);
        let node = &mut fleet.nodes[leader];
        outcome = node
            .consensus
            .poll_proposal(&proposal_id, t, &mut node.bus)
            .expect("poll");
        t += 50;
    }
    assert_eq!(outcome, Some(true), "fallback still approves");
    let node = &fleet.nodes[leader];
    let record = node.consensus.record(&proposal_id).expect("record");
    assert!(record.fallback, "approval should be tagged as fallback");
    assert_eq!(node.consensus.metrics().leader_fallbacks, 1);
    assert_eq!(node.consensus.metrics().proposals_timed_out, 1);
}

#[test]
fn unanimous_denial_resolves_before_deadline() {
    let mut fleet = CoordFleet::new(&["A", "B", "C"]);
    for node in &mut fleet.nodes {
        node.consensus.set_vote_policy(Box::new(|proposal| {
            if proposal.action_name == ActionName::LoadShed {
                Err("load shedding disabled on this orbit".to_string())
            } else {
                Ok(())
            }
        }));
    }
    fleet.run(0, 4_000, 50);
    let leader = fleet.leader_index();

    let proposal_id = {
        let node = &mut fleet.nodes[leader];
        node.consensus
            .begin_proposal(
                ActionName::LoadShed,
                serde_json::json!({ "shed_percent": 30 }),
                None,
                &node.election,
                3,
                4_050,
                &mut node.bus,
            )
            .expect("proposal")
    };

    let mut outcome = None;
    let mut t = 4_100;
    while t <= 6_000 && outcome.is_none() {
        fleet.step(t);
        let node = &mut fleet.nodes[leader];
        outcome = node
            .consensus
            .poll_proposal(&proposal_id, t, &mut node.bus)
            .expect("poll");
        t += 50;
    }
    assert_eq!(outcome, Some(false));
    assert_eq!(
        fleet.nodes[leader].consensus.status(&proposal_id),
        Some(ProposalStatus::Denied)
    );
}

#[test]
fn non_leader_cannot_propose() {
    let mut fleet = CoordFleet::new(&["A", "B", "C"]);
    fleet.run(0, 4_000, 50);
    let follower = fleet
        .nodes
        .iter()
        .position(|node| node.election.state() != ElectionState::Leader)
        .expect("follower");
    let node = &mut fleet.nodes[follower];
    let result = node.consensus.begin_proposal(
        ActionName::SafeMode,
        serde_json::json!({}),
        None,
        &node.election,
        3,
        4_050,
        &mut node.bus,
    );
    assert!(matches!(result, Err(CoordError::NotLeader { .. })));
}

#[test]
fn one_proposal_per_action_in_flight() {
    let mut fleet = CoordFleet::new(&["A", "B", "C"]);
    fleet.run(0, 4_000, 50);
    let leader = fleet.leader_index();
    let node = &mut fleet.nodes[leader];

    node.consensus
        .begin_proposal(
            ActionName::SafeMode,
            serde_json::json!({}),
            None,
            &node.election,
            3,
            4_050,
            &mut node.bus,
        )
        .expect("first proposal");
    let second = node.consensus.begin_proposal(
        ActionName::SafeMode,
        serde_json::json!({}),
        None,
        &node.election,
        3,
        4_060,
        &mut node.bus,
    );
    assert!(matches!(second, Err(CoordError::ProposalInFlight { .. })));

    // A different action is free to proceed concurrently.
    node.consensus
        .begin_proposal(
            ActionName::ThermalManeuver,
            serde_json::json!({ "delta_c": 2 }),
            None,
            &node.election,
            3,
            4_070,
            &mut node.bus,
        )
        .expect("different action");
}

#[test]
fn duplicate_request_replays_prior_vote() {
    let mut fleet = CoordFleet::new(&["A", "B"]);
    let node = fleet.node_mut("A");
    let proposal = Proposal {
        proposal_id: "prop-x".to_string(),
        action_name: ActionName::SafeMode,
        params: serde_json::json!({}),
        proposer_id: "B".to_string(),
        term: 1,
        deadline_ms: 10_000,
    };
    node.consensus
        .handle_proposal_request(&proposal, 1_000, &mut node.bus)
        .expect("first");
    node.consensus
        .handle_proposal_request(&proposal, 1_100, &mut node.bus)
        .expect("duplicate");
    assert_eq!(node.consensus.metrics().duplicate_requests_answered, 1);
}

#[test]
fn vote_dedup_is_per_voter() {
    let mut fleet = CoordFleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 4_000, 50);
    let leader = fleet.leader_index();
    let node = &mut fleet.nodes[leader];
    let proposal_id = node
        .consensus
        .begin_proposal(
            ActionName::SafeMode,
            serde_json::json!({}),
            None,
            &node.election,
            5,
            4_050,
            &mut node.bus,
        )
        .expect("proposal");

    let vote = Vote {
        term: node.election.term(),
        ballot: Ballot::Proposal {
            proposal_id: proposal_id.clone(),
        },
        voter_id: "B".to_string(),
        grant: true,
        reason: None,
    };
    node.consensus.handle_vote(&vote);
    node.consensus.handle_vote(&vote);
    let record = node.consensus.record(&proposal_id).expect("record");
    assert_eq!(record.grants.len(), 1, "duplicate votes count once");
}

#[test]
fn expired_request_is_denied() {
    let mut fleet = CoordFleet::new(&["A", "B"]);
    let node = fleet.node_mut("A");
    let proposal = Proposal {
        proposal_id: "prop-late".to_string(),
        action_name: ActionName::SafeMode,
        params: serde_json::json!({}),
        proposer_id: "B".to_string(),
        term: 1,
        deadline_ms: 500,
    };
    node.consensus
        .handle_proposal_request(&proposal, 1_000, &mut node.bus)
        .expect("request");
    // Our own copy of the expired proposal times out on sweep.
    node.consensus.sweep(1_100);
    assert_eq!(
        node.consensus.status("prop-late"),
        Some(ProposalStatus::TimedOut)
    );
}

#[test]
fn lone_agent_auto_approves() {
    let mut fleet = CoordFleet::new(&["A"]);
    fleet.run(0, 2_000, 50);
    let node = &mut fleet.nodes[0];
    assert!(node.election.is_leader());
    let proposal_id = node
        .consensus
        .begin_proposal(
            ActionName::SafeMode,
            serde_json::json!({}),
            None,
            &node.election,
            1,
            2_050,
            &mut node.bus,
        )
        .expect("proposal");
    // Quorum of 1 is met by the implicit self-grant.
    let outcome = node
        .consensus
        .poll_proposal(&proposal_id, 2_060, &mut node.bus)
        .expect("poll");
    assert_eq!(outcome, Some(true));
    let record = node.consensus.record(&proposal_id).expect("record");
    assert!(!record.fallback);
}

#[test]
fn terminal_records_are_pruned_after_retention() {
    let mut fleet = CoordFleet::new(&["A"]);
    fleet.run(0, 2_000, 50);
    let node = &mut fleet.nodes[0];
    let proposal_id = node
        .consensus
        .begin_proposal(
            ActionName::SafeMode,
            serde_json::json!({}),
            None,
            &node.election,
            1,
            2_050,
            &mut node.bus,
        )
        .expect("proposal");
    node.consensus
        .poll_proposal(&proposal_id, 2_060, &mut node.bus)
        .expect("poll");
    assert!(node.consensus.status(&proposal_id).is_some());
    node.consensus.sweep(2_060 + 300_000);
    assert!(node.consensus.status(&proposal_id).is_none());
}
