//! Multi-agent election behavior over the in-memory switchboard, driven on
//! a virtual clock.

use std::sync::Arc;

use constellation_net::{BusConfig, MessageBus, Switchboard};
use constellation_proto::{topics, Heartbeat, QosLevel, Vote, VoteRequest};

use crate::election::{ElectionConfig, ElectionState, LeaderElection};

struct FleetNode {
    election: LeaderElection,
    bus: MessageBus,
    crashed: bool,
}

struct ElectionFleet {
    switchboard: Switchboard,
    nodes: Vec<FleetNode>,
    alive: usize,
}

impl ElectionFleet {
    fn new(ids: &[&str]) -> Self {
        let switchboard = Switchboard::new();
        let mut nodes = Vec::new();
        for id in ids {
            let mut bus = MessageBus::new(
                Arc::new(switchboard.attach(id)),
                BusConfig::default(),
            )
            .expect("bus");
            for topic in [
                topics::COORD_HEARTBEAT,
                topics::COORD_VOTE_REQUEST,
                topics::COORD_VOTE_DENY,
                topics::COORD_VOTE_GRANT,
            ] {
                bus.subscribe(topic, QosLevel::AtLeastOnce).expect("subscribe");
            }
            let election = LeaderElection::new(
                ElectionConfig {
                    agent_id: id.to_string(),
                    ..ElectionConfig::default()
                },
                0,
            )
            .expect("election");
            nodes.push(FleetNode {
                election,
                bus,
                crashed: false,
            });
        }
        let alive = nodes.len();
        Self {
            switchboard,
            nodes,
            alive,
        }
    }

    fn crash(&mut self, id: &str) {
        self.switchboard.silence(id);
        for node in &mut self.nodes {
            if node.election.agent_id() == id {
                node.crashed = true;
            }
        }
        self.alive -= 1;
    }

    fn step(&mut self, now_ms: i64) {
        let alive = self.alive;
        // Phase 1: run the QoS machinery and collect deliveries, so every
        // node sees the same step's messages regardless of iteration order.
        let mut batches: Vec<Vec<(&'static str, Vec<Vec<u8>>)>> = Vec::new();
        for node in &mut self.nodes {
            if node.crashed {
                batches.push(Vec::new());
                continue;
            }
            node.bus.tick(now_ms).expect("bus tick");
            let mut batch = Vec::new();
            // Denies ahead of grants: a yield must land before tallying.
            for topic in [
                topics::COORD_HEARTBEAT,
                topics::COORD_VOTE_REQUEST,
                topics::COORD_VOTE_DENY,
                topics::COORD_VOTE_GRANT,
            ] {
                batch.push((topic, node.bus.take_delivered(topic)));
            }
            batches.push(batch);
        }
        // Phase 2: dispatch and advance the state machines.
        for (node, batch) in self.nodes.iter_mut().zip(batches) {
            if node.crashed {
                continue;
            }
            let FleetNode { election, bus, .. } = node;
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
                        _ => {
                            if let Ok(vote) = serde_json::from_slice::<Vote>(&payload) {
                                election
                                    .handle_vote(&vote, now_ms, alive, bus)
                                    .expect("vote tally");
                            }
                        }
                    }
                }
            }
            election.tick(now_ms, alive, bus).expect("election tick");
        }
    }

    fn run(&mut self, from_ms: i64, to_ms: i64, step_ms: i64) {
        let mut t = from_ms;
        while t <= to_ms {
            self.step(t);
            t += step_ms;
        }
    }

    fn leaders(&self) -> Vec<(String, u64)> {
        self.nodes
            .iter()
            .filter(|node| !node.crashed && node.election.state() == ElectionState::Leader)
            .map(|node| (node.election.agent_id().to_string(), node.election.term()))
            .collect()
    }

    fn node(&self, id: &str) -> &LeaderElection {
        &self
            .nodes
            .iter()
            .find(|node| node.election.agent_id() == id)
            .expect("node")
            .election
    }
}

#[test]
fn five_agent_boot_converges_on_lex_greatest() {
    let mut fleet = ElectionFleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 5_000, 50);

    let leaders = fleet.leaders();
    assert_eq!(leaders.len(), 1, "expected one leader, got {leaders:?}");
    assert_eq!(leaders[0].0, "E");
    for id in ["A", "B", "C", "D"] {
        assert_eq!(
            fleet.node(id).leader_id(5_000),
            Some("E".to_string()),
            "{id} should follow E"
        );
    }
}

#[test]
fn terms_never_decrease() {
    let mut fleet = ElectionFleet::new(&["A", "B", "C"]);
    let mut last_terms = vec![0u64; 3];
    let mut t = 0;
    while t <= 4_000 {
        fleet.step(t);
        for (i, node) in fleet.nodes.iter().enumerate() {
            let term = node.election.term();
            assert!(term >= last_terms[i], "term regressed on node {i}");
            last_terms[i] = term;
        }
        t += 50;
    }
}

#[test]
fn at_most_one_leader_per_term_throughout() {
    let mut fleet = ElectionFleet::new(&["A", "B", "C", "D", "E"]);
    let mut t = 0;
    while t <= 6_000 {
        fleet.step(t);
        let leaders = fleet.leaders();
        let mut terms: Vec<u64> = leaders.iter().map(|(_, term)| *term).collect();
        terms.sort_unstable();
        terms.dedup();
        assert_eq!(
            terms.len(),
            leaders.len(),
            "two leaders share a term: {leaders:?}"
        );
        t += 50;
    }
}

#[test]
fn leader_crash_fails_over_to_next_highest() {
    let mut fleet = ElectionFleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 4_000, 50);
    assert_eq!(fleet.leaders(), vec![("E".to_string(), fleet.node("E").term())]);
    let old_term = fleet.node("E").term();

    fleet.crash("E");
    // Leases run out 10 s after the last heartbeat, then a new election.
    fleet.run(4_050, 20_000, 50);

    let leaders = fleet.leaders();
    assert_eq!(leaders.len(), 1, "expected failover leader, got {leaders:?}");
    assert_eq!(leaders[0].0, "D");
    assert!(leaders[0].1 > old_term);
    let failover = fleet.node("D").metrics().last_failover_ms;
    assert!(failover.is_some(), "failover duration should be recorded");
}

#[test]
fn steady_leader_stays_stable_under_heartbeats() {
    let mut fleet = ElectionFleet::new(&["A", "B", "C"]);
    fleet.run(0, 3_000, 50);
    let before: Vec<(String, u64)> = fleet.leaders();
    assert_eq!(before.len(), 1);

    fleet.run(3_050, 30_000, 50);
    assert_eq!(fleet.leaders(), before, "leadership should not churn");
}

#[test]
fn single_agent_elects_itself() {
    let mut fleet = ElectionFleet::new(&["A"]);
    fleet.run(0, 2_000, 50);
    let leaders = fleet.leaders();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].0, "A");
}

#[test]
fn voter_applies_deterministic_preference() {
    let mut fleet = ElectionFleet::new(&["B"]);
    let FleetNode { election, bus, .. } = &mut fleet.nodes[0];

    // Greater id: granted.
    election
        .handle_vote_request(
            &VoteRequest {
                term: 1,
                candidate_id: "E".to_string(),
                uptime_seconds: 5,
            },
            1_000,
            bus,
        )
        .expect("request");
    assert_eq!(election.metrics().votes_granted, 1);

    // Same term, vote already cast: denied.
    election
        .handle_vote_request(
            &VoteRequest {
                term: 1,
                candidate_id: "D".to_string(),
                uptime_seconds: 5,
            },
            1_100,
            bus,
        )
        .expect("request");
    assert_eq!(election.metrics().votes_denied, 1);

    // Smaller id at a fresh term: denied on preference.
    election
        .handle_vote_request(
            &VoteRequest {
                term: 2,
                candidate_id: "A".to_string(),
                uptime_seconds: 50,
            },
            1_200,
            bus,
        )
        .expect("request");
    assert_eq!(election.metrics().votes_denied, 2);

    // Stale term: denied outright.
    election
        .handle_vote_request(
            &VoteRequest {
                term: 0,
                candidate_id: "Z".to_string(),
                uptime_seconds: 50,
            },
            1_300,
            bus,
        )
        .expect("request");
    assert_eq!(election.metrics().votes_denied, 3);
}

#[test]
fn safe_mode_agent_never_campaigns() {
    let mut fleet = ElectionFleet::new(&["A"]);
    fleet.nodes[0].election.set_eligibility(false);
    fleet.run(0, 3_000, 50);
    assert!(fleet.leaders().is_empty());
    assert_eq!(fleet.node("A").metrics().elections_started, 0);
}

#[test]
fn leader_yields_to_same_term_rival_with_greater_id() {
    let mut fleet = ElectionFleet::new(&["A"]);
    fleet.run(0, 2_000, 50);
    assert_eq!(fleet.leaders().len(), 1);
    let term = fleet.node("A").term();

    let election = &mut fleet.nodes[0].election;
    election.handle_heartbeat(
        &Heartbeat {
            leader_id: "B".to_string(),
            term,
            sent_at_ms: 2_050,
        },
        2_050,
    );
    assert_eq!(election.state(), ElectionState::Follower);
    assert_eq!(election.leader_id(2_100), Some("B".to_string()));
}

#[test]
fn follower_adopts_higher_term_from_heartbeat() {
    let mut fleet = ElectionFleet::new(&["A"]);
    let election = &mut fleet.nodes[0].election;
    election.handle_heartbeat(
        &Heartbeat {
            leader_id: "C".to_string(),
            term: 7,
            sent_at_ms: 100,
        },
        100,
    );
    assert_eq!(election.term(), 7);
    assert_eq!(election.state(), ElectionState::Follower);
    assert_eq!(election.leader_id(500), Some("C".to_string()));
    // Lease expires without renewal.
    assert_eq!(election.leader_id(100 + 10_001), None);
}
