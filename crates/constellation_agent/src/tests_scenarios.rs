//! End-to-end scenarios: whole fleets of coordination cores wired through
//! the in-memory switchboard and driven on a virtual clock.

use std::sync::Arc;

use constellation_net::Switchboard;
use constellation_proto::{ActionName, AgentRole};

use crate::core::CoordinationCore;
use crate::types::{AcknowledgingEffector, AgentConfig};

struct Fleet {
    switchboard: Switchboard,
    ids: Vec<String>,
    cores: Vec<CoordinationCore>,
    crashed: Vec<bool>,
}

impl Fleet {
    fn new(ids: &[&str]) -> Self {
        let specs: Vec<(&str, AgentRole)> =
            ids.iter().map(|id| (*id, AgentRole::Backup)).collect();
        Self::with_roles(&specs)
    }

    fn with_roles(specs: &[(&str, AgentRole)]) -> Self {
        let switchboard = Switchboard::new();
        let mut cores = Vec::new();
        let mut ids = Vec::new();
        for (id, role) in specs {
            let config = AgentConfig {
                initial_role: *role,
                ..AgentConfig::named(*id)
            };
            let core = CoordinationCore::new(
                config,
                Arc::new(switchboard.attach(id)),
                Arc::new(AcknowledgingEffector),
                0,
            )
            .expect("core");
            cores.push(core);
            ids.push(id.to_string());
        }
        let crashed = vec![false; cores.len()];
        Self {
            switchboard,
            ids,
            cores,
            crashed,
        }
    }

    fn step(&mut self, now_ms: i64) {
        for (core, crashed) in self.cores.iter_mut().zip(&self.crashed) {
            if *crashed {
                continue;
            }
            core.pump(now_ms).expect("pump");
        }
    }

    fn run(&mut self, from_ms: i64, to_ms: i64, step_ms: i64) {
        let mut t = from_ms;
        while t <= to_ms {
            self.step(t);
            t += step_ms;
        }
    }

    fn crash(&mut self, id: &str) {
        self.switchboard.silence(id);
        let index = self.index(id);
        self.crashed[index] = true;
    }

    fn index(&self, id: &str) -> usize {
        self.ids.iter().position(|held| held == id).expect("id")
    }

    fn core(&self, id: &str) -> &CoordinationCore {
        &self.cores[self.index(id)]
    }

    fn core_mut(&mut self, id: &str) -> &mut CoordinationCore {
        let index = self.index(id);
        &mut self.cores[index]
    }

    fn leaders(&self) -> Vec<String> {
        self.cores
            .iter()
            .zip(&self.crashed)
            .filter(|(core, crashed)| !**crashed && core.election.is_leader())
            .map(|(core, _)| core.agent_id().to_string())
            .collect()
    }

    /// Opens a proposal on the leader and pumps the fleet until the
    /// protocol resolves it (quorum, denial or deadline fallback).
    fn propose_until_resolved(
        &mut self,
        leader: &str,
        action: ActionName,
        params: serde_json::Value,
        from_ms: i64,
    ) -> (bool, String, i64) {
        let proposal_id = self
            .core_mut(leader)
            .begin_decision_proposal(action, params, from_ms)
            .expect("proposal");
        let mut t = from_ms + 50;
        loop {
            assert!(
                t < from_ms + 60_000,
                "proposal {proposal_id} never resolved"
            );
            self.step(t);
            if let Some(approved) = self
                .core_mut(leader)
                .poll_decision_proposal(&proposal_id, t)
                .expect("poll")
            {
                return (approved, proposal_id, t);
            }
            t += 50;
        }
    }
}

// S1: five agents boot, one leader emerges deterministically, and every
// registry converges on the full roster.
#[test]
fn healthy_boot_converges_on_one_leader() {
    let mut fleet = Fleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 3_000, 50);

    assert_eq!(fleet.leaders(), vec!["E".to_string()]);
    for id in ["A", "B", "C", "D", "E"] {
        let core = fleet.core(id);
        assert_eq!(core.registry.alive_count(3_000), 5, "{id} sees the fleet");
        assert!(core.registry.constellation_health(3_000) > 0.99);
        if id != "E" {
            assert_eq!(core.election.leader_id(3_000), Some("E".to_string()));
        }
    }
}

// S2: the leader dies; a new election converges on the next-highest agent
// and the new leader's proposals succeed.
#[test]
fn leader_crash_fails_over_and_new_leader_proposes() {
    let mut fleet = Fleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 3_000, 50);
    assert_eq!(fleet.leaders(), vec!["E".to_string()]);
    let old_term = fleet.core("E").election.term();

    fleet.crash("E");
    // Leases expire 10 s after the last heartbeat; allow an election after.
    fleet.run(3_050, 16_000, 50);
    assert_eq!(fleet.leaders(), vec!["D".to_string()]);
    assert!(fleet.core("D").election.term() > old_term);

    let (approved, proposal_id, _) = fleet.propose_until_resolved(
        "D",
        ActionName::SafeMode,
        serde_json::json!({}),
        16_050,
    );
    assert!(approved);
    let record = fleet
        .core("D")
        .consensus
        .record(&proposal_id)
        .expect("record");
    assert!(!record.fallback, "healthy quorum, no fallback needed");
}

// S3: the leader is partitioned from enough voters that quorum is
// unreachable; the proposal resolves by leader fallback and the follow-up
// action shows degraded compliance.
#[test]
fn quorum_timeout_falls_back_and_compliance_degrades() {
    let mut fleet = Fleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 3_000, 50);
    assert_eq!(fleet.leaders(), vec!["E".to_string()]);

    fleet.switchboard.block_link("E", "A");
    fleet.switchboard.block_link("E", "B");

    let (approved, proposal_id, resolved_at) = fleet.propose_until_resolved(
        "E",
        ActionName::SafeMode,
        serde_json::json!({}),
        3_050,
    );
    assert!(approved, "fallback approves");
    {
        let leader = fleet.core("E");
        let record = leader.consensus.record(&proposal_id).expect("record");
        assert!(record.fallback);
        assert_eq!(leader.consensus.metrics().leader_fallbacks, 1);
        // The safe_mode ballot box closes after its 3 s timeout.
        assert!(resolved_at - 3_050 >= 3_000);
    }

    // Fan the approved action out; only the reachable half completes.
    let action_id = fleet
        .core_mut("E")
        .propagate_approved(
            ActionName::SafeMode,
            serde_json::json!({}),
            5_000,
            0.90,
            resolved_at,
        )
        .expect("propagate")
        .expect("targets");
    fleet.run(resolved_at + 50, resolved_at + 6_000, 50);

    let leader = fleet.core("E");
    let compliance = leader.propagator.compliance(&action_id).expect("compliance");
    assert!(compliance <= 0.6, "got {compliance}");
    let non_compliant = leader
        .propagator
        .get_non_compliant(&action_id)
        .expect("set");
    assert!(non_compliant.contains("A") && non_compliant.contains("B"));
}

// S5: a peer with alternating health is classified INTERMITTENT; hysteresis
// blocks every role change.
#[test]
fn intermittent_health_never_flaps_roles() {
    let mut fleet = Fleet::new(&["A", "B", "C", "D", "E"]);
    let mut t = 0;
    while t <= 160_000 {
        // 0.4 and 0.1 alternating per 30 s broadcast window.
        let risk = if (t / 30_000) % 2 == 0 { 0.4 } else { 0.1 };
        fleet.core_mut("B").set_own_risk(risk);
        fleet.step(t);
        t += 100;
    }

    let leader = fleet.core("E");
    assert_eq!(fleet.leaders(), vec!["E".to_string()]);
    let history = leader.reassigner.history("B").expect("history");
    assert_eq!(
        history.classify(0.3),
        constellation_coord::FailureMode::Intermittent
    );
    assert_eq!(leader.reassigner.metrics().role_changes_total, 0);
    assert!(leader.reassigner.metrics().flapping_events_blocked >= 1);
    assert_eq!(leader.consensus.metrics().proposals_started, 0);
}

// S6: a degraded PRIMARY is demoted after three sustained samples; the
// healthiest backup is promoted, and leadership lands on the healthy peer.
#[test]
fn sustained_primary_degradation_promotes_backup() {
    let mut fleet = Fleet::with_roles(&[
        ("A", AgentRole::Backup),
        ("B", AgentRole::Backup),
        ("C", AgentRole::Backup),
        ("D", AgentRole::Backup),
        ("E", AgentRole::Primary),
    ]);
    fleet.core_mut("E").set_own_risk(0.5);

    let mut t = 0;
    while t <= 150_000 {
        fleet.step(t);
        t += 100;
    }

    // E is too degraded to lead, so the election settles on D, which then
    // runs the reassigner against E's sustained degradation.
    assert_eq!(fleet.leaders(), vec!["D".to_string()]);
    assert_eq!(fleet.core("D").own_role(), AgentRole::Primary);
    assert_eq!(fleet.core("E").own_role(), AgentRole::Backup);

    let leader = fleet.core("D");
    assert!(leader.reassigner.metrics().promotions_proposed >= 1);
    assert!(leader.reassigner.metrics().demotions_proposed >= 1);
    assert!(leader.consensus.metrics().proposals_approved >= 2);
    // The demotion command fanned out to E and completed cleanly.
    assert!(leader.propagator.metrics().actions_compliant >= 1);

    // Peers converge on the new role assignments.
    for id in ["A", "B", "C"] {
        let registry = &fleet.core(id).registry;
        assert_eq!(
            registry.get_peer("D").map(|peer| peer.role),
            Some(AgentRole::Primary),
            "{id} should see D as primary"
        );
    }
}

// Boundary: a two-agent fleet loses a peer; quorum is unreachable and the
// protocol honors its fallback.
#[test]
fn two_agent_fleet_cannot_reach_quorum_after_loss() {
    let mut fleet = Fleet::new(&["A", "B"]);
    fleet.run(0, 3_000, 50);
    assert_eq!(fleet.leaders(), vec!["B".to_string()]);

    fleet.crash("A");
    // A is silent but still within the liveness window: electorate of 2,
    // quorum of 2, one grant possible.
    let (approved, proposal_id, _) = fleet.propose_until_resolved(
        "B",
        ActionName::SafeMode,
        serde_json::json!({}),
        3_050,
    );
    assert!(approved, "resolves via fallback");
    let record = fleet
        .core("B")
        .consensus
        .record(&proposal_id)
        .expect("record");
    assert!(record.fallback);
}

// Boundary: three agents with one dead still reach quorum 2-of-2 once the
// dead peer ages out of the liveness window.
#[test]
fn three_agent_fleet_operates_with_one_dead_peer() {
    let mut fleet = Fleet::new(&["A", "B", "C"]);
    fleet.run(0, 3_000, 50);
    assert_eq!(fleet.leaders(), vec!["C".to_string()]);

    fleet.crash("A");
    // Ride past the liveness window so A leaves the electorate.
    fleet.run(3_050, 100_000, 500);
    assert_eq!(fleet.core("C").registry.alive_count(100_000), 2);

    let (approved, proposal_id, _) = fleet.propose_until_resolved(
        "C",
        ActionName::SafeMode,
        serde_json::json!({}),
        100_050,
    );
    assert!(approved);
    let record = fleet
        .core("C")
        .consensus
        .record(&proposal_id)
        .expect("record");
    assert!(!record.fallback, "2-of-2 quorum is reachable");
}

// Boundary: five agents with two freshly silent peers cannot assemble the
// 2/3 quorum of the still-counted electorate; the leader falls back.
#[test]
fn five_agent_fleet_with_two_silent_peers_falls_back() {
    let mut fleet = Fleet::new(&["A", "B", "C", "D", "E"]);
    fleet.run(0, 3_000, 50);
    assert_eq!(fleet.leaders(), vec!["E".to_string()]);

    fleet.crash("A");
    fleet.crash("B");
    let (approved, proposal_id, _) = fleet.propose_until_resolved(
        "E",
        ActionName::SafeMode,
        serde_json::json!({}),
        3_050,
    );
    assert!(approved);
    let record = fleet
        .core("E")
        .consensus
        .record(&proposal_id)
        .expect("record");
    assert!(record.fallback, "4 of 5 quorum unreachable with 2 silent");
}

// Property 8, scope discipline: a fleet that only ever makes LOCAL
// decisions publishes nothing on coordination topics.
#[test]
fn local_decisions_stay_off_coordination_topics() {
    let mut fleet = Fleet::new(&["A", "B"]);
    fleet.run(0, 2_000, 50);
    let core = fleet.core_mut("A");
    let before = core.consensus.metrics().proposals_started;
    let outcome = core.execute_local(
        ActionName::LoadShed,
        &serde_json::json!({ "shed_percent": 3 }),
    );
    assert_eq!(outcome, constellation_proto::ActionOutcome::Success);
    assert_eq!(core.consensus.metrics().proposals_started, before);
    assert_eq!(core.propagator.metrics().actions_propagated, 0);
}
