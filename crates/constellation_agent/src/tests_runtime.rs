//! Runtime lifecycle behavior with real worker threads and short sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use constellation_net::Switchboard;
use constellation_proto::{ActionName, AnomalyPattern, CoordError, DecisionScope};

use crate::decision::{Decision, GlobalContext, InnerReasoner};
use crate::error::AgentError;
use crate::runtime::AgentRuntime;
use crate::types::{
    AcknowledgingEffector, AgentConfig, Effector, TelemetrySample, TelemetrySource,
};

struct LocalLoadShedReasoner;

impl InnerReasoner for LocalLoadShedReasoner {
    fn reason(
        &mut self,
        _telemetry: &TelemetrySample,
        _context: &GlobalContext,
    ) -> Result<Decision, CoordError> {
        Ok(Decision {
            action_name: ActionName::LoadShed,
            params: serde_json::json!({ "shed_percent": 5 }),
            scope: DecisionScope::Local,
            confidence: 0.9,
            rationale: "bus load trending up".to_string(),
        })
    }
}

struct CountingEffector {
    applied: AtomicUsize,
}

impl Effector for CountingEffector {
    fn apply(
        &self,
        _action: ActionName,
        _params: &serde_json::Value,
    ) -> constellation_proto::ActionOutcome {
        self.applied.fetch_add(1, Ordering::SeqCst);
        constellation_proto::ActionOutcome::Success
    }
}

fn runtime_on(switchboard: &Switchboard, agent_id: &str) -> AgentRuntime {
    AgentRuntime::new(
        AgentConfig {
            tick_interval: Duration::from_millis(10),
            ..AgentConfig::named(agent_id)
        },
        Arc::new(switchboard.attach(agent_id)),
        Box::new(LocalLoadShedReasoner),
        Arc::new(AcknowledgingEffector),
    )
    .expect("runtime")
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn start_ticks_and_stops() {
    let switchboard = Switchboard::new();
    let mut runtime = runtime_on(&switchboard, "sat-a");
    runtime.start().expect("start");
    wait_until("first ticks", Duration::from_secs(2), || {
        runtime.snapshot().tick_count >= 2
    });
    assert!(runtime.is_running());
    runtime.stop().expect("stop");
    assert!(!runtime.is_running());
    assert!(matches!(
        runtime.stop(),
        Err(AgentError::NotRunning { .. })
    ));
}

#[test]
fn double_start_is_rejected() {
    let switchboard = Switchboard::new();
    let mut runtime = runtime_on(&switchboard, "sat-a");
    runtime.start().expect("start");
    assert!(matches!(
        runtime.start(),
        Err(AgentError::AlreadyRunning { .. })
    ));
    runtime.stop().expect("stop");
}

#[test]
fn lone_runtime_elects_itself() {
    let switchboard = Switchboard::new();
    let mut runtime = runtime_on(&switchboard, "sat-a");
    runtime.start().expect("start");
    wait_until("self-election", Duration::from_secs(3), || {
        runtime.snapshot().election.leader_id == Some("sat-a".to_string())
    });
    runtime.stop().expect("stop");
}

#[test]
fn telemetry_drives_a_local_execution() {
    let switchboard = Switchboard::new();
    let effector = Arc::new(CountingEffector {
        applied: AtomicUsize::new(0),
    });
    let mut runtime = AgentRuntime::new(
        AgentConfig {
            tick_interval: Duration::from_millis(10),
            ..AgentConfig::named("sat-a")
        },
        Arc::new(switchboard.attach("sat-a")),
        Box::new(LocalLoadShedReasoner),
        effector.clone(),
    )
    .expect("runtime");
    runtime.start().expect("start");

    let sample = TelemetrySample {
        source: "eps".to_string(),
        readings: [("bus_load".to_string(), 0.8)].into_iter().collect(),
        captured_at_ms: 0,
    };
    let (decision, executed) = runtime.process_telemetry(&sample);
    assert_eq!(decision.action_name, ActionName::LoadShed);
    assert_eq!(decision.scope, DecisionScope::Local);
    assert!(executed);
    assert_eq!(effector.applied.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.snapshot().metrics.decisions.decisions_total, 1);
    runtime.stop().expect("stop");
}

#[test]
fn pattern_store_and_recall_round_trip() {
    let switchboard = Switchboard::new();
    let runtime = runtime_on(&switchboard, "sat-a");
    let pattern = AnomalyPattern {
        pattern_id: "thermal-osc-1".to_string(),
        signature: vec![0.3, 0.1, 0.9],
        risk_score: 0.4,
        recurrence_count: 2,
        last_seen_ms: 1_000,
        origin_id: String::new(),
    };
    runtime.store_pattern(pattern.clone()).expect("store");
    let recalled = runtime.recall_pattern("thermal-osc-1").expect("pattern");
    assert_eq!(recalled.signature, pattern.signature);
    assert_eq!(recalled.origin_id, "sat-a");
}

#[test]
fn recall_of_unknown_pattern_misses_quickly() {
    let switchboard = Switchboard::new();
    let runtime = runtime_on(&switchboard, "sat-a");
    // No peers to ask: the query resolves to a miss immediately.
    assert!(runtime.recall_pattern("ghost").is_none());
    let metrics = runtime.snapshot().metrics.memory;
    assert_eq!(metrics.misses, 1);
}

struct OneShotTelemetry {
    remaining: usize,
}

impl TelemetrySource for OneShotTelemetry {
    fn poll(&mut self) -> Option<TelemetrySample> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(TelemetrySample {
            source: "thermal".to_string(),
            readings: [("panel_temp_c".to_string(), 41.0)].into_iter().collect(),
            captured_at_ms: 0,
        })
    }
}

#[test]
fn polled_telemetry_source_feeds_the_decision_loop() {
    let switchboard = Switchboard::new();
    let mut runtime = AgentRuntime::new(
        AgentConfig {
            tick_interval: Duration::from_millis(10),
            ..AgentConfig::named("sat-a")
        },
        Arc::new(switchboard.attach("sat-a")),
        Box::new(LocalLoadShedReasoner),
        Arc::new(AcknowledgingEffector),
    )
    .expect("runtime")
    .with_telemetry_source(Box::new(OneShotTelemetry { remaining: 1 }));
    runtime.start().expect("start");
    wait_until("telemetry-driven decision", Duration::from_secs(2), || {
        runtime.snapshot().metrics.decisions.decisions_total >= 1
    });
    runtime.stop().expect("stop");
}

#[test]
fn two_agent_fleet_executes_a_swarm_decision() {
    let switchboard = Switchboard::new();
    let mut a = runtime_on(&switchboard, "sat-a");
    let mut b = runtime_on(&switchboard, "sat-b");
    a.start().expect("start a");
    b.start().expect("start b");

    // The lexicographically greater agent wins the boot election.
    wait_until("election", Duration::from_secs(5), || {
        b.snapshot().election.leader_id == Some("sat-b".to_string())
            && a.snapshot().election.leader_id == Some("sat-b".to_string())
    });

    let decision = Decision {
        action_name: ActionName::LoadShed,
        params: serde_json::json!({ "shed_percent": 5 }),
        scope: DecisionScope::Swarm,
        confidence: 0.9,
        rationale: "fleet-wide load trim".to_string(),
    };
    assert!(b.execute_decision(&decision, None), "leader swarm execution");
    assert!(!a.execute_decision(&decision, None), "follower is denied");

    let leader_metrics = b.snapshot().metrics;
    assert_eq!(leader_metrics.orchestrator.swarm_executions, 1);
    assert_eq!(leader_metrics.consensus.proposals_approved, 1);
    let follower_metrics = a.snapshot().metrics;
    assert_eq!(follower_metrics.orchestrator.denied_not_leader, 1);

    b.stop().expect("stop b");
    a.stop().expect("stop a");
}
