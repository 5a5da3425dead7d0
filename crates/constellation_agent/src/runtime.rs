//! Agent runtime: owns the coordination core and drives it from a worker
//! thread, while exposing the decision pipeline to the telemetry layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use constellation_coord::{
    ConsensusMetrics, ElectionMetrics, ElectionReport, MemoryMetrics, PropagatorMetrics,
    ReassignerMetrics, RemoteGet,
};
use constellation_net::BusMetricsSnapshot;
use constellation_proto::{
    now_unix_ms, AgentRole, AnomalyPattern, BusTransport, DecisionScope,
};
use tracing::warn;

use crate::core::{CoordinationCore, CoreCounters};
use crate::decision::{Decision, DecisionLoop, DecisionLoopMetrics, InnerReasoner};
use crate::error::AgentError;
use crate::orchestrator::{OrchestratorConfig, OrchestratorMetrics, ResponseOrchestrator};
use crate::safety::{SafetyConfig, SafetyMetrics};
use crate::types::{AgentConfig, Effector, TelemetrySample, TelemetrySource};

/// Operator-facing aggregation of every component's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AgentMetricsSnapshot {
    pub bus: BusMetricsSnapshot,
    pub election: ElectionMetrics,
    pub consensus: ConsensusMetrics,
    pub propagator: PropagatorMetrics,
    pub reassigner: ReassignerMetrics,
    pub memory: MemoryMetrics,
    pub core: CoreCounters,
    pub decisions: DecisionLoopMetrics,
    pub orchestrator: OrchestratorMetrics,
    pub safety: SafetyMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub role: AgentRole,
    pub running: bool,
    pub tick_count: u64,
    pub last_tick_unix_ms: Option<i64>,
    pub election: ElectionReport,
    pub alive_peers: usize,
    pub constellation_health: f64,
    pub last_error: Option<String>,
    pub metrics: AgentMetricsSnapshot,
}

#[derive(Debug, Clone, Default)]
struct RuntimeState {
    tick_count: u64,
    last_tick_unix_ms: Option<i64>,
    last_error: Option<String>,
}

pub struct AgentRuntime {
    config: AgentConfig,
    core: Arc<Mutex<CoordinationCore>>,
    decision_loop: Arc<Mutex<DecisionLoop>>,
    orchestrator: Arc<Mutex<ResponseOrchestrator>>,
    reasoner: Arc<Mutex<Box<dyn InnerReasoner>>>,
    telemetry: Option<Arc<Mutex<Box<dyn TelemetrySource>>>>,
    state: Arc<Mutex<RuntimeState>>,
    running: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn BusTransport>,
        reasoner: Box<dyn InnerReasoner>,
        effector: Arc<dyn Effector>,
    ) -> Result<Self, AgentError> {
        let core = CoordinationCore::new(config.clone(), transport, effector, now_unix_ms())?;
        let orchestrator = ResponseOrchestrator::new(
            OrchestratorConfig::from_agent_config(&config),
            SafetyConfig {
                risk_threshold: config.safety_risk_threshold,
                propagation_factor: config.safety_propagation_factor,
            },
        );
        let decision_loop = DecisionLoop::new(config.global_context_ttl_ms);
        Ok(Self {
            config,
            core: Arc::new(Mutex::new(core)),
            decision_loop: Arc::new(Mutex::new(decision_loop)),
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            reasoner: Arc::new(Mutex::new(reasoner)),
            telemetry: None,
            state: Arc::new(Mutex::new(RuntimeState::default())),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            worker: None,
        })
    }

    pub fn with_telemetry_source(mut self, source: Box<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(Arc::new(Mutex::new(source)));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the coordination worker: one pump per tick interval, plus a
    /// telemetry poll when a source is attached.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning {
                agent_id: self.config.agent_id.clone(),
            });
        }
        {
            let mut state = lock(&self.state);
            *state = RuntimeState::default();
        }

        let tick_interval = self.config.tick_interval;
        let worker_name = format!("constellation-{}", self.config.agent_id);
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let core = Arc::clone(&self.core);
        let decision_loop = Arc::clone(&self.decision_loop);
        let orchestrator = Arc::clone(&self.orchestrator);
        let reasoner = Arc::clone(&self.reasoner);
        let telemetry = self.telemetry.as_ref().map(Arc::clone);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(tick_interval) {
                        Ok(()) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let now_ms = now_unix_ms();
                            {
                                let mut guard = lock(&core);
                                let result = guard.pump(now_ms);
                                drop(guard);
                                let mut current = lock(&state);
                                current.tick_count = current.tick_count.saturating_add(1);
                                current.last_tick_unix_ms = Some(now_ms);
                                match result {
                                    Ok(()) => current.last_error = None,
                                    Err(err) => current.last_error = Some(err.to_string()),
                                }
                            }
                            if let Some(source) = &telemetry {
                                let sample = {
                                    let mut source = lock(source);
                                    source.poll()
                                };
                                if let Some(sample) = sample {
                                    let _ = process_sample(
                                        &core,
                                        &decision_loop,
                                        &orchestrator,
                                        &reasoner,
                                        &sample,
                                    );
                                }
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                AgentError::ThreadSpawnFailed {
                    reason: err.to_string(),
                }
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), AgentError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AgentError::NotRunning {
                agent_id: self.config.agent_id.clone(),
            });
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| AgentError::ThreadJoinFailed {
                agent_id: self.config.agent_id.clone(),
            })?;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Push-style entry for the telemetry layer: one decision step plus its
    /// scope-routed execution. Returns the decision and whether execution
    /// succeeded.
    pub fn process_telemetry(&self, sample: &TelemetrySample) -> (Decision, bool) {
        process_sample(
            &self.core,
            &self.decision_loop,
            &self.orchestrator,
            &self.reasoner,
            sample,
        )
    }

    /// Executes an already-formed decision (used by operators and tests).
    pub fn execute_decision(
        &self,
        decision: &Decision,
        scope_override: Option<DecisionScope>,
    ) -> bool {
        let mut orchestrator = lock(&self.orchestrator);
        orchestrator.execute(&self.core, decision, scope_override)
    }

    /// The anomaly stack reports local risk here; it feeds health
    /// broadcasts and leadership eligibility.
    pub fn set_own_risk(&self, risk: f64) {
        lock(&self.core).set_own_risk(risk);
    }

    /// Authoritative local pattern write with background replication.
    pub fn store_pattern(&self, pattern: AnomalyPattern) -> Result<(), AgentError> {
        let mut core = lock(&self.core);
        let now = now_unix_ms();
        let core = &mut *core;
        core.memory
            .put(pattern, now, &core.registry, &mut core.bus)
            .map_err(AgentError::from)
    }

    /// Local-first pattern lookup; on a miss, queries the nearest peers and
    /// waits up to the memory query timeout. `None` means nobody had it.
    pub fn recall_pattern(&self, pattern_id: &str) -> Option<AnomalyPattern> {
        let query_id = {
            let mut guard = lock(&self.core);
            if let Some(found) = guard.memory.get_local(pattern_id) {
                return Some(found);
            }
            let now = now_unix_ms();
            let core = &mut *guard;
            match core
                .memory
                .begin_remote_get(pattern_id, now, &core.registry, &mut core.bus)
            {
                Ok(query_id) => query_id,
                Err(err) => {
                    warn!(error = %err, "pattern query failed to start");
                    return None;
                }
            }
        };
        loop {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let now = now_unix_ms();
            let mut guard = lock(&self.core);
            if !self.is_running() {
                // Nobody is pumping the bus for us.
                if guard.pump(now).is_err() {
                    return None;
                }
            }
            match guard.memory.poll_remote(&query_id, now) {
                RemoteGet::Pending => continue,
                RemoteGet::Found(pattern) => return Some(pattern),
                RemoteGet::Miss => return None,
            }
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let now = now_unix_ms();
        // One lock at a time; the orchestrator takes the core lock while
        // executing, so holding both here could deadlock.
        let mut snapshot = {
            let core = lock(&self.core);
            AgentSnapshot {
                agent_id: core.agent_id().to_string(),
                role: core.own_role(),
                running: self.running.load(Ordering::SeqCst),
                tick_count: 0,
                last_tick_unix_ms: None,
                election: core.election.report(now),
                alive_peers: core.registry.alive_peers(now).len(),
                constellation_health: core.registry.constellation_health(now),
                last_error: None,
                metrics: AgentMetricsSnapshot {
                    bus: core.bus.metrics(),
                    election: core.election.metrics(),
                    consensus: core.consensus.metrics(),
                    propagator: core.propagator.metrics(),
                    reassigner: core.reassigner.metrics(),
                    memory: core.memory.metrics(),
                    core: core.counters(),
                    decisions: DecisionLoopMetrics::default(),
                    orchestrator: OrchestratorMetrics::default(),
                    safety: SafetyMetrics::default(),
                },
            }
        };
        snapshot.metrics.decisions = lock(&self.decision_loop).metrics();
        {
            let orchestrator = lock(&self.orchestrator);
            snapshot.metrics.orchestrator = orchestrator.metrics();
            snapshot.metrics.safety = orchestrator.safety_metrics();
        }
        {
            let state = lock(&self.state);
            snapshot.tick_count = state.tick_count;
            snapshot.last_tick_unix_ms = state.last_tick_unix_ms;
            snapshot.last_error = state.last_error.clone();
        }
        snapshot
    }

    /// Test and tooling access to the shared core.
    pub fn core(&self) -> Arc<Mutex<CoordinationCore>> {
        Arc::clone(&self.core)
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn process_sample(
    core: &Arc<Mutex<CoordinationCore>>,
    decision_loop: &Arc<Mutex<DecisionLoop>>,
    orchestrator: &Arc<Mutex<ResponseOrchestrator>>,
    reasoner: &Arc<Mutex<Box<dyn InnerReasoner>>>,
    sample: &TelemetrySample,
) -> (Decision, bool) {
    let decision = {
        let mut core_guard = lock(core);
        let mut loop_guard = lock(decision_loop);
        let mut reasoner_guard = lock(reasoner);
        loop_guard.step(
            &mut core_guard,
            &mut **reasoner_guard,
            sample,
            now_unix_ms(),
        )
    };
    let executed = {
        let mut orchestrator = lock(orchestrator);
        orchestrator.execute(core, &decision, None)
    };
    (decision, executed)
}

fn lock<T>(value: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
