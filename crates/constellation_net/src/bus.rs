//! QoS layering over a raw transport.
//!
//! - at-most-once: fire and forget, no sequence number, no ack.
//! - at-least-once: sender retries on an interval until enough acks arrive
//!   or the retry limit is hit; receivers see in-order delivery per
//!   (topic, sender) stream and may observe duplicates across abandons.
//! - exactly-once: at-least-once plus receiver-side dedup by stream
//!   sequence number.
//!
//! Acks travel on the original sender's `bus/ack/{agent}` topic, so the ack
//! path works over broadcast-only transports.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use constellation_proto::{topics, BusTransport, CoordError, QosLevel, TopicSubscription};

use crate::frame::{AckFrame, BusFrame, DataFrame};
use crate::governor::{BandwidthGovernor, GovernorConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Outbound frames awaiting acks before publish starts failing with
    /// backpressure.
    pub max_pending_outbound: usize,
    pub retry_interval_ms: i64,
    pub retry_limit: u32,
    /// Acks required before a reliable send is considered delivered and
    /// retries stop.
    pub ack_quorum: usize,
    /// How long an out-of-order frame may wait for its gap to fill before
    /// the stream skips ahead.
    pub reorder_timeout_ms: i64,
    /// Upper bound on buffered out-of-order frames per stream.
    pub max_stream_buffer: usize,
    pub governor: GovernorConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_pending_outbound: 1_024,
            retry_interval_ms: 250,
            retry_limit: 5,
            ack_quorum: 1,
            reorder_timeout_ms: 1_000,
            max_stream_buffer: 4_096,
            governor: GovernorConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.max_pending_outbound == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "bus max_pending_outbound must be positive".to_string(),
            });
        }
        if self.retry_interval_ms <= 0 {
            return Err(CoordError::InvalidConfig {
                reason: "bus retry_interval_ms must be positive".to_string(),
            });
        }
        if self.ack_quorum == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "bus ack_quorum must be positive".to_string(),
            });
        }
        if self.max_stream_buffer == 0 {
            return Err(CoordError::InvalidConfig {
                reason: "bus max_stream_buffer must be positive".to_string(),
            });
        }
        Ok(())
    }
}

type Handler = Arc<dyn Fn(&[u8]) -> Result<(), CoordError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acked_out: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub duplicates_dropped: u64,
    pub handler_failures: u64,
    pub reorder_flushes: u64,
    pub backpressure_rejections: u64,
    pub malformed_dropped: u64,
}

struct PendingSend {
    frame: DataFrame,
    attempts: u32,
    next_retry_at_ms: i64,
    ackers: BTreeSet<String>,
}

struct StreamState {
    next_seq: u64,
    buffered: BTreeMap<u64, (Vec<u8>, i64)>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_seq: 1,
            buffered: BTreeMap::new(),
        }
    }
}

struct TopicState {
    handlers: BTreeMap<String, Handler>,
    queue: VecDeque<Vec<u8>>,
    queue_open: bool,
    subscription: TopicSubscription,
}

pub struct MessageBus {
    transport: Arc<dyn BusTransport>,
    config: BusConfig,
    agent_id: String,
    ack_subscription: TopicSubscription,
    next_seq: HashMap<String, u64>,
    pending: BTreeMap<(String, u64), PendingSend>,
    topics: BTreeMap<String, TopicState>,
    streams: HashMap<(String, String), StreamState>,
    redeliver: VecDeque<(String, Vec<u8>)>,
    governor: BandwidthGovernor,
    metrics: BusMetricsSnapshot,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn BusTransport>, config: BusConfig) -> Result<Self, CoordError> {
        config.validate()?;
        let agent_id = transport.agent_id().to_string();
        if agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "bus transport agent_id cannot be empty".to_string(),
            });
        }
        let ack_subscription = transport.subscribe(&topics::ack_topic(&agent_id))?;
        let governor = BandwidthGovernor::new(config.governor);
        Ok(Self {
            transport,
            config,
            agent_id,
            ack_subscription,
            next_seq: HashMap::new(),
            pending: BTreeMap::new(),
            topics: BTreeMap::new(),
            streams: HashMap::new(),
            redeliver: VecDeque::new(),
            governor,
            metrics: BusMetricsSnapshot::default(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.metrics
    }

    /// Reliable sends still awaiting acknowledgement.
    pub fn pending_outbound(&self) -> usize {
        self.pending.len()
    }

    /// Congestion hint in [0, 1] from the bandwidth governor.
    pub fn utilization(&mut self, now_ms: i64) -> f64 {
        self.governor.utilization(now_ms)
    }

    /// Accepts a payload for delivery. Returns the stream sequence number
    /// (zero for at-most-once).
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        now_ms: i64,
    ) -> Result<u64, CoordError> {
        if qos.is_reliable() && self.pending.len() >= self.config.max_pending_outbound {
            self.metrics.backpressure_rejections += 1;
            self.governor.record_failure(now_ms);
            return Err(CoordError::Backpressure {
                topic: topic.to_string(),
                queued: self.pending.len(),
            });
        }

        let seq = if qos.is_reliable() {
            let counter = self.next_seq.entry(topic.to_string()).or_insert(1);
            let seq = *counter;
            *counter += 1;
            seq
        } else {
            0
        };

        let frame = DataFrame {
            sender_id: self.agent_id.clone(),
            topic: topic.to_string(),
            seq,
            qos,
            payload: payload.to_vec(),
        };
        let bytes = BusFrame::Data(frame.clone()).encode()?;

        self.governor.record_publish(now_ms);
        self.metrics.published += 1;
        match self.transport.send(topic, &bytes) {
            Ok(()) => {}
            Err(err) => {
                self.governor.record_failure(now_ms);
                if !qos.is_reliable() {
                    // Fire-and-forget frames are discarded on transport error.
                    debug!(topic, error = %err, "at-most-once frame dropped");
                    return Ok(0);
                }
                debug!(topic, error = %err, "reliable send failed; will retry");
            }
        }

        if qos.is_reliable() {
            self.pending.insert(
                (topic.to_string(), seq),
                PendingSend {
                    frame,
                    attempts: 1,
                    next_retry_at_ms: now_ms + self.config.retry_interval_ms,
                    ackers: BTreeSet::new(),
                },
            );
        }
        Ok(seq)
    }

    /// Opens a queue-mode subscription; delivered payloads are fetched with
    /// [`MessageBus::take_delivered`]. Idempotent per topic.
    pub fn subscribe(&mut self, topic: &str, _qos: QosLevel) -> Result<(), CoordError> {
        self.ensure_topic(topic)?;
        let state = self.topics.get_mut(topic).expect("topic just ensured");
        state.queue_open = true;
        Ok(())
    }

    /// Registers a callback for a topic. Duplicate registration of the same
    /// (topic, handler id) replaces the previous callback.
    pub fn subscribe_handler(
        &mut self,
        topic: &str,
        _qos: QosLevel,
        handler_id: &str,
        handler: Handler,
    ) -> Result<(), CoordError> {
        self.ensure_topic(topic)?;
        let state = self.topics.get_mut(topic).expect("topic just ensured");
        state.handlers.insert(handler_id.to_string(), handler);
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str, handler_id: &str) {
        if let Some(state) = self.topics.get_mut(topic) {
            state.handlers.remove(handler_id);
        }
    }

    /// Drains payloads delivered to a queue-mode subscription.
    pub fn take_delivered(&mut self, topic: &str) -> Vec<Vec<u8>> {
        match self.topics.get_mut(topic) {
            Some(state) => state.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// One scheduling step: pump the transport, fold in acks and data
    /// frames, flush stuck reorder buffers, retransmit unacked sends.
    pub fn tick(&mut self, now_ms: i64) -> Result<(), CoordError> {
        self.transport.pump()?;
        self.process_acks();
        self.process_data(now_ms);
        self.flush_stuck_streams(now_ms);
        self.redeliver_failed(now_ms);
        self.retransmit(now_ms);
        Ok(())
    }

    fn ensure_topic(&mut self, topic: &str) -> Result<(), CoordError> {
        if !self.topics.contains_key(topic) {
            let subscription = self.transport.subscribe(topic)?;
            self.topics.insert(
                topic.to_string(),
                TopicState {
                    handlers: BTreeMap::new(),
                    queue: VecDeque::new(),
                    queue_open: false,
                    subscription,
                },
            );
        }
        Ok(())
    }

    fn process_acks(&mut self) {
        for bytes in self.ack_subscription.drain() {
            let ack = match BusFrame::decode(&bytes) {
                Ok(BusFrame::Ack(ack)) => ack,
                Ok(_) => {
                    self.metrics.malformed_dropped += 1;
                    continue;
                }
                Err(_) => {
                    self.metrics.malformed_dropped += 1;
                    continue;
                }
            };
            if ack.sender_id != self.agent_id {
                continue;
            }
            let key = (ack.topic.clone(), ack.seq);
            let delivered = match self.pending.get_mut(&key) {
                Some(pending) => {
                    pending.ackers.insert(ack.acker_id);
                    pending.ackers.len() >= self.config.ack_quorum
                }
                None => false,
            };
            if delivered {
                self.pending.remove(&key);
            }
        }
    }

    fn process_data(&mut self, now_ms: i64) {
        let topic_names: Vec<String> = self.topics.keys().cloned().collect();
        for topic in topic_names {
            let frames = match self.topics.get(&topic) {
                Some(state) => state.subscription.drain(),
                None => continue,
            };
            for bytes in frames {
                let frame = match BusFrame::decode(&bytes) {
                    Ok(BusFrame::Data(frame)) => frame,
                    Ok(_) => {
                        self.metrics.malformed_dropped += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(topic, error = %err, "dropping malformed bus frame");
                        self.metrics.malformed_dropped += 1;
                        continue;
                    }
                };
                if frame.topic != topic || frame.sender_id == self.agent_id {
                    self.metrics.malformed_dropped += 1;
                    continue;
                }
                self.accept_frame(frame, now_ms);
            }
        }
    }

    fn accept_frame(&mut self, frame: DataFrame, now_ms: i64) {
        if !frame.qos.is_reliable() {
            self.deliver(&frame.topic, frame.payload, frame.qos);
            return;
        }

        // Reliable frames are acked on acceptance; the sender stops
        // retrying once enough receivers have the frame buffered.
        self.send_ack(&frame);

        let key = (frame.sender_id.clone(), frame.topic.clone());
        let stream = self.streams.entry(key).or_insert_with(StreamState::new);
        if frame.seq < stream.next_seq || stream.buffered.contains_key(&frame.seq) {
            self.metrics.duplicates_dropped += 1;
            return;
        }
        if stream.buffered.len() >= self.config.max_stream_buffer {
            // Stream buffer is full; skip ahead rather than grow unbounded.
            stream.next_seq = *stream.buffered.keys().next().expect("non-empty buffer");
            self.metrics.reorder_flushes += 1;
        }
        stream.buffered.insert(frame.seq, (frame.payload, now_ms));
        self.drain_ready(&frame.sender_id, &frame.topic, frame.qos);
    }

    fn drain_ready(&mut self, sender: &str, topic: &str, qos: QosLevel) {
        loop {
            let payload = {
                let stream = match self.streams.get_mut(&(sender.to_string(), topic.to_string()))
                {
                    Some(stream) => stream,
                    None => return,
                };
                let next = stream.next_seq;
                match stream.buffered.remove(&next) {
                    Some((payload, _)) => {
                        stream.next_seq = next + 1;
                        payload
                    }
                    None => return,
                }
            };
            self.deliver(topic, payload, qos);
        }
    }

    fn deliver(&mut self, topic: &str, payload: Vec<u8>, qos: QosLevel) {
        let state = match self.topics.get_mut(topic) {
            Some(state) => state,
            None => return,
        };
        self.metrics.delivered += 1;
        if state.queue_open {
            state.queue.push_back(payload.clone());
        }
        let handlers: Vec<(String, Handler)> = state
            .handlers
            .iter()
            .map(|(id, handler)| (id.clone(), Arc::clone(handler)))
            .collect();
        for (handler_id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            let failed = !matches!(outcome, Ok(Ok(())));
            if failed {
                self.metrics.handler_failures += 1;
                warn!(topic, handler_id = %handler_id, "subscriber handler failed");
                if qos.is_reliable() {
                    // One local redelivery attempt next tick; fire-and-forget
                    // frames are discarded.
                    self.redeliver.push_back((topic.to_string(), payload.clone()));
                }
            }
        }
    }

    fn redeliver_failed(&mut self, _now_ms: i64) {
        let batch: Vec<(String, Vec<u8>)> = self.redeliver.drain(..).collect();
        for (topic, payload) in batch {
            let handlers: Vec<Handler> = match self.topics.get(&topic) {
                Some(state) => state.handlers.values().map(Arc::clone).collect(),
                None => continue,
            };
            for handler in handlers {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&payload)));
                if !matches!(outcome, Ok(Ok(()))) {
                    self.metrics.handler_failures += 1;
                    warn!(topic, "handler failed on redelivery; dropping");
                }
            }
        }
    }

    fn flush_stuck_streams(&mut self, now_ms: i64) {
        let mut ready: Vec<(String, String)> = Vec::new();
        for ((sender, topic), stream) in &mut self.streams {
            if stream.buffered.is_empty() {
                continue;
            }
            let oldest = stream
                .buffered
                .values()
                .map(|(_, at)| *at)
                .min()
                .expect("non-empty buffer");
            if now_ms.saturating_sub(oldest) >= self.config.reorder_timeout_ms {
                // The gap sender abandoned a retry; skip ahead.
                stream.next_seq = *stream.buffered.keys().next().expect("non-empty buffer");
                ready.push((sender.clone(), topic.clone()));
            }
        }
        for (sender, topic) in ready {
            self.metrics.reorder_flushes += 1;
            // Exactly-once loses nothing here: only frames that were never
            // received are skipped, and those were already abandoned by the
            // sender.
            self.drain_ready(&sender, &topic, QosLevel::ExactlyOnce);
        }
    }

    fn retransmit(&mut self, now_ms: i64) {
        let mut abandoned: Vec<(String, u64)> = Vec::new();
        let mut resend: Vec<(String, u64)> = Vec::new();
        for ((topic, seq), pending) in &self.pending {
            if pending.next_retry_at_ms > now_ms {
                continue;
            }
            if pending.attempts > self.config.retry_limit {
                abandoned.push((topic.clone(), *seq));
            } else {
                resend.push((topic.clone(), *seq));
            }
        }
        for key in abandoned {
            self.pending.remove(&key);
            self.metrics.abandoned += 1;
            warn!(topic = %key.0, seq = key.1, "abandoning unacked frame");
        }
        for key in resend {
            let (bytes, topic) = {
                let pending = match self.pending.get_mut(&key) {
                    Some(pending) => pending,
                    None => continue,
                };
                pending.attempts += 1;
                pending.next_retry_at_ms = now_ms + self.config.retry_interval_ms;
                let bytes = match BusFrame::Data(pending.frame.clone()).encode() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                (bytes, key.0.clone())
            };
            self.metrics.retries += 1;
            if let Err(err) = self.transport.send(&topic, &bytes) {
                self.governor.record_failure(now_ms);
                debug!(topic, error = %err, "retransmit failed");
            }
        }
    }

    fn send_ack(&mut self, frame: &DataFrame) {
        let ack = BusFrame::Ack(AckFrame {
            acker_id: self.agent_id.clone(),
            sender_id: frame.sender_id.clone(),
            topic: frame.topic.clone(),
            seq: frame.seq,
        });
        let bytes = match ack.encode() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let ack_topic = topics::ack_topic(&frame.sender_id);
        if self.transport.send(&ack_topic, &bytes).is_ok() {
            self.metrics.acked_out += 1;
        }
    }
}
