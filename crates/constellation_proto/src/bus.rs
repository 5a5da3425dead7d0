//! Transport abstraction the QoS bus is layered over.
//!
//! A transport moves opaque frames between agents by topic and knows nothing
//! about QoS; retries, acknowledgements, deduplication and ordering live in
//! `constellation_net`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn is_reliable(self) -> bool {
        matches!(self, QosLevel::AtLeastOnce | QosLevel::ExactlyOnce)
    }
}

/// Shared per-agent inbox: topic name to queued frames.
pub type TopicInbox = Arc<Mutex<HashMap<String, VecDeque<Vec<u8>>>>>;

/// Drain handle for one topic of an agent's inbox.
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    topic: String,
    inbox: TopicInbox,
}

impl TopicSubscription {
    pub fn new(topic: String, inbox: TopicInbox) -> Self {
        Self { topic, inbox }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes and returns every queued frame for this topic.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match inbox.get_mut(&self.topic) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

/// A byte-frame transport between agents.
///
/// `send` broadcasts to every other agent wired to the same medium; a frame
/// is never looped back to its sender. `pump` gives socket-backed transports
/// a chance to move received datagrams into the inbox; in-memory transports
/// deliver synchronously and keep the default no-op.
pub trait BusTransport: Send + Sync {
    fn agent_id(&self) -> &str;

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), CoordError>;

    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, CoordError>;

    fn pump(&self) -> Result<(), CoordError> {
        Ok(())
    }
}
