//! In-process transport: a switchboard wires N agents together and routes
//! every frame to all other agents, subject to partitions and blocked links
//! installed by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use constellation_proto::{BusTransport, CoordError, TopicInbox, TopicSubscription};

#[derive(Default)]
struct SwitchboardState {
    inboxes: BTreeMap<String, TopicInbox>,
    blocked_links: BTreeSet<(String, String)>,
    silenced: BTreeSet<String>,
}

/// Shared medium connecting in-process agents.
#[derive(Clone, Default)]
pub struct Switchboard {
    state: Arc<Mutex<SwitchboardState>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a transport endpoint for one agent.
    pub fn attach(&self, agent_id: &str) -> InMemoryTransport {
        let inbox: TopicInbox = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut state = lock(&self.state);
            state.inboxes.insert(agent_id.to_string(), Arc::clone(&inbox));
        }
        InMemoryTransport {
            agent_id: agent_id.to_string(),
            inbox,
            switchboard: self.clone(),
        }
    }

    /// Blocks delivery in both directions between two agents.
    pub fn block_link(&self, a: &str, b: &str) {
        let mut state = lock(&self.state);
        state.blocked_links.insert(link_key(a, b));
    }

    pub fn unblock_link(&self, a: &str, b: &str) {
        let mut state = lock(&self.state);
        state.blocked_links.remove(&link_key(a, b));
    }

    /// Partitions one group of agents from everyone else.
    pub fn partition(&self, group: &[&str]) {
        let ids: Vec<String> = {
            let state = lock(&self.state);
            state.inboxes.keys().cloned().collect()
        };
        let group: BTreeSet<&str> = group.iter().copied().collect();
        let mut state = lock(&self.state);
        for a in &ids {
            for b in &ids {
                if a < b && group.contains(a.as_str()) != group.contains(b.as_str()) {
                    state.blocked_links.insert(link_key(a, b));
                }
            }
        }
    }

    /// Removes every partition and blocked link.
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.blocked_links.clear();
    }

    /// Drops every frame to and from the agent until revived. Used by tests
    /// to simulate a crashed satellite.
    pub fn silence(&self, agent_id: &str) {
        let mut state = lock(&self.state);
        state.silenced.insert(agent_id.to_string());
    }

    pub fn revive(&self, agent_id: &str) {
        let mut state = lock(&self.state);
        state.silenced.remove(agent_id);
    }

    fn route(&self, from: &str, topic: &str, payload: &[u8]) {
        let state = lock(&self.state);
        if state.silenced.contains(from) {
            return;
        }
        for (agent_id, inbox) in &state.inboxes {
            if agent_id == from || state.silenced.contains(agent_id) {
                continue;
            }
            if state.blocked_links.contains(&link_key(from, agent_id)) {
                continue;
            }
            let mut inbox = inbox
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Only subscribers hold a queue for the topic; everyone else
            // drops the frame, matching datagram transports.
            if let Some(queue) = inbox.get_mut(topic) {
                queue.push_back(payload.to_vec());
            }
        }
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn lock(state: &Arc<Mutex<SwitchboardState>>) -> std::sync::MutexGuard<'_, SwitchboardState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One agent's endpoint on a [`Switchboard`].
#[derive(Clone)]
pub struct InMemoryTransport {
    agent_id: String,
    inbox: TopicInbox,
    switchboard: Switchboard,
}

impl BusTransport for InMemoryTransport {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), CoordError> {
        self.switchboard.route(&self.agent_id, topic, payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, CoordError> {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inbox.entry(topic.to_string()).or_insert_with(VecDeque::new);
        drop(inbox);
        Ok(TopicSubscription::new(
            topic.to_string(),
            Arc::clone(&self.inbox),
        ))
    }
}
