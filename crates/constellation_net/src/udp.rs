//! Nonblocking UDP transport: fans every frame out to a fixed peer set and
//! pumps received datagrams into the per-topic inbox.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use constellation_proto::{BusTransport, CoordError, TopicInbox, TopicSubscription};

const MAX_DATAGRAM_BYTES: usize = 60 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpTransportConfig {
    pub agent_id: String,
    pub bind_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
}

/// Datagram wrapper carrying the topic alongside the frame bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Datagram {
    topic: String,
    frame: Vec<u8>,
}

pub struct UdpTransport {
    agent_id: String,
    socket: UdpSocket,
    peers: Mutex<BTreeSet<SocketAddr>>,
    inbox: TopicInbox,
}

impl UdpTransport {
    pub fn bind(config: &UdpTransportConfig) -> Result<Self, CoordError> {
        if config.agent_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig {
                reason: "udp transport agent_id cannot be empty".to_string(),
            });
        }
        let socket = UdpSocket::bind(config.bind_addr).map_err(|err| CoordError::Transport {
            reason: format!("bind {} failed: {}", config.bind_addr, err),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| CoordError::Transport {
                reason: format!("set_nonblocking failed: {}", err),
            })?;
        let peers = config
            .peers
            .iter()
            .copied()
            .filter(|peer| *peer != config.bind_addr)
            .collect::<BTreeSet<_>>();
        Ok(Self {
            agent_id: config.agent_id.clone(),
            socket,
            peers: Mutex::new(peers),
            inbox: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.insert(peer);
    }

    pub fn remove_peer(&self, peer: &SocketAddr) {
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.remove(peer);
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoordError> {
        self.socket.local_addr().map_err(|err| CoordError::Transport {
            reason: format!("local_addr failed: {}", err),
        })
    }

    fn snapshot_peers(&self) -> Vec<SocketAddr> {
        let peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.iter().copied().collect()
    }
}

impl BusTransport for UdpTransport {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), CoordError> {
        let datagram = Datagram {
            topic: topic.to_string(),
            frame: payload.to_vec(),
        };
        let bytes = serde_json::to_vec(&datagram)?;
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(CoordError::Transport {
                reason: format!(
                    "frame on {} exceeds datagram limit: {} bytes",
                    topic,
                    bytes.len()
                ),
            });
        }
        for peer in self.snapshot_peers() {
            self.socket
                .send_to(&bytes, peer)
                .map_err(|err| CoordError::Transport {
                    reason: format!("send_to {} failed: {}", peer, err),
                })?;
        }
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

    fn pump(&self) -> Result<(), CoordError> {
        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let datagram: Datagram = match serde_json::from_slice(&buf[..len]) {
                        Ok(datagram) => datagram,
                        Err(err) => {
                            warn!(%from, error = %err, "dropping malformed datagram");
                            continue;
                        }
                    };
                    let mut inbox = self
                        .inbox
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    // Topics nobody subscribed to are dropped on the floor.
                    if let Some(queue) = inbox.get_mut(&datagram.topic) {
                        queue.push_back(datagram.frame);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    return Err(CoordError::Transport {
                        reason: format!("recv_from failed: {}", err),
                    })
                }
            }
        }
    }
}
