//! QoS message bus and transports for the coordination fabric.
//!
//! The bus layers delivery guarantees (retry, acknowledgement, dedup,
//! per-stream ordering, backpressure) over a raw [`BusTransport`]. Two
//! transports ship with the crate: an in-process switchboard used by tests
//! and single-host fleets, and a nonblocking UDP endpoint for datagram
//! deployments.

mod bus;
mod frame;
mod governor;
mod switchboard;
mod udp;

pub use bus::{BusConfig, BusMetricsSnapshot, MessageBus};
pub use constellation_proto::{BusTransport, QosLevel, TopicSubscription};
pub use frame::{AckFrame, BusFrame, DataFrame};
pub use governor::{BandwidthGovernor, GovernorConfig};
pub use switchboard::{InMemoryTransport, Switchboard};
pub use udp::{UdpTransport, UdpTransportConfig};
