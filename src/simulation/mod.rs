//! IoT MQTT network simulation core.
//!
//! Models sensor nodes that publish over BLE or WiFi links to a pair of
//! simulated MQTT brokers, with broker failover and relocation on top.
//!
//! ## Module Organization
//!
//! - `types`: Shared value types (points, protocols, QoS) and channel aliases
//! - `signal_calculations`: Distance based PDR, air time and link-change rules
//! - `energy`: Per-node battery accounting by radio state
//! - `mac`: BLE connection-interval and WiFi CSMA/CA medium access
//! - `mqtt`: Client state machine and the in-process broker network
//! - `mobility`: Position sources for mobile nodes
//! - `node`: One simulated device and its per-tick behavior
//! - `node_task`: The async task driving a node
//! - `failover`: Broker monitoring, staggered failover and relocation
//! - `metrics`: Delivery, latency and per-topic statistics
//! - `network`: Simulation orchestration and the control surface
//!
//! ## Public API
//!
//! `network_task` is the entry point spawned on the Embassy executor. It is
//! driven by `ControlCommand`s and signals a `SimulationSummary` when done.

pub mod energy;
pub mod failover;
pub mod mac;
pub mod metrics;
pub mod mobility;
pub mod mqtt;
pub mod network;
pub mod node;
pub mod node_task;
pub mod signal_calculations;
pub mod types;

pub use network::{ControlCommand, Simulation, SimulationSummary, SummarySignal, network_task, parse_command};
pub use types::{ControlQueue, ControlQueueSender, Point, Protocol};
