//! MQTT protocol simulation.
//!
//! - `message`: message model and topic-filter matching
//! - `broker`: in-process broker network (routing, retained store, LWT)
//! - `client`: per-node client state machine

pub mod broker;
pub mod client;
pub mod message;

pub use broker::{BrokerNetwork, BrokerStats, Inbound, Inbox, Will};
pub use client::{MqttClient, MqttStats, ReconnectBackoff, ReconnectOutcome};
pub use message::{MqttMessage, topic_matches};
