//! Simulation-wide metrics.
//!
//! Nodes report through the `MetricsSink` trait object they are given at
//! construction; the network task additionally feeds periodic node-state
//! snapshots in through `collect`.

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;

use super::node::NodeState;
use super::types::duration_to_secs;

pub trait MetricsSink: Send + Sync {
    /// Count one message published on `topic`.
    fn record_topic_message(&self, topic: &str);

    /// Count one end-to-end delivery attempt.
    fn record_delivery_attempt(&self, success: bool);

    /// Record an end-to-end latency sample.
    fn record_latency(&self, latency_ms: f64);
}

/// Sink that drops everything.
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_topic_message(&self, _topic: &str) {}
    fn record_delivery_attempt(&self, _success: bool) {}
    fn record_latency(&self, _latency_ms: f64) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_duplicates: u64,
    pub total_publish_failures: u64,
    pub delivery_ratio: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Messages per second per topic.
    pub topic_heatmap: BTreeMap<String, f64>,
    pub node_count: usize,
    pub connected_nodes: usize,
    pub average_battery: f64,
    pub uptime_seconds: f64,
}

#[derive(Default)]
struct MetricsState {
    total_messages_sent: u64,
    total_messages_received: u64,
    total_duplicates: u64,
    total_publish_failures: u64,
    latency_sum_ms: f64,
    latency_samples: u64,
    max_latency_ms: f64,
    topic_messages: BTreeMap<String, u64>,
    delivery_attempts: u64,
    delivery_successes: u64,
    node_count: usize,
    connected_nodes: usize,
    average_battery: f64,
}

pub struct MetricsCollector {
    start_time: Instant,
    state: Mutex<CriticalSectionRawMutex, RefCell<MetricsState>>,
}

impl MetricsCollector {
    pub fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            state: Mutex::new(RefCell::new(MetricsState::default())),
        }
    }

    /// Refresh the node-derived totals from a set of node snapshots.
    pub fn collect(&self, nodes: &[NodeState]) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.total_messages_sent = nodes.iter().map(|n| n.mqtt_stats.messages_sent).sum();
            state.total_messages_received = nodes.iter().map(|n| n.mqtt_stats.messages_received).sum();
            state.total_duplicates = nodes.iter().map(|n| n.mqtt_stats.duplicates_received).sum();
            state.total_publish_failures = nodes.iter().map(|n| n.mqtt_stats.publish_failures).sum();
            state.node_count = nodes.len();
            state.connected_nodes = nodes.iter().filter(|n| n.connected).count();
            state.average_battery = if nodes.is_empty() {
                0.0
            } else {
                nodes.iter().map(|n| n.battery).sum::<f64>() / nodes.len() as f64
            };
        });
    }

    pub fn delivery_ratio(&self) -> f64 {
        self.state.lock(|state| {
            let state = state.borrow();
            if state.delivery_attempts == 0 {
                0.0
            } else {
                state.delivery_successes as f64 / state.delivery_attempts as f64
            }
        })
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.state.lock(|state| {
            let state = state.borrow();
            if state.latency_samples == 0 { 0.0 } else { state.latency_sum_ms / state.latency_samples as f64 }
        })
    }

    pub fn topic_count(&self, topic: &str) -> u64 {
        self.state.lock(|state| state.borrow().topic_messages.get(topic).copied().unwrap_or(0))
    }

    /// Messages per second per topic since the collector started.
    pub fn topic_rates(&self, now: Instant) -> BTreeMap<String, f64> {
        let elapsed = duration_to_secs(now.saturating_duration_since(self.start_time));
        if elapsed <= 0.0 {
            return BTreeMap::new();
        }
        self.state.lock(|state| state.borrow().topic_messages.iter().map(|(topic, count)| (topic.clone(), *count as f64 / elapsed)).collect())
    }

    pub fn summary(&self, now: Instant) -> MetricsSummary {
        let delivery_ratio = self.delivery_ratio();
        let avg_latency_ms = self.avg_latency_ms();
        let topic_heatmap = self.topic_rates(now);
        self.state.lock(|state| {
            let state = state.borrow();
            MetricsSummary {
                total_messages_sent: state.total_messages_sent,
                total_messages_received: state.total_messages_received,
                total_duplicates: state.total_duplicates,
                total_publish_failures: state.total_publish_failures,
                delivery_ratio,
                avg_latency_ms,
                max_latency_ms: state.max_latency_ms,
                topic_heatmap,
                node_count: state.node_count,
                connected_nodes: state.connected_nodes,
                average_battery: state.average_battery,
                uptime_seconds: duration_to_secs(now.saturating_duration_since(self.start_time)),
            }
        })
    }
}

impl MetricsSink for MetricsCollector {
    fn record_topic_message(&self, topic: &str) {
        self.state.lock(|state| {
            *state.borrow_mut().topic_messages.entry(topic.to_string()).or_insert(0) += 1;
        });
    }

    fn record_delivery_attempt(&self, success: bool) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.delivery_attempts += 1;
            if success {
                state.delivery_successes += 1;
            }
        });
    }

    fn record_latency(&self, latency_ms: f64) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.latency_sum_ms += latency_ms;
            state.latency_samples += 1;
            state.max_latency_ms = state.max_latency_ms.max(latency_ms);
        });
    }
}
