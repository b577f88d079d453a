//! Per-node asynchronous task.
//!
//! Each node runs an independent task that:
//! - Connects the node and restores its subscriptions
//! - Ticks the node under its lock, then sleeps outside it until the next tick
//! - Stops as soon as the handle's stop signal fires, even mid-backoff

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use std::sync::Arc;

use super::node::{HaltReason, Node, NodeError, NodeState, TickOutcome};
use super::types::MAX_NODE_COUNT;

/// Wait after a tick that returned an unexpected error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shared handle to a running node.
///
/// The node task, the failover manager and control queries all go through
/// the async mutex; only one of them touches the node at a time.
pub struct NodeHandle {
    node_id: String,
    node: Mutex<CriticalSectionRawMutex, Node>,
    stop: Signal<CriticalSectionRawMutex, ()>,
}

impl NodeHandle {
    pub fn new(node: Node) -> Arc<Self> {
        Arc::new(Self {
            node_id: node.node_id().to_string(),
            node: Mutex::new(node),
            stop: Signal::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, CriticalSectionRawMutex, Node> {
        self.node.lock().await
    }

    /// Ask the node task to shut the node down.
    pub fn stop(&self) {
        self.stop.signal(());
    }

    pub async fn state(&self) -> NodeState {
        self.node.lock().await.state()
    }
}

/// Drive a node until it halts or is stopped.
pub async fn run_node(handle: &NodeHandle) {
    handle.node.lock().await.start().await;

    loop {
        let outcome = {
            let mut node = handle.node.lock().await;
            node.tick(Instant::now()).await
        };
        let wait = match outcome {
            Ok(TickOutcome::Continue(wait)) => wait,
            Ok(TickOutcome::Halted) | Err(NodeError::Halted(_)) => return,
            Err(err) => {
                log::warn!("[{}] Tick failed: {}", handle.node_id, err);
                ERROR_BACKOFF
            }
        };

        if let Either::First(()) = select(handle.stop.wait(), Timer::after(wait)).await {
            handle.node.lock().await.shutdown(HaltReason::Stopped).await;
            return;
        }
    }
}

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub async fn node_task(handle: Arc<NodeHandle>) {
    run_node(&handle).await;
    log::debug!("[{}] Node task finished", handle.node_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeSpec, SimulationConfig};
    use crate::simulation::metrics::NullMetrics;
    use crate::simulation::mqtt::BrokerNetwork;
    use crate::simulation::node::NodeStatus;
    use crate::simulation::types::{Point, Protocol};
    use futures::executor::block_on;

    fn handle_with(config: SimulationConfig) -> Arc<NodeHandle> {
        let network = Arc::new(BrokerNetwork::new());
        network.add_broker(&config.brokers.primary, config.brokers.primary_position);
        let spec = NodeSpec {
            position: Some(Point::new(500.0, 500.0)),
            sensor_interval_secs: Some(1.0),
            ..NodeSpec::new("n1", Protocol::Wifi, false)
        };
        NodeHandle::new(Node::new(&spec, Arc::new(config), network, Arc::new(NullMetrics), 1))
    }

    fn quiet_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.mqtt.wan_latency_ms = 0;
        config.mqtt.wan_loss = 0.0;
        config
    }

    #[test]
    fn stop_signal_shuts_node_down() {
        let handle = handle_with(quiet_config());
        handle.stop();
        block_on(run_node(&handle));
        let state = block_on(handle.state());
        assert_eq!(state.status, NodeStatus::Halted(HaltReason::Stopped));
        assert!(!state.connected);
        assert_eq!(state.stats.sensor_readings, 1);
    }

    #[test]
    fn loop_ends_when_node_halts_by_itself() {
        let mut config = quiet_config();
        config.energy.capacity_mj = 0.001;
        let handle = handle_with(config);
        block_on(run_node(&handle));
        assert_eq!(block_on(handle.state()).status, NodeStatus::Halted(HaltReason::BatteryDepleted));
    }
}
