//! Simulation orchestration and the control surface.
//!
//! `Simulation` owns the shared pieces (broker network, failover manager,
//! metrics collector) and builds nodes from specs. `network_task` spawns one
//! task per node plus the monitor, metrics and scenario tasks, then serves
//! control commands until the configured duration has elapsed.
//!
//! High-level flow:
//! 1) Build brokers and the initial nodes from configuration.
//! 2) Spawn node tasks, the broker monitor and any scripted events.
//! 3) `select` waits for either a control command or the end deadline.
//! 4) At the end every node is stopped and a summary is handed back.

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{NodeSpec, SimulationConfig};
use crate::time_driver;

use super::failover::{BrokerFailoverManager, FailoverOutcome, FailoverReport, RelocationReport};
use super::metrics::{MetricsCollector, MetricsSink, MetricsSummary};
use super::mqtt::{BrokerNetwork, BrokerStats};
use super::node::{HaltReason, Node, NodeState};
use super::node_task::{NodeHandle, node_task};
use super::types::{ControlQueueReceiver, MAX_NODE_COUNT, Protocol, secs_to_duration};

/// Commands accepted by the running simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    AddNode(NodeSpec),
    RemoveNode(String),
    TriggerFailover,
    ManualFailover,
    RelocateBroker { offset: Option<(f64, f64)> },
    SetSpeed(u32),
    QueryNode(String),
    /// `None` picks the recommended PHY for the node's current link.
    SwitchProtocol { node_id: String, protocol: Option<Protocol> },
    LogSummary,
}

pub enum CommandResponse {
    NodeAdded(Arc<NodeHandle>),
    NodeRemoved(String),
    Failover(FailoverOutcome),
    /// `None` when another transition was running.
    Relocation(Option<RelocationReport>),
    SpeedSet(u32),
    NodeState(Option<NodeState>),
    ProtocolSwitched { node_id: String, protocol: Protocol, changed: bool },
    Summary(SimulationSummary),
    Rejected(String),
}

/// Parse one line of the text control protocol.
///
/// ```text
/// add <node_id> <ble|wifi> [mobile]
/// remove <node_id>
/// failover            manual failover (primary taken down)
/// trigger             failover without touching the primary
/// relocate [dx dy]
/// speed <percent>
/// query <node_id>
/// switch <node_id> <ble|wifi|auto>
/// summary
/// ```
pub fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["add", node_id, protocol, rest @ ..] => {
            let protocol = parse_protocol(protocol)?;
            let is_mobile = match rest {
                [] => false,
                ["mobile"] => true,
                _ => return Err("Usage: add <node_id> <ble|wifi> [mobile]".to_string()),
            };
            Ok(ControlCommand::AddNode(NodeSpec::new(*node_id, protocol, is_mobile)))
        }
        ["remove", node_id] => Ok(ControlCommand::RemoveNode(node_id.to_string())),
        ["failover"] => Ok(ControlCommand::ManualFailover),
        ["trigger"] => Ok(ControlCommand::TriggerFailover),
        ["relocate"] => Ok(ControlCommand::RelocateBroker { offset: None }),
        ["relocate", dx, dy] => {
            let dx = dx.parse::<f64>().map_err(|e| format!("Invalid offset {dx}: {e}"))?;
            let dy = dy.parse::<f64>().map_err(|e| format!("Invalid offset {dy}: {e}"))?;
            Ok(ControlCommand::RelocateBroker { offset: Some((dx, dy)) })
        }
        ["speed", percent] => percent
            .parse::<u32>()
            .map(ControlCommand::SetSpeed)
            .map_err(|e| format!("Invalid speed {percent}: {e}")),
        ["query", node_id] => Ok(ControlCommand::QueryNode(node_id.to_string())),
        ["switch", node_id, protocol] => {
            let protocol = if protocol.eq_ignore_ascii_case("auto") { None } else { Some(parse_protocol(protocol)?) };
            Ok(ControlCommand::SwitchProtocol {
                node_id: node_id.to_string(),
                protocol,
            })
        }
        ["summary"] => Ok(ControlCommand::LogSummary),
        [] => Err("Empty command".to_string()),
        _ => Err(format!("Unknown command: {}", line.trim())),
    }
}

fn parse_protocol(word: &str) -> Result<Protocol, String> {
    match word.to_ascii_lowercase().as_str() {
        "ble" => Ok(Protocol::Ble),
        "wifi" => Ok(Protocol::Wifi),
        other => Err(format!("Unknown protocol: {other}")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub metrics: MetricsSummary,
    pub failover: FailoverReport,
    pub brokers: BTreeMap<String, BrokerStats>,
    pub nodes: Vec<NodeState>,
}

/// Signal carrying the final summary out of the executor.
pub type SummarySignal = Signal<CriticalSectionRawMutex, SimulationSummary>;

pub struct Simulation {
    config: Arc<SimulationConfig>,
    brokers: Arc<BrokerNetwork>,
    failover: Arc<BrokerFailoverManager>,
    metrics: Arc<MetricsCollector>,
    rng: StdRng,
    seed: u64,
    nodes_built: u64,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        let brokers = Arc::new(BrokerNetwork::new());
        brokers.add_broker(&config.brokers.primary, config.brokers.primary_position);
        brokers.add_broker(&config.brokers.failover, config.brokers.failover_position);
        let failover = Arc::new(BrokerFailoverManager::new(brokers.clone(), &config.brokers, &config.failover, config.area, seed));
        log::info!(
            "Simulation ready: area {}x{}m, brokers {} / {}, seed {}",
            config.area.width,
            config.area.height,
            config.brokers.primary,
            config.brokers.failover,
            seed
        );
        Self {
            config: Arc::new(config),
            brokers,
            failover,
            metrics: Arc::new(MetricsCollector::new(Instant::now())),
            rng: StdRng::seed_from_u64(seed),
            seed,
            nodes_built: 0,
        }
    }

    pub fn config(&self) -> &Arc<SimulationConfig> {
        &self.config
    }

    pub fn brokers(&self) -> &Arc<BrokerNetwork> {
        &self.brokers
    }

    pub fn failover(&self) -> &Arc<BrokerFailoverManager> {
        &self.failover
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Build a node, register it for failover and return its handle. The
    /// caller runs it.
    pub fn add_node(&mut self, spec: &NodeSpec) -> Result<Arc<NodeHandle>, String> {
        if spec.node_id.trim().is_empty() {
            return Err("Node id must not be empty".to_string());
        }
        if self.failover.find_node(&spec.node_id).is_some() {
            return Err(format!("Duplicate node_id found: {}", spec.node_id));
        }
        if self.failover.snapshot().len() >= MAX_NODE_COUNT {
            return Err(format!("Node limit of {MAX_NODE_COUNT} reached"));
        }
        if let Some(broker) = &spec.broker {
            if self.brokers.position(broker).is_none() {
                return Err(format!("Node {} references unknown broker {}", spec.node_id, broker));
            }
        }
        if let Some(position) = spec.position {
            if !self.config.area.contains(&position) {
                return Err(format!("Node {} position {} outside the simulation area", spec.node_id, position));
            }
        }

        let mut spec = spec.clone();
        // Late joiners attach to whichever broker is serving now
        let broker = spec.broker.get_or_insert_with(|| self.failover.current_broker()).clone();
        let anchor = self.brokers.position(&broker).unwrap_or_else(|| self.config.area.center());
        let resolved = self.config.resolve_node(&spec, anchor, &mut self.rng);
        self.nodes_built += 1;
        let seed = self.seed.wrapping_add(self.nodes_built.wrapping_mul(7919));
        let metrics: Arc<dyn MetricsSink> = self.metrics.clone();
        let node = Node::new(&resolved, self.config.clone(), self.brokers.clone(), metrics, seed);
        log::info!(
            "[{}] Added {} node at {} ({})",
            resolved.node_id,
            resolved.protocol,
            node.position(),
            if resolved.is_mobile { "mobile" } else { "stationary" }
        );

        let handle = NodeHandle::new(node);
        self.failover.register_node(handle.clone());
        Ok(handle)
    }

    /// Stop a node and forget it. Returns false for unknown ids.
    pub async fn remove_node(&self, node_id: &str) -> bool {
        let Some(handle) = self.failover.find_node(node_id) else {
            return false;
        };
        self.failover.unregister_node(node_id);
        handle.stop();
        handle.lock().await.shutdown(HaltReason::Stopped).await;
        log::info!("[{}] Removed", node_id);
        true
    }

    pub async fn query_node(&self, node_id: &str) -> Option<NodeState> {
        let handle = self.failover.find_node(node_id)?;
        Some(handle.state().await)
    }

    /// Move a node to another PHY, or to the recommended one when `protocol`
    /// is `None`. Returns the protocol in use afterwards and whether it changed.
    pub async fn switch_protocol(&self, node_id: &str, protocol: Option<Protocol>) -> Option<(Protocol, bool)> {
        let handle = self.failover.find_node(node_id)?;
        let mut node = handle.lock().await;
        if node.is_halted() {
            return None;
        }
        let target = protocol.unwrap_or_else(|| node.select_best_phy(node.distance_to_broker(), 0.0));
        let changed = node.switch_protocol(target, Instant::now());
        Some((target, changed))
    }

    pub async fn node_states(&self) -> Vec<NodeState> {
        let mut states = Vec::new();
        for handle in self.failover.snapshot() {
            states.push(handle.state().await);
        }
        states
    }

    /// Stop every node; used at the end of a run.
    pub async fn stop_all(&self) {
        for handle in self.failover.snapshot() {
            handle.stop();
            handle.lock().await.shutdown(HaltReason::Stopped).await;
        }
    }

    pub async fn summary(&self) -> SimulationSummary {
        let nodes = self.node_states().await;
        self.metrics.collect(&nodes);
        let brokers = [&self.config.brokers.primary, &self.config.brokers.failover]
            .into_iter()
            .filter_map(|address| self.brokers.stats(address).map(|stats| (address.clone(), stats)))
            .collect();
        SimulationSummary {
            metrics: self.metrics.summary(Instant::now()),
            failover: self.failover.stats(),
            brokers,
            nodes,
        }
    }

    pub async fn handle_command(&mut self, command: ControlCommand) -> CommandResponse {
        match command {
            ControlCommand::AddNode(spec) => match self.add_node(&spec) {
                Ok(handle) => CommandResponse::NodeAdded(handle),
                Err(err) => CommandResponse::Rejected(err),
            },
            ControlCommand::RemoveNode(node_id) => {
                if self.remove_node(&node_id).await {
                    CommandResponse::NodeRemoved(node_id)
                } else {
                    CommandResponse::Rejected(format!("Unknown node: {node_id}"))
                }
            }
            ControlCommand::TriggerFailover => CommandResponse::Failover(self.failover.trigger_failover().await),
            ControlCommand::ManualFailover => CommandResponse::Failover(self.failover.manual_failover().await),
            ControlCommand::RelocateBroker { offset } => CommandResponse::Relocation(self.failover.relocate_broker(offset).await),
            ControlCommand::SetSpeed(percent) => {
                time_driver::set_simulation_speed_percent(percent);
                CommandResponse::SpeedSet(time_driver::get_simulation_speed_percent())
            }
            ControlCommand::QueryNode(node_id) => CommandResponse::NodeState(self.query_node(&node_id).await),
            ControlCommand::SwitchProtocol { node_id, protocol } => match self.switch_protocol(&node_id, protocol).await {
                Some((protocol, changed)) => CommandResponse::ProtocolSwitched { node_id, protocol, changed },
                None => CommandResponse::Rejected(format!("No running node: {node_id}")),
            },
            ControlCommand::LogSummary => CommandResponse::Summary(self.summary().await),
        }
    }
}

/// Start the task of a registered node through `spawn`. A node whose task
/// cannot start is unregistered again, so nothing counts a node that never runs.
fn start_node<E: fmt::Debug>(failover: &BrokerFailoverManager, handle: Arc<NodeHandle>, spawn: impl FnOnce(Arc<NodeHandle>) -> Result<(), E>) -> bool {
    let node_id = handle.node_id().to_string();
    log::debug!("[{}] Spawning node task", node_id);
    match spawn(handle) {
        Ok(()) => true,
        Err(err) => {
            log::error!("[{}] Failed to spawn node task: {:?}", node_id, err);
            failover.unregister_node(&node_id);
            false
        }
    }
}

fn log_response(response: &CommandResponse) {
    match response {
        CommandResponse::NodeAdded(handle) => log::info!("Node {} added", handle.node_id()),
        CommandResponse::NodeRemoved(node_id) => log::info!("Node {} removed", node_id),
        CommandResponse::Failover(outcome) => log::info!("Failover: {:?}", outcome),
        CommandResponse::Relocation(Some(report)) => log::info!("Relocation: {} -> {}", report.old_position, report.new_position),
        CommandResponse::Relocation(None) => log::info!("Relocation skipped, another transition is running"),
        CommandResponse::SpeedSet(percent) => log::info!("Simulation speed set to {}%", percent),
        CommandResponse::NodeState(Some(state)) => match serde_json::to_string(state) {
            Ok(json) => log::info!("{}", json),
            Err(err) => log::warn!("Could not serialize node state: {}", err),
        },
        CommandResponse::NodeState(None) => log::warn!("No such node"),
        CommandResponse::ProtocolSwitched { node_id, protocol, changed: true } => log::info!("Node {} now uses {}", node_id, protocol),
        CommandResponse::ProtocolSwitched { node_id, protocol, changed: false } => log::info!("Node {} already uses {}", node_id, protocol),
        CommandResponse::Summary(summary) => log_metrics(&summary.metrics),
        CommandResponse::Rejected(reason) => log::warn!("Command rejected: {}", reason),
    }
}

fn log_metrics(metrics: &MetricsSummary) {
    log::info!(
        "Metrics: {} sent, {} received, {} duplicates, delivery {:.1}%, latency {:.1}ms avg, {}/{} nodes connected, battery {:.1}% avg",
        metrics.total_messages_sent,
        metrics.total_messages_received,
        metrics.total_duplicates,
        metrics.delivery_ratio * 100.0,
        metrics.avg_latency_ms,
        metrics.connected_nodes,
        metrics.node_count,
        metrics.average_battery
    );
}

#[derive(Debug, Clone, Copy)]
enum ScenarioEvent {
    Failover,
    Relocation,
}

#[embassy_executor::task]
async fn monitor_task(failover: Arc<BrokerFailoverManager>) {
    failover.monitor_brokers().await;
}

#[embassy_executor::task(pool_size = 2)]
async fn scenario_task(failover: Arc<BrokerFailoverManager>, delay: Duration, event: ScenarioEvent) {
    Timer::after(delay).await;
    log::info!("Scripted event: {:?}", event);
    match event {
        ScenarioEvent::Failover => {
            failover.manual_failover().await;
        }
        ScenarioEvent::Relocation => {
            failover.relocate_broker(None).await;
        }
    }
}

#[embassy_executor::task]
async fn metrics_task(failover: Arc<BrokerFailoverManager>, metrics: Arc<MetricsCollector>, interval: Duration) {
    loop {
        Timer::after(interval).await;
        let mut states = Vec::new();
        for handle in failover.snapshot() {
            states.push(handle.state().await);
        }
        metrics.collect(&states);
        log_metrics(&metrics.summary(Instant::now()));
    }
}

/// Run the whole simulation and signal the final summary on `done`.
#[embassy_executor::task]
pub async fn network_task(spawner: Spawner, config: SimulationConfig, control_rx: ControlQueueReceiver, done: &'static SummarySignal) {
    time_driver::set_simulation_speed_percent(config.speed_percent);
    let mut simulation = Simulation::new(config);
    let config = simulation.config().clone();

    for spec in config.initial_nodes() {
        match simulation.add_node(&spec) {
            Ok(handle) => {
                start_node(simulation.failover(), handle, |handle| spawner.spawn(node_task(handle)));
            }
            Err(err) => log::error!("Skipping node {}: {}", spec.node_id, err),
        }
    }

    if let Err(err) = spawner.spawn(monitor_task(simulation.failover().clone())) {
        log::error!("Failed to spawn broker monitor: {:?}", err);
    }
    if let Some(interval) = config.scenario.metrics_interval_secs {
        if let Err(err) = spawner.spawn(metrics_task(simulation.failover().clone(), simulation.metrics().clone(), secs_to_duration(interval))) {
            log::error!("Failed to spawn metrics reporter: {:?}", err);
        }
    }
    let scripted = [
        (config.scenario.failover_at_secs, ScenarioEvent::Failover),
        (config.scenario.relocation_at_secs, ScenarioEvent::Relocation),
    ];
    for (at, event) in scripted {
        if let Some(at) = at {
            if let Err(err) = spawner.spawn(scenario_task(simulation.failover().clone(), secs_to_duration(at), event)) {
                log::error!("Failed to schedule {:?}: {:?}", event, err);
            }
        }
    }

    let end = Instant::now() + Duration::from_secs(config.duration_secs);
    loop {
        match select(control_rx.receive(), Timer::at(end)).await {
            Either::First(command) => {
                let mut response = simulation.handle_command(command).await;
                let added = match &response {
                    CommandResponse::NodeAdded(handle) => Some(handle.clone()),
                    _ => None,
                };
                if let Some(handle) = added {
                    let node_id = handle.node_id().to_string();
                    if !start_node(simulation.failover(), handle, |handle| spawner.spawn(node_task(handle))) {
                        response = CommandResponse::Rejected(format!("No task slot left for node {node_id}"));
                    }
                }
                log_response(&response);
            }
            Either::Second(()) => break,
        }
    }

    log::info!("Simulation finished after {}s", config.duration_secs);
    simulation.stop_all().await;
    let summary = simulation.summary().await;
    log_metrics(&summary.metrics);
    done.signal(summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::node::NodeStatus;
    use crate::simulation::types::Point;
    use futures::executor::block_on;

    fn simulation() -> Simulation {
        let mut config = SimulationConfig::default();
        config.seed = Some(42);
        config.mqtt.wan_latency_ms = 0;
        config.mqtt.wan_loss = 0.0;
        Simulation::new(config)
    }

    #[test]
    fn node_without_task_slot_is_unregistered() {
        let mut simulation = simulation();
        let handle = simulation.add_node(&NodeSpec::new("n1", Protocol::Wifi, false)).unwrap();
        assert!(!start_node(simulation.failover(), handle, |_| Err("pool exhausted")));
        assert!(simulation.failover().find_node("n1").is_none());
        assert_eq!(simulation.failover().stats().nodes_registered, 0);

        // The id is free again once a slot opens
        let handle = simulation.add_node(&NodeSpec::new("n1", Protocol::Wifi, false)).unwrap();
        assert!(start_node(simulation.failover(), handle, |_| Ok::<(), &str>(())));
        assert!(simulation.failover().find_node("n1").is_some());
    }

    #[test]
    fn parses_text_commands() {
        assert_eq!(parse_command("add n9 ble mobile"), Ok(ControlCommand::AddNode(NodeSpec::new("n9", Protocol::Ble, true))));
        assert_eq!(parse_command("add n9 WiFi"), Ok(ControlCommand::AddNode(NodeSpec::new("n9", Protocol::Wifi, false))));
        assert_eq!(parse_command("  remove n1 "), Ok(ControlCommand::RemoveNode("n1".to_string())));
        assert_eq!(parse_command("failover"), Ok(ControlCommand::ManualFailover));
        assert_eq!(parse_command("trigger"), Ok(ControlCommand::TriggerFailover));
        assert_eq!(parse_command("relocate 10 -5.5"), Ok(ControlCommand::RelocateBroker { offset: Some((10.0, -5.5)) }));
        assert_eq!(parse_command("relocate"), Ok(ControlCommand::RelocateBroker { offset: None }));
        assert_eq!(parse_command("speed 250"), Ok(ControlCommand::SetSpeed(250)));
        assert_eq!(parse_command("query n1"), Ok(ControlCommand::QueryNode("n1".to_string())));
        assert_eq!(parse_command("summary"), Ok(ControlCommand::LogSummary));
        assert_eq!(
            parse_command("switch n1 auto"),
            Ok(ControlCommand::SwitchProtocol {
                node_id: "n1".to_string(),
                protocol: None
            })
        );
        assert_eq!(
            parse_command("switch n1 BLE"),
            Ok(ControlCommand::SwitchProtocol {
                node_id: "n1".to_string(),
                protocol: Some(Protocol::Ble)
            })
        );

        assert!(parse_command("").is_err());
        assert!(parse_command("add n1 lora").is_err());
        assert!(parse_command("speed fast").is_err());
        assert!(parse_command("relocate 1").is_err());
    }

    #[test]
    fn add_node_rejects_duplicates_and_bad_positions() {
        let mut simulation = simulation();
        assert!(simulation.add_node(&NodeSpec::new("a", Protocol::Ble, false)).is_ok());
        let err = simulation.add_node(&NodeSpec::new("a", Protocol::Wifi, false)).err().unwrap();
        assert!(err.contains("Duplicate"));

        let outside = NodeSpec {
            position: Some(Point::new(-1.0, 10.0)),
            ..NodeSpec::new("b", Protocol::Wifi, false)
        };
        assert!(simulation.add_node(&outside).is_err());

        let unknown_broker = NodeSpec {
            broker: Some("elsewhere:1883".to_string()),
            ..NodeSpec::new("c", Protocol::Wifi, false)
        };
        assert!(simulation.add_node(&unknown_broker).is_err());
        assert_eq!(simulation.failover().snapshot().len(), 1);
    }

    #[test]
    fn commands_query_and_remove_nodes() {
        let mut simulation = simulation();
        let spec = NodeSpec {
            position: Some(Point::new(500.0, 500.0)),
            ..NodeSpec::new("n1", Protocol::Wifi, false)
        };
        let response = block_on(simulation.handle_command(ControlCommand::AddNode(spec)));
        let CommandResponse::NodeAdded(handle) = response else {
            panic!("node not added");
        };
        assert!(block_on(async { handle.lock().await.start().await }));

        let CommandResponse::NodeState(Some(state)) = block_on(simulation.handle_command(ControlCommand::QueryNode("n1".to_string()))) else {
            panic!("node not found");
        };
        assert!(state.connected);
        assert_eq!(state.distance_to_broker, 0.0);

        assert!(matches!(
            block_on(simulation.handle_command(ControlCommand::RemoveNode("n1".to_string()))),
            CommandResponse::NodeRemoved(_)
        ));
        assert_eq!(block_on(handle.state()).status, NodeStatus::Halted(HaltReason::Stopped));
        assert!(matches!(
            block_on(simulation.handle_command(ControlCommand::QueryNode("n1".to_string()))),
            CommandResponse::NodeState(None)
        ));
        assert!(matches!(
            block_on(simulation.handle_command(ControlCommand::RemoveNode("n1".to_string()))),
            CommandResponse::Rejected(_)
        ));
    }

    #[test]
    fn switch_command_follows_recommendation() {
        let mut simulation = simulation();
        // 10 m from the broker: BLE is recommended
        let spec = NodeSpec {
            position: Some(Point::new(510.0, 500.0)),
            ..NodeSpec::new("n1", Protocol::Wifi, false)
        };
        simulation.add_node(&spec).unwrap();

        let command = parse_command("switch n1 auto").unwrap();
        assert!(matches!(
            block_on(simulation.handle_command(command)),
            CommandResponse::ProtocolSwitched {
                protocol: Protocol::Ble,
                changed: true,
                ..
            }
        ));
        let command = parse_command("switch n1 ble").unwrap();
        assert!(matches!(
            block_on(simulation.handle_command(command)),
            CommandResponse::ProtocolSwitched { changed: false, .. }
        ));
        assert_eq!(block_on(simulation.query_node("n1")).unwrap().protocol, Protocol::Ble);
        let command = parse_command("switch ghost wifi").unwrap();
        assert!(matches!(block_on(simulation.handle_command(command)), CommandResponse::Rejected(_)));
    }

    #[test]
    fn nodes_added_after_failover_join_the_serving_broker() {
        let mut simulation = simulation();
        let outcome = block_on(simulation.failover().manual_failover());
        assert!(matches!(outcome, FailoverOutcome::Completed { .. }));
        let handle = simulation.add_node(&NodeSpec::new("late", Protocol::Ble, false)).unwrap();
        let state = block_on(handle.state());
        assert_eq!(state.broker, simulation.config().brokers.failover);
        assert!(state.distance_to_broker <= state.max_range);
    }

    #[test]
    fn summary_covers_nodes_and_brokers() {
        let mut simulation = simulation();
        for id in ["a", "b"] {
            let spec = NodeSpec {
                position: Some(Point::new(500.0, 500.0)),
                ..NodeSpec::new(id, Protocol::Wifi, false)
            };
            let handle = simulation.add_node(&spec).unwrap();
            block_on(async { handle.lock().await.start().await });
        }
        let summary = block_on(simulation.summary());
        assert_eq!(summary.nodes.len(), 2);
        assert_eq!(summary.metrics.node_count, 2);
        assert_eq!(summary.metrics.connected_nodes, 2);
        assert_eq!(summary.brokers.len(), 2);
        assert_eq!(summary.brokers[&simulation.config().brokers.primary].connected_clients, 2);
        assert!(serde_json::to_string(&summary).is_ok());
    }
}
