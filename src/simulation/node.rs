//! A simulated IoT device.
//!
//! Contains:
//! - `Node`: one MAC, one MQTT client, one energy tracker and an optional
//!   position source, advanced one tick at a time
//! - `NodeState`: serializable snapshot used by queries and metrics
//! - `NodeStatus` / `HaltReason`: lifecycle of a node
//!
//! A tick runs mobility, range supervision, link upkeep, inbound delivery,
//! keep-alive and retransmit servicing, reconnection, sensor sampling and
//! draining the MAC send queue, in that order. Waiting between ticks is the caller's business (see
//! `node_task`), so the node never sleeps while holding its own lock except
//! for the link and WAN delays of the work itself.

use embassy_time::{Duration, Instant};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::{NodeSpec, SimulationConfig};

use super::energy::{EnergyStats, EnergyTracker, RadioState};
use super::mac::{Mac, MacStats};
use super::metrics::MetricsSink;
use super::mobility::{PositionSource, RandomWaypoint};
use super::mqtt::{BrokerNetwork, MqttClient, MqttStats, ReconnectOutcome};
use super::signal_calculations::{calculate_expected_retries, calculate_pdr, calculate_rssi};
use super::types::{Point, Protocol, QoS, Role, duration_to_secs, secs_to_duration};

/// Sensor interval used when a spec reaches the node unresolved.
const FALLBACK_SENSOR_INTERVAL_SECS: f64 = 10.0;
/// Battery level under which low-rate traffic prefers BLE.
const LOW_BATTERY_PERCENT: f64 = 20.0;
/// Data rate above which only WiFi will do (bits per second).
const HIGH_DATA_RATE_BPS: f64 = 1_000_000.0;
const LONG_DISTANCE_METERS: f64 = 50.0;
const SHORT_DISTANCE_METERS: f64 = 30.0;
/// Queued packets sent per tick.
const DRAIN_BUDGET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    BatteryDepleted,
    OutOfRange,
    Stopped,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::BatteryDepleted => write!(f, "battery_depleted"),
            HaltReason::OutOfRange => write!(f, "out_of_range"),
            HaltReason::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    /// Reconnect attempts are spent; waits for a failover or manual reset.
    Stranded,
    /// Terminal.
    Halted(HaltReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    Halted(HaltReason),
    UnknownBroker(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Halted(reason) => write!(f, "node halted ({reason})"),
            NodeError::UnknownBroker(address) => write!(f, "unknown broker {address}"),
        }
    }
}

impl std::error::Error for NodeError {}

/// What the node loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Run again after this long.
    Continue(Duration),
    /// The node shut down during the tick.
    Halted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub sensor_readings: u64,
    pub position_updates: u64,
    pub mac_drops: u64,
    pub publish_failures: u64,
    pub protocol_switches: u64,
}

/// Estimated quality of the link to the broker at the current distance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LinkQuality {
    pub pdr: f64,
    pub rssi_dbm: f64,
    pub expected_retries: f64,
}

/// Snapshot of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub node_id: String,
    pub protocol: Protocol,
    pub is_mobile: bool,
    pub connected: bool,
    pub battery: f64,
    pub position: Point,
    pub role: Role,
    pub qos: QoS,
    pub sensor_interval_secs: f64,
    pub distance_to_broker: f64,
    pub max_range: f64,
    pub link: LinkQuality,
    pub broker: String,
    pub status: NodeStatus,
    pub mac_stats: MacStats,
    pub mqtt_stats: MqttStats,
    pub energy_stats: EnergyStats,
    pub stats: NodeStats,
}

pub struct Node {
    node_id: String,
    spec: NodeSpec,
    config: Arc<SimulationConfig>,
    qos: QoS,
    mac: Mac,
    mqtt: MqttClient,
    energy: EnergyTracker,
    mobility: Option<Box<dyn PositionSource + Send>>,
    position: Point,
    brokers: Arc<BrokerNetwork>,
    metrics: Arc<dyn MetricsSink>,
    status: NodeStatus,
    stats: NodeStats,
    sensor_interval: Duration,
    next_sensor_reading: Instant,
    last_tick: Instant,
    reconnect_due: Option<Instant>,
    out_of_range_since: Option<Instant>,
    tick: Duration,
    seed: u64,
    rng: StdRng,
}

impl Node {
    /// Build a node from a (normally resolved) spec.
    ///
    /// Missing position falls back to the area center, missing interval to
    /// 10 s, missing QoS to the MQTT default and missing broker to the
    /// primary. Mobile nodes get a random-waypoint source unless one is
    /// injected with `with_mobility`.
    pub fn new(spec: &NodeSpec, config: Arc<SimulationConfig>, brokers: Arc<BrokerNetwork>, metrics: Arc<dyn MetricsSink>, seed: u64) -> Self {
        let now = Instant::now();
        let position = config.area.clamp(spec.position.unwrap_or_else(|| config.area.center()));
        let qos = spec.qos.unwrap_or(config.mqtt.default_qos);
        let broker = spec.broker.clone().unwrap_or_else(|| config.brokers.primary.clone());
        let sensor_interval = secs_to_duration(spec.sensor_interval_secs.unwrap_or(FALLBACK_SENSOR_INTERVAL_SECS));

        let mut spec = spec.clone();
        spec.position = Some(position);
        spec.qos = Some(qos);
        spec.broker = Some(broker.clone());
        spec.sensor_interval_secs = Some(duration_to_secs(sensor_interval));

        let mac = Mac::new(&spec.node_id, spec.protocol, &config, seed);
        let mqtt = MqttClient::new(&spec.node_id, &broker, brokers.clone(), &config.mqtt, seed.wrapping_add(1));
        let energy = EnergyTracker::new(config.profile(spec.protocol), &config.energy, now);
        let mobility: Option<Box<dyn PositionSource + Send>> = if spec.is_mobile {
            Some(Box::new(RandomWaypoint::new(config.area, position, seed.wrapping_add(2))))
        } else {
            None
        };

        Self {
            node_id: spec.node_id.clone(),
            tick: Duration::from_millis(config.tick_ms),
            spec,
            config,
            qos,
            mac,
            mqtt,
            energy,
            mobility,
            position,
            brokers,
            metrics,
            status: NodeStatus::Running,
            stats: NodeStats::default(),
            sensor_interval,
            next_sensor_reading: now,
            last_tick: now,
            reconnect_due: None,
            out_of_range_since: None,
            seed,
            rng: StdRng::seed_from_u64(seed.wrapping_add(3)),
        }
    }

    /// Replace the position source (recorded traces, scripted paths).
    pub fn with_mobility(mut self, source: Box<dyn PositionSource + Send>) -> Self {
        self.position = source.position();
        self.spec.is_mobile = true;
        self.mobility = Some(source);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn protocol(&self) -> Protocol {
        self.mac.protocol()
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.status, NodeStatus::Halted(_))
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt.is_connected()
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn broker_address(&self) -> &str {
        self.mqtt.broker_address()
    }

    pub fn battery_level(&self) -> f64 {
        self.energy.battery_level()
    }

    pub fn mqtt(&self) -> &MqttClient {
        &self.mqtt
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Distance to the broker the client points at; infinite when the
    /// broker is unknown.
    pub fn distance_to_broker(&self) -> f64 {
        self.brokers
            .position(self.mqtt.broker_address())
            .map(|broker| self.position.distance_to(&broker))
            .unwrap_or(f64::INFINITY)
    }

    pub fn max_range(&self) -> f64 {
        self.config.profile(self.protocol()).range_meters
    }

    pub fn link_quality(&self) -> LinkQuality {
        let protocol = self.protocol();
        let distance = self.distance_to_broker();
        let pdr = calculate_pdr(distance, self.max_range(), protocol);
        let retry_limit = match protocol {
            Protocol::Ble => self.config.ble_mac.retry_limit,
            Protocol::Wifi => self.config.wifi_mac.retry_limit,
        };
        LinkQuality {
            pdr,
            rssi_dbm: calculate_rssi(distance, protocol),
            expected_retries: calculate_expected_retries(pdr, retry_limit),
        }
    }

    fn resting_state(&self) -> RadioState {
        match self.protocol() {
            Protocol::Ble => RadioState::Sleep,
            Protocol::Wifi => RadioState::Idle,
        }
    }

    /// Radio state while the MAC waits for channel access.
    fn waiting_state(&self) -> RadioState {
        match self.protocol() {
            Protocol::Ble => RadioState::Sleep,
            Protocol::Wifi => RadioState::Rx,
        }
    }

    /// Configure the client and bring the node online.
    ///
    /// A failed first connect is not fatal: the tick loop keeps retrying
    /// with backoff.
    pub async fn start(&mut self) -> bool {
        self.mqtt.set_wan(self.config.mqtt.wan_latency_ms, self.config.mqtt.wan_loss);
        let node_id = self.node_id.clone();
        self.mqtt.set_on_message(Box::new(move |message| {
            if message.topic.ends_with("/command") {
                log::info!("[{}] Command received: {}", node_id, message.payload_str());
            }
        }));

        let now = Instant::now();
        self.last_tick = now;
        if self.mqtt.connect().await {
            self.restore_subscriptions().await;
            true
        } else {
            log::warn!("[{}] Initial connect to {} failed", self.node_id, self.mqtt.broker_address());
            self.reconnect_due = self.mqtt.next_reconnect_delay().map(|delay| now + delay);
            false
        }
    }

    /// Subscribe to every filter the role asks for. Returns how many
    /// subscriptions the broker accepted.
    pub async fn restore_subscriptions(&mut self) -> usize {
        let mut accepted = 0;
        for filter in self.spec.subscription_filters() {
            if self.mqtt.subscribe(&filter, self.qos).await {
                accepted += 1;
            }
        }
        if accepted > 0 {
            log::debug!("[{}] {} subscriptions active", self.node_id, accepted);
        }
        accepted
    }

    /// Advance the node by one tick.
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome, NodeError> {
        if let NodeStatus::Halted(reason) = self.status {
            return Err(NodeError::Halted(reason));
        }

        self.update_position(now);
        let distance = self.distance_to_broker();
        let max_range = self.max_range();

        if self.supervise_range(now, distance, max_range) {
            self.shutdown(HaltReason::OutOfRange).await;
            return Ok(TickOutcome::Halted);
        }
        if self.mac.idle_maintenance(now, distance, max_range) {
            log::debug!("[{}] Link lost while idle ({:.1}m from broker)", self.node_id, distance);
        }

        self.receive_messages(now);

        if self.mqtt.is_connected() {
            self.mqtt.send_ping(now).await;
            if self.mqtt.check_connection(now) {
                self.mqtt.service_retransmits(now).await;
            }
        } else if self.status == NodeStatus::Running && distance <= max_range {
            self.reconnect_step(now).await;
        }

        if self.spec.role.publishes() && now >= self.next_sensor_reading {
            self.generate_sensor_data(now);
        }
        self.drain_send_queue(distance, max_range).await;

        self.energy.set_state(self.resting_state(), Instant::now());
        if self.energy.is_depleted() {
            log::error!("[{}] Battery depleted", self.node_id);
            self.shutdown(HaltReason::BatteryDepleted).await;
            return Ok(TickOutcome::Halted);
        }

        Ok(TickOutcome::Continue(self.next_wait()))
    }

    fn update_position(&mut self, now: Instant) {
        let dt_secs = duration_to_secs(now.saturating_duration_since(self.last_tick));
        self.last_tick = now;
        let Some(source) = self.mobility.as_mut() else {
            return;
        };
        let next = source.advance(dt_secs);
        if next != self.position {
            self.position = next;
            self.spec.position = Some(next);
            self.stats.position_updates += 1;
        }
    }

    /// Track time spent beyond radio range. Returns true once the node has
    /// been out of range for longer than the configured limit.
    fn supervise_range(&mut self, now: Instant, distance: f64, max_range: f64) -> bool {
        if distance <= max_range {
            if self.out_of_range_since.take().is_some() {
                log::info!("[{}] Back in range ({:.1}m <= {:.0}m)", self.node_id, distance, max_range);
            }
            return false;
        }

        let since = *self.out_of_range_since.get_or_insert_with(|| {
            log::warn!("[{}] Out of range ({:.1}m > {:.0}m)", self.node_id, distance, max_range);
            now
        });
        if self.mqtt.is_connected() {
            self.mqtt.disconnect(true);
        }
        duration_to_secs(now.saturating_duration_since(since)) > self.config.out_of_range_limit_secs
    }

    fn receive_messages(&mut self, now: Instant) {
        for message in self.mqtt.process_inbox() {
            self.energy.add_rx_energy(message.payload.len());
            self.stats.messages_received += 1;
            let latency_ms = now.saturating_duration_since(message.timestamp).as_micros() as f64 / 1000.0;
            self.metrics.record_latency(latency_ms);
        }
    }

    async fn reconnect_step(&mut self, now: Instant) {
        match self.reconnect_due {
            None => match self.mqtt.next_reconnect_delay() {
                Some(delay) => self.reconnect_due = Some(now + delay),
                None => self.strand(),
            },
            Some(due) if now >= due => {
                self.reconnect_due = None;
                match self.mqtt.attempt_reconnect().await {
                    ReconnectOutcome::Connected => {
                        self.restore_subscriptions().await;
                    }
                    ReconnectOutcome::Failed => {}
                    ReconnectOutcome::Exhausted => self.strand(),
                }
            }
            Some(_) => {}
        }
    }

    fn strand(&mut self) {
        if self.status == NodeStatus::Running {
            log::warn!("[{}] Stranded after {} reconnect attempts", self.node_id, self.mqtt.reconnect_attempts());
            self.status = NodeStatus::Stranded;
        }
    }

    fn next_wait(&self) -> Duration {
        match self.reconnect_due {
            Some(due) => self.tick.min(due.saturating_duration_since(Instant::now())),
            None => self.tick,
        }
    }

    fn sample_reading(&mut self, mean: f64, std_dev: f64, low: f64, high: f64) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        (mean + z * std_dev).clamp(low, high)
    }

    /// Take a sensor reading and queue it for the link.
    pub fn generate_sensor_data(&mut self, now: Instant) {
        self.next_sensor_reading = now + self.sensor_interval;
        let temperature = self.sample_reading(25.0, 2.0, 20.0, 30.0);
        let humidity = self.sample_reading(50.0, 5.0, 40.0, 60.0);
        let payload = format!("temp:{temperature:.1},humidity:{humidity:.1}");

        self.metrics.record_topic_message(&self.sensor_topic());
        self.stats.sensor_readings += 1;

        if !self.mac.enqueue(payload.as_bytes()) {
            self.stats.mac_drops += 1;
            self.metrics.record_delivery_attempt(false);
            log::debug!("[{}] Send queue full, sensor reading dropped", self.node_id);
        }
    }

    fn sensor_topic(&self) -> String {
        format!("sensors/{}/data", self.node_id)
    }

    /// Push queued readings over the link and publish the ones that make it.
    /// At most `DRAIN_BUDGET` packets go out per tick; nothing is sent while
    /// the broker is out of range.
    async fn drain_send_queue(&mut self, distance: f64, max_range: f64) {
        if distance > max_range {
            return;
        }
        let broker = self.mqtt.broker_address().to_string();
        let topic = self.sensor_topic();

        for _ in 0..DRAIN_BUDGET {
            if self.mac.queue_depth() == 0 {
                break;
            }
            self.energy.set_state(self.waiting_state(), Instant::now());
            let sent = self.mac.transmit_next(&broker, distance, max_range).await;
            self.energy.set_state(self.resting_state(), Instant::now());
            let Some((payload, result)) = sent else {
                break;
            };
            for _ in 0..=result.retries {
                self.energy.add_tx_energy(payload.len());
            }

            if !result.success {
                self.stats.mac_drops += 1;
                self.metrics.record_delivery_attempt(false);
                log::debug!("[{}] Sensor reading lost on the link after {} retries (pdr {:.2})", self.node_id, result.retries, result.pdr);
                continue;
            }

            self.stats.messages_sent += 1;
            let published = self.mqtt.publish(&topic, &payload, self.qos, false).await;
            self.metrics.record_delivery_attempt(published);
            if !published {
                self.stats.publish_failures += 1;
            }
        }
    }

    /// Note a broker outage. Returns the in-flight and retained counts at
    /// detection, or `None` when the node was not connected.
    pub fn detect_broker_loss(&mut self) -> Option<(usize, usize)> {
        if !self.mqtt.is_connected() {
            return None;
        }
        let counts = (self.mqtt.inflight_count(), self.mqtt.retained_count());
        self.mqtt.mark_disconnected();
        log::info!("[{}] Detected broker outage (inflight: {}, retained: {})", self.node_id, counts.0, counts.1);
        Some(counts)
    }

    /// Drop the connection abnormally, so the broker publishes the will.
    pub fn force_disconnect(&mut self) {
        self.mqtt.disconnect(true);
    }

    /// Move the node to another broker and reconnect right away.
    ///
    /// Clears a stranded state, reissues subscriptions and flags remaining
    /// in-flight messages for resend. Returns whether the connect succeeded.
    pub async fn migrate_to(&mut self, broker: &str, now: Instant) -> Result<bool, NodeError> {
        if let NodeStatus::Halted(reason) = self.status {
            return Err(NodeError::Halted(reason));
        }
        if self.brokers.position(broker).is_none() {
            return Err(NodeError::UnknownBroker(broker.to_string()));
        }

        self.mqtt.mark_disconnected();
        self.mqtt.set_broker(broker);
        self.spec.broker = Some(broker.to_string());
        self.mqtt.reset_reconnect();
        self.reconnect_due = None;
        if self.status == NodeStatus::Stranded {
            self.status = NodeStatus::Running;
        }

        if !self.mqtt.connect().await {
            return Ok(false);
        }
        self.restore_subscriptions().await;
        let pending = self.mqtt.flag_inflight_for_resend(now);
        if pending > 0 {
            log::info!("[{}] Resending {} inflight messages", self.node_id, pending);
        }
        Ok(true)
    }

    /// Give a stranded node a fresh reconnect budget.
    pub fn reset_reconnect(&mut self) {
        self.mqtt.reset_reconnect();
        self.reconnect_due = None;
        if self.status == NodeStatus::Stranded {
            self.status = NodeStatus::Running;
        }
    }

    /// Stop the node for good.
    ///
    /// Fatal conditions publish a death notice on the status topic and close
    /// abnormally so the broker also publishes the will. An explicit stop
    /// disconnects gracefully.
    pub async fn shutdown(&mut self, reason: HaltReason) {
        if self.is_halted() {
            return;
        }
        if reason != HaltReason::Stopped && self.mqtt.is_connected() {
            let topic = self.mqtt.lwt_topic().to_string();
            let notice = format!("halted:{reason}");
            self.mqtt.publish(&topic, notice.as_bytes(), QoS::AtLeastOnce, false).await;
        }
        self.mqtt.disconnect(reason != HaltReason::Stopped);
        self.reconnect_due = None;
        self.status = NodeStatus::Halted(reason);
        self.energy.set_state(RadioState::Sleep, Instant::now());
        match reason {
            HaltReason::Stopped => log::info!("[{}] Stopped", self.node_id),
            _ => log::warn!("[{}] Halted: {}", self.node_id, reason),
        }
    }

    /// Replace the MAC and energy tracker with ones for `protocol`.
    /// Returns false when the node already uses it.
    pub fn switch_protocol(&mut self, protocol: Protocol, now: Instant) -> bool {
        let old = self.protocol();
        if old == protocol {
            return false;
        }
        self.stats.protocol_switches += 1;
        let seed = self.seed.wrapping_add(self.stats.protocol_switches * 16);
        self.mac = Mac::new(&self.node_id, protocol, &self.config, seed);
        self.energy = EnergyTracker::new(self.config.profile(protocol), &self.config.energy, now);
        self.spec.protocol = protocol;
        log::info!("[{}] Switched from {} to {}", self.node_id, old, protocol);
        true
    }

    /// Recommend a PHY for the given link distance and required data rate.
    pub fn select_best_phy(&self, distance_to_broker: f64, data_rate_needed: f64) -> Protocol {
        let battery_low = self.energy.battery_level() < LOW_BATTERY_PERCENT;
        let high_data_rate = data_rate_needed > HIGH_DATA_RATE_BPS;

        if battery_low && !high_data_rate {
            Protocol::Ble
        } else if high_data_rate || distance_to_broker > LONG_DISTANCE_METERS {
            Protocol::Wifi
        } else if distance_to_broker < SHORT_DISTANCE_METERS {
            Protocol::Ble
        } else {
            self.protocol()
        }
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            node_id: self.node_id.clone(),
            protocol: self.protocol(),
            is_mobile: self.spec.is_mobile,
            connected: self.mqtt.is_connected(),
            battery: self.energy.battery_level(),
            position: self.position,
            role: self.spec.role,
            qos: self.qos,
            sensor_interval_secs: duration_to_secs(self.sensor_interval),
            distance_to_broker: self.distance_to_broker(),
            max_range: self.max_range(),
            link: self.link_quality(),
            broker: self.mqtt.broker_address().to_string(),
            status: self.status,
            mac_stats: self.mac.stats(),
            mqtt_stats: self.mqtt.stats(),
            energy_stats: self.energy.stats(),
            stats: self.stats.clone(),
        }
    }
}
