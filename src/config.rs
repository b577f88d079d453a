//! Configuration loading and validation.
//!
//! A simulation is described by a TOML file. Every key has a default, so an
//! empty file yields the stock five-node scenario.

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::simulation::types::{Area, Point, Protocol, QoS, Role};

/// Topic filter used by subscribers that do not name specific publishers.
pub const DEFAULT_SUBSCRIPTION: &str = "sensors/+/data";

/// Share of the radio range used as the radius for randomly placed nodes.
pub const PLACEMENT_RANGE_FRACTION: f64 = 0.9;

/// Timing and power profile of one PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PhyProfile {
    pub name: String,
    pub data_rate_bps: u64,
    pub tx_power_mw: f64,
    pub rx_power_mw: f64,
    pub sleep_power_mw: f64,
    pub idle_power_mw: f64,
    pub mtu: usize,
    pub range_meters: f64,
    pub packet_overhead_us: f64,
    /// Extra airtime on the first attempt of a packet (BLE preamble).
    pub preamble_time_us: f64,
}

impl PhyProfile {
    pub fn ble() -> Self {
        Self {
            name: "BLE 5.x".to_string(),
            data_rate_bps: 1_000_000,
            tx_power_mw: 45.0,
            rx_power_mw: 36.0,
            sleep_power_mw: 0.0045,
            idle_power_mw: 0.015,
            mtu: 251,
            range_meters: 100.0,
            packet_overhead_us: 150.0,
            preamble_time_us: 40.0,
        }
    }

    pub fn wifi() -> Self {
        Self {
            name: "WiFi 802.11n".to_string(),
            data_rate_bps: 150_000_000,
            tx_power_mw: 100.0,
            rx_power_mw: 50.0,
            sleep_power_mw: 0.1,
            idle_power_mw: 10.0,
            mtu: 1500,
            range_meters: 100.0,
            packet_overhead_us: 50.0,
            preamble_time_us: 0.0,
        }
    }
}

impl Default for PhyProfile {
    fn default() -> Self {
        Self::wifi()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BleMacParameters {
    pub conn_interval_ms: u64,
    pub advertising_interval_ms: u64,
    /// Supervision timeout expressed in connection intervals.
    pub supervision_multiplier: u32,
    pub retry_limit: u32,
    pub queue_size: usize,
}

impl Default for BleMacParameters {
    fn default() -> Self {
        Self {
            conn_interval_ms: 60,
            advertising_interval_ms: 100,
            supervision_multiplier: 6,
            retry_limit: 3,
            queue_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WifiMacParameters {
    pub backoff_min_slots: u32,
    pub backoff_max_slots: u32,
    /// Upper bound of the contention window after exponential growth.
    pub max_window_slots: u32,
    pub slot_time_us: u64,
    pub ack_timeout_ms: u64,
    pub retry_limit: u32,
    pub collision_probability: f64,
    pub queue_size: usize,
}

impl Default for WifiMacParameters {
    fn default() -> Self {
        Self {
            backoff_min_slots: 0,
            backoff_max_slots: 31,
            max_window_slots: 1023,
            slot_time_us: 9,
            ack_timeout_ms: 1,
            retry_limit: 3,
            collision_probability: 0.1,
            queue_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MqttConfig {
    pub keep_alive_secs: f64,
    pub default_qos: QoS,
    pub clean_session: bool,
    pub reconnect_min_secs: f64,
    pub reconnect_max_secs: f64,
    pub max_reconnect_attempts: u32,
    pub retransmit_delay_secs: f64,
    pub max_retransmits: u32,
    pub wan_latency_ms: u64,
    pub wan_loss: f64,
    /// Publishes kept for replay while a persistent session is offline;
    /// the oldest are dropped beyond this.
    pub max_session_buffer: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60.0,
            default_qos: QoS::AtLeastOnce,
            clean_session: false,
            reconnect_min_secs: 1.0,
            reconnect_max_secs: 60.0,
            max_reconnect_attempts: 10,
            retransmit_delay_secs: 3.0,
            max_retransmits: 5,
            wan_latency_ms: 100,
            wan_loss: 0.01,
            max_session_buffer: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnergyConfig {
    pub capacity_mj: f64,
    /// Dwell periods at least this long are not charged.
    pub max_dwell_secs: f64,
    pub battery_voltage: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            capacity_mj: 216_000.0,
            max_dwell_secs: 60.0,
            battery_voltage: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokerConfig {
    pub primary: String,
    pub failover: String,
    pub primary_position: Point,
    pub failover_position: Point,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            primary: "localhost:1883".to_string(),
            failover: "localhost:2883".to_string(),
            primary_position: Point::new(500.0, 500.0),
            failover_position: Point::new(500.0, 500.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FailoverConfig {
    pub monitor_interval_ms: u64,
    /// Base unit of the staggered reconnection wave.
    pub stagger_unit_ms: u64,
    pub relocation_max_offset: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 2000,
            stagger_unit_ms: 100,
            relocation_max_offset: 50.0,
        }
    }
}

/// Optional timed events for unattended runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScenarioConfig {
    pub failover_at_secs: Option<f64>,
    pub relocation_at_secs: Option<f64>,
    pub metrics_interval_secs: Option<f64>,
}

/// Description of one node, either listed in the file or generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSpec {
    pub node_id: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub is_mobile: bool,
    /// Random position inside the area when omitted.
    #[serde(default)]
    pub position: Option<Point>,
    #[serde(default)]
    pub role: Role,
    /// Publisher ids to follow; empty means every sensor topic.
    #[serde(default)]
    pub subscribe_to: Vec<String>,
    #[serde(default)]
    pub qos: Option<QoS>,
    /// Drawn uniformly from 5 to 15 seconds when omitted.
    #[serde(default)]
    pub sensor_interval_secs: Option<f64>,
    /// Defaults to the primary broker.
    #[serde(default)]
    pub broker: Option<String>,
}

impl NodeSpec {
    pub fn new(node_id: impl Into<String>, protocol: Protocol, is_mobile: bool) -> Self {
        Self {
            node_id: node_id.into(),
            protocol,
            is_mobile,
            position: None,
            role: Role::Both,
            subscribe_to: Vec::new(),
            qos: None,
            sensor_interval_secs: None,
            broker: None,
        }
    }

    /// Topic filters this node subscribes to, given its role.
    pub fn subscription_filters(&self) -> Vec<String> {
        if !self.role.subscribes() {
            return Vec::new();
        }
        let mut filters: Vec<String> = if self.subscribe_to.is_empty() {
            vec![DEFAULT_SUBSCRIPTION.to_string()]
        } else {
            self.subscribe_to.iter().map(|id| format!("sensors/{id}/data")).collect()
        };
        filters.push(format!("nodes/{}/command", self.node_id));
        filters
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationConfig {
    pub area: Area,
    pub tick_ms: u64,
    pub duration_secs: u64,
    pub speed_percent: u32,
    pub seed: Option<u64>,
    /// Number of generated nodes when `nodes` is empty.
    pub node_count: usize,
    pub stationary_fraction: f64,
    pub out_of_range_limit_secs: f64,
    pub nodes: Vec<NodeSpec>,
    pub brokers: BrokerConfig,
    pub mqtt: MqttConfig,
    pub ble: PhyProfile,
    pub wifi: PhyProfile,
    pub ble_mac: BleMacParameters,
    pub wifi_mac: WifiMacParameters,
    pub energy: EnergyConfig,
    pub failover: FailoverConfig,
    pub scenario: ScenarioConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            area: Area::default(),
            tick_ms: 1000,
            duration_secs: 300,
            speed_percent: 100,
            seed: None,
            node_count: 5,
            stationary_fraction: 0.7,
            out_of_range_limit_secs: 60.0,
            nodes: Vec::new(),
            brokers: BrokerConfig::default(),
            mqtt: MqttConfig::default(),
            ble: PhyProfile::ble(),
            wifi: PhyProfile::wifi(),
            ble_mac: BleMacParameters::default(),
            wifi_mac: WifiMacParameters::default(),
            energy: EnergyConfig::default(),
            failover: FailoverConfig::default(),
            scenario: ScenarioConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(config_path).with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: SimulationConfig = toml::from_str(content).context("Invalid TOML format")?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid simulation configuration")?;
        Ok(config)
    }

    pub fn profile(&self, protocol: Protocol) -> &PhyProfile {
        match protocol {
            Protocol::Ble => &self.ble,
            Protocol::Wifi => &self.wifi,
        }
    }

    pub fn broker_position(&self, address: &str) -> Option<Point> {
        if address == self.brokers.primary {
            Some(self.brokers.primary_position)
        } else if address == self.brokers.failover {
            Some(self.brokers.failover_position)
        } else {
            None
        }
    }

    /// Node list to start with: the explicit list, or `node_count` generated
    /// nodes with protocols alternating WiFi/BLE and the first
    /// `stationary_fraction` of them stationary.
    pub fn initial_nodes(&self) -> Vec<NodeSpec> {
        if !self.nodes.is_empty() {
            return self.nodes.clone();
        }
        let stationary = (self.node_count as f64 * self.stationary_fraction) as usize;
        (0..self.node_count)
            .map(|i| {
                let protocol = if i % 2 == 0 { Protocol::Wifi } else { Protocol::Ble };
                NodeSpec::new(format!("node_{i}"), protocol, i >= stationary)
            })
            .collect()
    }

    /// Fill in the randomized parts of a node spec.
    ///
    /// A missing position is drawn uniformly from a disc around `anchor`
    /// (the broker the node will attach to) whose radius is
    /// `PLACEMENT_RANGE_FRACTION` of the node's radio range, so every placed
    /// node starts within reach.
    pub fn resolve_node(&self, spec: &NodeSpec, anchor: Point, rng: &mut impl Rng) -> NodeSpec {
        let mut resolved = spec.clone();
        if resolved.position.is_none() {
            let radius = self.profile(spec.protocol).range_meters * PLACEMENT_RANGE_FRACTION;
            let distance = radius * rng.gen_range(0.0..=1.0f64).sqrt();
            let angle = rng.gen_range(0.0..std::f64::consts::TAU);
            resolved.position = Some(self.area.clamp(anchor.offset(distance * angle.cos(), distance * angle.sin())));
        }
        if resolved.sensor_interval_secs.is_none() {
            resolved.sensor_interval_secs = Some(rng.gen_range(5.0..=15.0));
        }
        if resolved.qos.is_none() {
            resolved.qos = Some(self.mqtt.default_qos);
        }
        if resolved.broker.is_none() {
            resolved.broker = Some(self.brokers.primary.clone());
        }
        resolved
    }

    /// Validate configuration to reject malformed inputs.
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.area.width <= 0.0 || self.area.height <= 0.0 {
            return Err(format!("Area {}x{} must have positive dimensions", self.area.width, self.area.height));
        }
        if self.tick_ms == 0 {
            return Err("tick-ms must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.stationary_fraction) {
            return Err(format!("stationary-fraction {} outside [0, 1]", self.stationary_fraction));
        }
        if self.out_of_range_limit_secs < 0.0 {
            return Err("out-of-range-limit-secs must be non-negative".to_string());
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if node.node_id.trim().is_empty() {
                return Err("Node id must not be empty".to_string());
            }
            if !node_ids.insert(node.node_id.as_str()) {
                return Err(format!("Duplicate node_id found: {}", node.node_id));
            }
            if let Some(position) = node.position {
                if !self.area.contains(&position) {
                    return Err(format!("Node {} position {} outside the simulation area", node.node_id, position));
                }
            }
            if let Some(interval) = node.sensor_interval_secs {
                if interval <= 0.0 {
                    return Err(format!("Node {} sensor interval must be positive", node.node_id));
                }
            }
            if let Some(broker) = &node.broker {
                if self.broker_position(broker).is_none() {
                    return Err(format!("Node {} references unknown broker {}", node.node_id, broker));
                }
            }
        }

        if self.brokers.primary == self.brokers.failover {
            return Err("Primary and failover broker addresses must differ".to_string());
        }
        for (label, position) in [("primary", self.brokers.primary_position), ("failover", self.brokers.failover_position)] {
            if !self.area.contains(&position) {
                return Err(format!("{label} broker position {position} outside the simulation area"));
            }
        }

        for profile in [&self.ble, &self.wifi] {
            if profile.data_rate_bps == 0 {
                return Err(format!("{}: data rate must be positive", profile.name));
            }
            if profile.range_meters <= 0.0 {
                return Err(format!("{}: range must be positive", profile.name));
            }
            if profile.tx_power_mw < 0.0 || profile.rx_power_mw < 0.0 || profile.sleep_power_mw < 0.0 || profile.idle_power_mw < 0.0 {
                return Err(format!("{}: power draws must be non-negative", profile.name));
            }
            if profile.packet_overhead_us < 0.0 || profile.preamble_time_us < 0.0 {
                return Err(format!("{}: overheads must be non-negative", profile.name));
            }
        }

        if self.ble_mac.conn_interval_ms == 0 {
            return Err("ble-mac.conn-interval-ms must be positive".to_string());
        }
        if self.ble_mac.supervision_multiplier == 0 {
            return Err("ble-mac.supervision-multiplier must be positive".to_string());
        }
        if self.wifi_mac.backoff_min_slots > self.wifi_mac.backoff_max_slots {
            return Err("wifi-mac backoff range is inverted".to_string());
        }
        if !(0.0..=1.0).contains(&self.wifi_mac.collision_probability) {
            return Err(format!("wifi-mac.collision-probability {} outside [0, 1]", self.wifi_mac.collision_probability));
        }
        if self.ble_mac.queue_size == 0 || self.wifi_mac.queue_size == 0 {
            return Err("MAC queue sizes must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&self.mqtt.wan_loss) {
            return Err(format!("mqtt.wan-loss {} outside [0, 1]", self.mqtt.wan_loss));
        }
        if self.mqtt.reconnect_min_secs <= 0.0 || self.mqtt.reconnect_min_secs > self.mqtt.reconnect_max_secs {
            return Err(format!(
                "mqtt reconnect backoff floor {} must be positive and not above ceiling {}",
                self.mqtt.reconnect_min_secs, self.mqtt.reconnect_max_secs
            ));
        }
        if self.mqtt.keep_alive_secs <= 0.0 || self.mqtt.retransmit_delay_secs <= 0.0 {
            return Err("mqtt keep-alive and retransmit delay must be positive".to_string());
        }

        if self.energy.capacity_mj <= 0.0 || self.energy.battery_voltage <= 0.0 {
            return Err("energy capacity and voltage must be positive".to_string());
        }
        if self.failover.monitor_interval_ms == 0 {
            return Err("failover.monitor-interval-ms must be positive".to_string());
        }
        if self.failover.relocation_max_offset < 0.0 {
            return Err("failover.relocation-max-offset must be non-negative".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SimulationConfig::from_toml("").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.mqtt.keep_alive_secs, 60.0);
        assert_eq!(config.ble.data_rate_bps, 1_000_000);
        assert_eq!(config.wifi_mac.backoff_max_slots, 31);
        assert_eq!(config.energy.capacity_mj, 216_000.0);
        assert!(!config.mqtt.clean_session);
    }

    #[test]
    fn parses_explicit_nodes_and_sections() {
        let text = r#"
            duration-secs = 30
            seed = 7

            [mqtt]
            default-qos = 0
            clean-session = true

            [ble-mac]
            conn-interval-ms = 30

            [[nodes]]
            node-id = "alpha"
            protocol = "ble"
            position = { x = 10.0, y = 20.0 }
            role = "publisher"

            [[nodes]]
            node-id = "beta"
            protocol = "wifi"
            is-mobile = true
            subscribe-to = ["alpha"]
        "#;
        let config = SimulationConfig::from_toml(text).unwrap();
        assert_eq!(config.duration_secs, 30);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.mqtt.default_qos, QoS::AtMostOnce);
        assert_eq!(config.ble_mac.conn_interval_ms, 30);
        assert_eq!(config.ble_mac.retry_limit, 3);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].role, Role::Publisher);
        assert!(config.nodes[0].subscription_filters().is_empty());
        assert_eq!(config.nodes[1].subscription_filters(), vec!["sensors/alpha/data".to_string(), "nodes/beta/command".to_string()]);
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_ranges() {
        let dup = r#"
            [[nodes]]
            node-id = "a"
            protocol = "ble"
            [[nodes]]
            node-id = "a"
            protocol = "wifi"
        "#;
        let err = SimulationConfig::from_toml(dup).unwrap_err();
        assert!(format!("{err:#}").contains("Duplicate node_id"));

        let mut config = SimulationConfig::default();
        config.ble.range_meters = 0.0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.mqtt.reconnect_min_secs = 120.0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.nodes.push(NodeSpec {
            position: Some(Point::new(2000.0, 0.0)),
            ..NodeSpec::new("far", Protocol::Wifi, false)
        });
        assert!(config.validate().unwrap_err().contains("outside"));
    }

    #[test]
    fn default_placement_stays_within_radio_range() {
        let config = SimulationConfig::default();
        let broker = config.brokers.primary_position;
        let corner = Point::new(0.0, 0.0);
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..1000 {
            let protocol = if i % 2 == 0 { Protocol::Wifi } else { Protocol::Ble };
            let range = config.profile(protocol).range_meters;
            let spec = NodeSpec::new(format!("node_{i}"), protocol, false);

            let centered = config.resolve_node(&spec, broker, &mut rng).position.unwrap();
            assert!(centered.distance_to(&broker) <= range * PLACEMENT_RANGE_FRACTION + 1e-9);

            // Clamping to the area only pulls a node closer to an anchor inside it
            let cornered = config.resolve_node(&spec, corner, &mut rng).position.unwrap();
            assert!(config.area.contains(&cornered));
            assert!(cornered.distance_to(&corner) <= range);
        }

        // Explicit positions are kept as given
        let spec = NodeSpec {
            position: Some(Point::new(10.0, 990.0)),
            ..NodeSpec::new("pinned", Protocol::Ble, false)
        };
        assert_eq!(config.resolve_node(&spec, broker, &mut rng).position, Some(Point::new(10.0, 990.0)));
    }

    #[test]
    fn generated_nodes_follow_stationary_fraction() {
        let config = SimulationConfig { node_count: 10, ..Default::default() };
        let nodes = config.initial_nodes();
        assert_eq!(nodes.len(), 10);
        assert_eq!(nodes.iter().filter(|n| !n.is_mobile).count(), 7);
        assert_eq!(nodes[0].protocol, Protocol::Wifi);
        assert_eq!(nodes[1].protocol, Protocol::Ble);

        let mut rng = StdRng::seed_from_u64(1);
        let resolved = config.resolve_node(&nodes[0], config.brokers.primary_position, &mut rng);
        let interval = resolved.sensor_interval_secs.unwrap();
        assert!((5.0..=15.0).contains(&interval));
        assert!(config.area.contains(&resolved.position.unwrap()));
        assert_eq!(resolved.broker.as_deref(), Some("localhost:1883"));
        assert_eq!(resolved.qos, Some(QoS::AtLeastOnce));
    }
}
