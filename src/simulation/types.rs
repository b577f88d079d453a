//! Type definitions shared across the simulation.
//!
//! Contains:
//! - Geometry (`Point`, `Area`) in meters
//! - Link protocol, node role and MQTT QoS enums
//! - Conversions between float seconds and embassy durations
//! - Channel aliases used between tasks

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Simple 2D point in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance in meters.
    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

/// Rectangular simulation area anchored at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub width: f64,
    pub height: f64,
}

impl Area {
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x <= self.width && p.y <= self.height
    }

    pub fn clamp(&self, p: Point) -> Point {
        Point::new(p.x.clamp(0.0, self.width), p.y.clamp(0.0, self.height))
    }

    pub fn center(&self) -> Point {
        Point::new(self.width / 2.0, self.height / 2.0)
    }
}

impl Default for Area {
    fn default() -> Self {
        Self { width: 1000.0, height: 1000.0 }
    }
}

/// Link-layer technology of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ble,
    Wifi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ble => write!(f, "BLE"),
            Protocol::Wifi => write!(f, "WiFi"),
        }
    }
}

/// Whether a node publishes sensor data, listens, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
    #[default]
    Both,
}

impl Role {
    pub fn publishes(&self) -> bool {
        matches!(self, Role::Publisher | Role::Both)
    }

    pub fn subscribes(&self) -> bool {
        matches!(self, Role::Subscriber | Role::Both)
    }
}

/// MQTT quality of service. Only levels 0 and 1 are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported QoS level {other}, expected 0 or 1")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Convert float seconds into an embassy `Duration` (microsecond resolution).
/// Negative and NaN inputs collapse to zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if !(secs > 0.0) {
        return Duration::from_ticks(0);
    }
    Duration::from_micros((secs * 1_000_000.0).round() as u64)
}

/// Convert an embassy `Duration` into float seconds.
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1_000_000.0
}

/// Upper bound on concurrently spawned node tasks.
pub const MAX_NODE_COUNT: usize = 256;

/// Depth of the control channel (external collaborators → network task).
pub const CONTROL_QUEUE_SIZE: usize = 16;
/// Bounded channel carrying control commands into the network task.
pub type ControlQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, super::network::ControlCommand, CONTROL_QUEUE_SIZE>;
/// Receiver side of the control channel.
pub type ControlQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, super::network::ControlCommand, CONTROL_QUEUE_SIZE>;
/// Sender side of the control channel.
pub type ControlQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, super::network::ControlCommand, CONTROL_QUEUE_SIZE>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_and_clamp() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert_eq!(a.distance_to(&b), 5.0);

        let area = Area { width: 100.0, height: 50.0 };
        assert_eq!(area.clamp(Point::new(-10.0, 70.0)), Point::new(0.0, 50.0));
        assert!(area.contains(&Point::new(100.0, 50.0)));
        assert!(!area.contains(&Point::new(100.1, 0.0)));
    }

    #[test]
    fn qos_serde_uses_numeric_levels() {
        let qos: QoS = serde_json::from_str("0").unwrap();
        assert_eq!(qos, QoS::AtMostOnce);
        assert_eq!(serde_json::to_string(&QoS::AtLeastOnce).unwrap(), "1");
        assert!(serde_json::from_str::<QoS>("2").is_err());
    }

    #[test]
    fn seconds_round_trip_through_duration() {
        assert_eq!(secs_to_duration(0.25).as_micros(), 250_000);
        assert_eq!(secs_to_duration(-1.0).as_micros(), 0);
        assert_eq!(duration_to_secs(Duration::from_millis(1500)), 1.5);
    }
}
