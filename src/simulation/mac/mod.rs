//! Link-layer (MAC) simulation.
//!
//! Contains:
//! - `ble`: connection-event scheduled BLE link with supervision timeout
//! - `wifi`: CSMA/CA contention with binary exponential backoff
//!
//! The protocol is chosen when the node is built and dispatched through the
//! `Mac` enum. Failures never leave the MAC except as `success == false` with
//! a retry count and a reason.

pub mod ble;
pub mod wifi;

use embassy_time::Instant;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::SimulationConfig;

use super::types::Protocol;

pub use ble::{BleLinkState, BleMac, BleMacStats};
pub use wifi::{WifiMac, WifiMacStats};

/// Why a packet did not make it across the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MacFailure {
    QueueFull,
    MaxRetries,
}

/// Outcome of one `send_packet` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacResult {
    pub success: bool,
    pub tx_time_us: f64,
    pub retries: u32,
    pub pdr: f64,
    /// Time spent waiting for channel access (connection events, backoff, ACK windows).
    pub wait_time_us: u64,
    pub failure: Option<MacFailure>,
}

impl MacResult {
    pub(crate) fn delivered(tx_time_us: f64, retries: u32, pdr: f64, wait_time_us: u64) -> Self {
        Self {
            success: true,
            tx_time_us,
            retries,
            pdr,
            wait_time_us,
            failure: None,
        }
    }

    pub(crate) fn failed(reason: MacFailure, retries: u32, pdr: f64, wait_time_us: u64) -> Self {
        Self {
            success: false,
            tx_time_us: 0.0,
            retries,
            pdr,
            wait_time_us,
            failure: Some(reason),
        }
    }
}

/// Bounded FIFO of packets waiting for the link. New packets are dropped
/// while it is full.
#[derive(Debug)]
pub struct SendQueue {
    capacity: usize,
    pending: VecDeque<Vec<u8>>,
    dropped: u64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: VecDeque::with_capacity(capacity.min(64)),
            dropped: 0,
        }
    }

    /// Queue a packet. Returns false (and counts a drop) when full.
    pub fn push(&mut self, payload: Vec<u8>) -> bool {
        if self.pending.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.pending.push_back(payload);
        true
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.pending.front().map(Vec::as_slice)
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum MacStats {
    Ble(BleMacStats),
    Wifi(WifiMacStats),
}

impl MacStats {
    pub fn packets_sent(&self) -> u64 {
        match self {
            MacStats::Ble(s) => s.packets_sent,
            MacStats::Wifi(s) => s.packets_sent,
        }
    }

    pub fn packets_dropped(&self) -> u64 {
        match self {
            MacStats::Ble(s) => s.packets_dropped,
            MacStats::Wifi(s) => s.packets_dropped,
        }
    }
}

pub enum Mac {
    Ble(BleMac),
    Wifi(WifiMac),
}

impl Mac {
    /// Build the MAC for `protocol` from the simulation configuration.
    pub fn new(node_id: &str, protocol: Protocol, config: &SimulationConfig, seed: u64) -> Self {
        match protocol {
            Protocol::Ble => Mac::Ble(BleMac::new(node_id, &config.ble, &config.ble_mac, seed)),
            Protocol::Wifi => Mac::Wifi(WifiMac::new(node_id, &config.wifi, &config.wifi_mac, seed)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Mac::Ble(_) => Protocol::Ble,
            Mac::Wifi(_) => Protocol::Wifi,
        }
    }

    /// Queue `payload` and transmit the oldest pending packet towards `dest`
    /// over a link of `distance` meters.
    pub async fn send_packet(&mut self, payload: &[u8], dest: &str, distance: f64, max_range: f64) -> MacResult {
        match self {
            Mac::Ble(mac) => mac.send_packet(payload, dest, distance, max_range).await,
            Mac::Wifi(mac) => mac.send_packet(payload, dest, distance, max_range).await,
        }
    }

    /// Queue a packet for a later `transmit_next`. Returns false when the
    /// queue was full and the packet was dropped.
    pub fn enqueue(&mut self, payload: &[u8]) -> bool {
        match self {
            Mac::Ble(mac) => mac.enqueue(payload),
            Mac::Wifi(mac) => mac.enqueue(payload),
        }
    }

    /// Transmit the oldest queued packet. `None` when nothing is queued.
    pub async fn transmit_next(&mut self, dest: &str, distance: f64, max_range: f64) -> Option<(Vec<u8>, MacResult)> {
        match self {
            Mac::Ble(mac) => mac.transmit_next(dest, distance, max_range).await,
            Mac::Wifi(mac) => mac.transmit_next(dest, distance, max_range).await,
        }
    }

    /// Run link upkeep between sends. Returns true when the link was lost.
    pub fn idle_maintenance(&mut self, now: Instant, distance: f64, max_range: f64) -> bool {
        match self {
            Mac::Ble(mac) => mac.idle_maintenance(now, distance, max_range),
            Mac::Wifi(_) => false,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        match self {
            Mac::Ble(mac) => mac.is_sleeping(),
            Mac::Wifi(_) => false,
        }
    }

    pub fn queue_depth(&self) -> usize {
        match self {
            Mac::Ble(mac) => mac.queue_depth(),
            Mac::Wifi(mac) => mac.queue_depth(),
        }
    }

    pub fn stats(&self) -> MacStats {
        match self {
            Mac::Ble(mac) => MacStats::Ble(mac.stats()),
            Mac::Wifi(mac) => MacStats::Wifi(mac.stats()),
        }
    }
}
