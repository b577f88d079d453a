//! WiFi link layer with CSMA/CA.
//!
//! Every attempt waits a random backoff drawn from the contention window
//! (stretched by the current collision probability), transmits, and waits for
//! the ACK window. A single PDR draw decides the attempt; failures are binned
//! as collisions or ACK timeouts for statistics. Retries double the window.

use embassy_time::{Duration, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::{PhyProfile, WifiMacParameters};
use crate::simulation::signal_calculations::{calculate_air_time_us, calculate_pdr};
use crate::simulation::types::Protocol;

use super::{MacFailure, MacResult, SendQueue};

#[derive(Debug, Clone, Default, Serialize)]
pub struct WifiMacStats {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_retried: u64,
    pub collisions: u64,
    pub ack_timeouts: u64,
    pub acks_received: u64,
    pub queue_overflows: u64,
    pub queue_depth: usize,
    pub associated: bool,
    pub ap_address: Option<String>,
}

pub struct WifiMac {
    node_id: String,
    profile: PhyProfile,
    params: WifiMacParameters,
    ap_address: Option<String>,
    queue: SendQueue,
    stats: WifiMacStats,
    rng: StdRng,
}

/// Collision probability for a link of the given PDR.
///
/// Weak links see more contention losses: `base × (1 + (1 - pdr) × 0.5)`.
pub fn collision_probability(base: f64, pdr: f64) -> f64 {
    (base * (1.0 + (1.0 - pdr) * 0.5)).clamp(0.0, 1.0)
}

impl WifiMac {
    pub fn new(node_id: &str, profile: &PhyProfile, params: &WifiMacParameters, seed: u64) -> Self {
        Self {
            node_id: node_id.to_string(),
            profile: profile.clone(),
            params: params.clone(),
            ap_address: None,
            queue: SendQueue::new(params.queue_size),
            stats: WifiMacStats::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Contention window (inclusive slot range) for the given retry number.
    fn contention_window(&self, retry: u32) -> (u32, u32) {
        if retry == 0 {
            return (self.params.backoff_min_slots, self.params.backoff_max_slots);
        }
        let grown = 2u32.saturating_pow(retry).saturating_mul(31);
        (0, grown.min(self.params.max_window_slots))
    }

    /// Queue a packet. Returns false when the queue is full and the packet
    /// was dropped.
    pub fn enqueue(&mut self, payload: &[u8]) -> bool {
        if self.queue.push(payload.to_vec()) {
            return true;
        }
        self.stats.packets_dropped += 1;
        self.stats.queue_overflows += 1;
        log::debug!("[{}] WiFi queue full, packet dropped", self.node_id);
        false
    }

    /// Transmit the oldest queued packet; it leaves the queue only when the
    /// attempt completes.
    pub async fn transmit_next(&mut self, dest: &str, distance: f64, max_range: f64) -> Option<(Vec<u8>, MacResult)> {
        let len = self.queue.front()?.len();
        let result = self.deliver(len, dest, distance, max_range).await;
        self.queue.pop().map(|payload| (payload, result))
    }

    pub async fn send_packet(&mut self, payload: &[u8], dest: &str, distance: f64, max_range: f64) -> MacResult {
        let pdr = calculate_pdr(distance, max_range, Protocol::Wifi);
        if !self.enqueue(payload) {
            return MacResult::failed(MacFailure::QueueFull, 0, pdr, 0);
        }
        match self.transmit_next(dest, distance, max_range).await {
            Some((_, result)) => result,
            None => MacResult::failed(MacFailure::QueueFull, 0, pdr, 0),
        }
    }

    async fn deliver(&mut self, len: usize, dest: &str, distance: f64, max_range: f64) -> MacResult {
        let pdr = calculate_pdr(distance, max_range, Protocol::Wifi);
        if self.ap_address.as_deref() != Some(dest) {
            self.ap_address = Some(dest.to_string());
        }

        let collision_prob = collision_probability(self.params.collision_probability, pdr);
        let tx_time_us = calculate_air_time_us(len, self.profile.data_rate_bps, self.profile.packet_overhead_us);
        let ack_wait = Duration::from_millis(self.params.ack_timeout_ms);

        let mut retries = 0;
        let mut wait_time_us = 0;
        loop {
            let (low, high) = self.contention_window(retries);
            let slots = self.rng.gen_range(low..=high.max(low));
            let backoff_us = (slots as f64 * self.params.slot_time_us as f64 * (1.0 + collision_prob)).round() as u64;
            Timer::after(Duration::from_micros(backoff_us)).await;
            Timer::after(ack_wait).await;
            wait_time_us += backoff_us + ack_wait.as_micros();

            if self.rng.gen_range(0.0..1.0) < pdr {
                self.stats.acks_received += 1;
                self.stats.packets_sent += 1;
                return MacResult::delivered(tx_time_us, retries, pdr, wait_time_us);
            }

            if self.rng.gen_range(0.0..1.0) < collision_prob {
                self.stats.collisions += 1;
            } else {
                self.stats.ack_timeouts += 1;
            }
            if retries >= self.params.retry_limit {
                self.stats.packets_dropped += 1;
                log::debug!("[{}] WiFi packet dropped after {} retries (pdr {:.2})", self.node_id, retries, pdr);
                return MacResult::failed(MacFailure::MaxRetries, retries, pdr, wait_time_us);
            }
            retries += 1;
            self.stats.packets_retried += 1;
        }
    }

    pub fn stats(&self) -> WifiMacStats {
        WifiMacStats {
            queue_depth: self.queue.len(),
            associated: self.ap_address.is_some(),
            ap_address: self.ap_address.clone(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::select::{Either, select};
    use futures::executor::block_on;

    #[test]
    fn delivers_at_zero_distance_without_retries() {
        let mut mac = WifiMac::new("n1", &PhyProfile::wifi(), &WifiMacParameters::default(), 3);
        let result = block_on(mac.send_packet(&[0u8; 150], "localhost:1883", 0.0, 100.0));
        assert!(result.success);
        assert_eq!(result.retries, 0);
        // 150 bytes at 150 Mbps is 8 µs, plus 50 µs overhead
        assert!((result.tx_time_us - 58.0).abs() < 1e-9);
        assert!(result.wait_time_us >= 1000);
        let stats = mac.stats();
        assert_eq!(stats.acks_received, 1);
        assert!(stats.associated);
        assert_eq!(stats.collisions + stats.ack_timeouts, 0);
    }

    #[test]
    fn dead_link_retries_to_limit_and_drops() {
        let mut mac = WifiMac::new("n1", &PhyProfile::wifi(), &WifiMacParameters::default(), 3);
        let result = block_on(mac.send_packet(b"payload", "localhost:1883", 101.0, 100.0));
        assert!(!result.success);
        assert_eq!(result.retries, 3);
        assert_eq!(result.failure, Some(MacFailure::MaxRetries));
        let stats = mac.stats();
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.packets_retried, 3);
        assert_eq!(stats.collisions + stats.ack_timeouts, 4);
    }

    #[test]
    fn cancelled_transmission_keeps_packet_queued() {
        let params = WifiMacParameters {
            queue_size: 1,
            ..WifiMacParameters::default()
        };
        let mut mac = WifiMac::new("n1", &PhyProfile::wifi(), &params, 3);
        assert!(mac.enqueue(b"reading"));
        // The ACK window alone outlasts this timer
        let raced = block_on(select(mac.transmit_next("localhost:1883", 0.0, 100.0), Timer::after(Duration::from_micros(100))));
        assert!(matches!(raced, Either::Second(())));
        assert_eq!(mac.queue_depth(), 1);

        let (payload, result) = block_on(mac.transmit_next("localhost:1883", 0.0, 100.0)).unwrap();
        assert_eq!(payload, b"reading");
        assert!(result.success);
        assert_eq!(mac.queue_depth(), 0);
        assert!(block_on(mac.send_packet(b"next", "localhost:1883", 0.0, 100.0)).success);
    }

    #[test]
    fn contention_window_grows_and_caps() {
        let mac = WifiMac::new("n1", &PhyProfile::wifi(), &WifiMacParameters::default(), 3);
        assert_eq!(mac.contention_window(0), (0, 31));
        assert_eq!(mac.contention_window(1), (0, 62));
        assert_eq!(mac.contention_window(2), (0, 124));
        assert_eq!(mac.contention_window(10), (0, 1023));
    }

    #[test]
    fn collision_probability_rises_on_weak_links() {
        assert!((collision_probability(0.1, 1.0) - 0.1).abs() < 1e-12);
        assert!((collision_probability(0.1, 0.0) - 0.15).abs() < 1e-12);
        assert_eq!(collision_probability(1.0, 0.0), 1.0);
    }
}
