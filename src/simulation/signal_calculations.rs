//! Link-quality and timing calculations shared by the MAC layers.
//!
//! Contains helpers for:
//! - The distance-based packet delivery ratio (PDR) curve
//! - Retry probability and expected retry counts derived from PDR
//! - A log-distance RSSI estimate for reporting
//! - Payload airtime for a PHY data rate
//! - Classification of link changes after a broker moves
//!
//! Units:
//! - Distance: meters
//! - Time: microseconds (f64)
//! - Power: dBm

use serde::Serialize;

use super::types::Protocol;

/// PDR never drops below this value while inside the maximum range.
pub const MIN_IN_RANGE_PDR: f64 = 0.1;
const PDR_DECAY_FACTOR: f64 = 0.9;

/// Distance exponent of the PDR curve for a protocol.
///
/// BLE degrades faster towards the edge of its range than WiFi.
pub fn pdr_exponent(protocol: Protocol) -> f64 {
    match protocol {
        Protocol::Ble => 3.0,
        Protocol::Wifi => 2.5,
    }
}

/// Calculate the packet delivery ratio for a link of a given length.
///
/// # Formula
///
/// ```text
/// d   = distance / max_range
/// PDR = clamp(1 - d^e × 0.9, 0.1, 1.0)
/// ```
///
/// with `e = 3.0` for BLE and `e = 2.5` for WiFi.
///
/// # Returns
///
/// - `1.0` when the distance is zero or negative
/// - `0.0` when the distance exceeds `max_range` (or the range is not positive)
/// - exactly `0.1` at `distance == max_range`
///
/// The curve is monotonically non-increasing in distance.
pub fn calculate_pdr(distance: f64, max_range: f64, protocol: Protocol) -> f64 {
    if distance <= 0.0 {
        return 1.0;
    }
    if max_range <= 0.0 || distance > max_range {
        return 0.0;
    }
    let normalized = distance / max_range;
    (1.0 - normalized.powf(pdr_exponent(protocol)) * PDR_DECAY_FACTOR).clamp(MIN_IN_RANGE_PDR, 1.0)
}

/// Probability that a single attempt has to be retried.
pub fn calculate_retry_probability(pdr: f64) -> f64 {
    (1.0 - pdr).clamp(0.0, 1.0)
}

/// Expected number of retries for one packet, bounded by the retry limit.
///
/// Sum of `p^k` for `k = 1..=retry_limit`, where `p` is the retry
/// probability. A dead link (PDR 0) yields `retry_limit`.
pub fn calculate_expected_retries(pdr: f64, retry_limit: u32) -> f64 {
    let p = calculate_retry_probability(pdr);
    (1..=retry_limit).map(|k| p.powi(k as i32)).sum()
}

/// Estimate received signal strength (dBm) with a log-distance model.
///
/// # Formula
///
/// ```text
/// RSSI = P_tx - (40 + 10 × n × log10(d))
/// ```
///
/// with `n = 2.0` for WiFi and `n = 2.5` for BLE, P_tx = 0 dBm (BLE) or
/// 20 dBm (WiFi). Distances under one meter use the reference loss.
pub fn calculate_rssi(distance: f64, protocol: Protocol) -> f64 {
    const REFERENCE_LOSS_DB: f64 = 40.0;
    let (tx_power_dbm, exponent) = match protocol {
        Protocol::Ble => (0.0, 2.5),
        Protocol::Wifi => (20.0, 2.0),
    };
    if distance < 1.0 {
        return tx_power_dbm - REFERENCE_LOSS_DB;
    }
    tx_power_dbm - (REFERENCE_LOSS_DB + 10.0 * exponent * distance.log10())
}

/// Airtime of a payload in microseconds.
///
/// `bytes × 8 × 10^6 / data_rate + overhead_us`
pub fn calculate_air_time_us(payload_bytes: usize, data_rate_bps: u64, overhead_us: f64) -> f64 {
    if data_rate_bps == 0 {
        return overhead_us;
    }
    (payload_bytes as f64) * 8.0 * 1_000_000.0 / data_rate_bps as f64 + overhead_us
}

/// How a link changed after one of its endpoints moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkChange {
    Improved,
    Degraded,
    Unchanged,
}

/// Compare PDR before and after a move. Differences under 1e-9 count as unchanged.
pub fn classify_link_change(old_pdr: f64, new_pdr: f64) -> LinkChange {
    const EPSILON: f64 = 1e-9;
    if new_pdr > old_pdr + EPSILON {
        LinkChange::Improved
    } else if new_pdr + EPSILON < old_pdr {
        LinkChange::Degraded
    } else {
        LinkChange::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdr_edges_match_model() {
        for protocol in [Protocol::Ble, Protocol::Wifi] {
            assert_eq!(calculate_pdr(0.0, 100.0, protocol), 1.0);
            assert_eq!(calculate_pdr(-5.0, 100.0, protocol), 1.0);
            assert!((calculate_pdr(100.0, 100.0, protocol) - 0.1).abs() < 1e-12);
            assert_eq!(calculate_pdr(100.01, 100.0, protocol), 0.0);
        }
    }

    #[test]
    fn ble_pdr_at_400m_range() {
        assert_eq!(calculate_pdr(0.0, 400.0, Protocol::Ble), 1.0);
        assert!((calculate_pdr(400.0, 400.0, Protocol::Ble) - 0.1).abs() < 1e-9);
        // d = 0.5 → 1 - 0.125 * 0.9
        assert!((calculate_pdr(200.0, 400.0, Protocol::Ble) - 0.8875).abs() < 1e-9);
    }

    #[test]
    fn pdr_is_monotonic_in_distance() {
        for protocol in [Protocol::Ble, Protocol::Wifi] {
            let mut previous = f64::INFINITY;
            for step in 0..=250 {
                let distance = step as f64;
                let pdr = calculate_pdr(distance, 200.0, protocol);
                assert!(pdr <= previous, "pdr rose at {distance} m for {protocol}");
                previous = pdr;
            }
        }
    }

    #[test]
    fn higher_exponent_keeps_ble_closer_to_one_inside_range() {
        // Same normalized distance: d^3 < d^2.5 for d < 1
        assert!(calculate_pdr(50.0, 100.0, Protocol::Ble) > calculate_pdr(50.0, 100.0, Protocol::Wifi));
        assert!(calculate_pdr(80.0, 100.0, Protocol::Ble) > calculate_pdr(80.0, 100.0, Protocol::Wifi));
    }

    #[test]
    fn expected_retries_bounded_by_limit() {
        assert_eq!(calculate_expected_retries(1.0, 3), 0.0);
        assert_eq!(calculate_expected_retries(0.0, 3), 3.0);
        let mid = calculate_expected_retries(0.5, 3);
        assert!((mid - 0.875).abs() < 1e-12);
    }

    #[test]
    fn rssi_decreases_with_distance() {
        let near = calculate_rssi(5.0, Protocol::Wifi);
        let far = calculate_rssi(50.0, Protocol::Wifi);
        assert!(near > far);
        assert_eq!(calculate_rssi(0.5, Protocol::Ble), -40.0);
    }

    #[test]
    fn airtime_scales_with_payload() {
        // 1 Mbps: one byte is 8 µs
        assert_eq!(calculate_air_time_us(100, 1_000_000, 150.0), 950.0);
        assert_eq!(calculate_air_time_us(10, 0, 50.0), 50.0);
    }

    #[test]
    fn link_change_classification() {
        assert_eq!(classify_link_change(0.5, 0.9), LinkChange::Improved);
        assert_eq!(classify_link_change(0.9, 0.5), LinkChange::Degraded);
        assert_eq!(classify_link_change(0.7, 0.7), LinkChange::Unchanged);
    }
}
