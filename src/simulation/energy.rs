//! Per-node energy accounting.
//!
//! Radio-state dwell times are charged at the PHY's power draw when the state
//! changes; explicit packet transfers are charged separately from their
//! airtime. Battery level is derived from the total against a fixed capacity.

use embassy_time::Instant;
use serde::Serialize;

use crate::config::{EnergyConfig, PhyProfile};

use super::signal_calculations::calculate_air_time_us;

/// Radio state the energy model charges for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioState {
    Idle,
    Tx,
    Rx,
    Sleep,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyStats {
    pub battery_level: f64,
    pub total_energy_mj: f64,
    pub tx_time_us: f64,
    pub rx_time_us: f64,
    pub sleep_time_us: f64,
    pub idle_time_us: f64,
    pub duty_cycle_percent: f64,
    pub avg_power_mw: f64,
    /// Remaining life of the configured battery at the average draw so far.
    pub estimated_life_hours: Option<f64>,
    pub current_state: RadioState,
}

pub struct EnergyTracker {
    profile: PhyProfile,
    capacity_mj: f64,
    max_dwell_us: f64,
    battery_voltage: f64,
    total_energy_mj: f64,
    battery_level: f64,
    tx_time_us: f64,
    rx_time_us: f64,
    sleep_time_us: f64,
    idle_time_us: f64,
    current_state: RadioState,
    last_update: Instant,
}

impl EnergyTracker {
    pub fn new(profile: &PhyProfile, config: &EnergyConfig, now: Instant) -> Self {
        Self {
            profile: profile.clone(),
            capacity_mj: config.capacity_mj,
            max_dwell_us: config.max_dwell_secs * 1_000_000.0,
            battery_voltage: config.battery_voltage,
            total_energy_mj: 0.0,
            battery_level: 100.0,
            tx_time_us: 0.0,
            rx_time_us: 0.0,
            sleep_time_us: 0.0,
            idle_time_us: 0.0,
            current_state: RadioState::Idle,
            last_update: now,
        }
    }

    /// Charge the dwell in the previous state, then switch to `state`.
    ///
    /// Dwell periods at or above the configured cutoff are dropped; they only
    /// appear when a node has been parked (startup, long suspension).
    pub fn set_state(&mut self, state: RadioState, now: Instant) {
        let dwell_us = now.saturating_duration_since(self.last_update).as_micros() as f64;
        if dwell_us < self.max_dwell_us {
            let power_mw = match self.current_state {
                RadioState::Tx => {
                    self.tx_time_us += dwell_us;
                    self.profile.tx_power_mw
                }
                RadioState::Rx => {
                    self.rx_time_us += dwell_us;
                    self.profile.rx_power_mw
                }
                RadioState::Sleep => {
                    self.sleep_time_us += dwell_us;
                    self.profile.sleep_power_mw
                }
                RadioState::Idle => {
                    self.idle_time_us += dwell_us;
                    self.profile.idle_power_mw
                }
            };
            self.charge(power_mw * dwell_us / 1_000_000.0);
        }
        self.current_state = state;
        self.last_update = now;
    }

    /// Charge the transmission of one packet. Returns the energy in mJ.
    pub fn add_tx_energy(&mut self, packet_size_bytes: usize) -> f64 {
        let tx_time_us = self.packet_air_time_us(packet_size_bytes);
        let energy_mj = self.profile.tx_power_mw * tx_time_us / 1_000_000.0;
        self.tx_time_us += tx_time_us;
        self.charge(energy_mj);
        energy_mj
    }

    /// Charge the reception of one packet. Returns the energy in mJ.
    pub fn add_rx_energy(&mut self, packet_size_bytes: usize) -> f64 {
        let rx_time_us = self.packet_air_time_us(packet_size_bytes);
        let energy_mj = self.profile.rx_power_mw * rx_time_us / 1_000_000.0;
        self.rx_time_us += rx_time_us;
        self.charge(energy_mj);
        energy_mj
    }

    fn packet_air_time_us(&self, packet_size_bytes: usize) -> f64 {
        calculate_air_time_us(packet_size_bytes, self.profile.data_rate_bps, self.profile.packet_overhead_us)
    }

    fn charge(&mut self, energy_mj: f64) {
        self.total_energy_mj += energy_mj;
        // Never rises: total only grows, and the clamp keeps it in [0, 100]
        self.battery_level = (100.0 * (1.0 - self.total_energy_mj / self.capacity_mj)).clamp(0.0, 100.0);
    }

    pub fn battery_level(&self) -> f64 {
        self.battery_level
    }

    pub fn is_depleted(&self) -> bool {
        self.battery_level <= 0.0
    }

    pub fn total_energy_mj(&self) -> f64 {
        self.total_energy_mj
    }

    pub fn current_state(&self) -> RadioState {
        self.current_state
    }

    /// Configured capacity expressed in mAh at the battery voltage.
    fn capacity_mah(&self) -> f64 {
        if self.battery_voltage > 0.0 { self.capacity_mj / 3600.0 / self.battery_voltage } else { 0.0 }
    }

    fn total_time_us(&self) -> f64 {
        self.tx_time_us + self.rx_time_us + self.sleep_time_us + self.idle_time_us
    }

    pub fn stats(&self) -> EnergyStats {
        let total_time_us = self.total_time_us();
        let (duty_cycle_percent, avg_power_mw) = if total_time_us > 0.0 {
            (
                (self.tx_time_us + self.rx_time_us) / total_time_us * 100.0,
                self.total_energy_mj / (total_time_us / 1_000_000.0),
            )
        } else {
            (0.0, 0.0)
        };
        EnergyStats {
            battery_level: self.battery_level,
            total_energy_mj: self.total_energy_mj,
            tx_time_us: self.tx_time_us,
            rx_time_us: self.rx_time_us,
            sleep_time_us: self.sleep_time_us,
            idle_time_us: self.idle_time_us,
            duty_cycle_percent,
            avg_power_mw,
            estimated_life_hours: self.estimate_battery_life_hours(self.capacity_mah()),
            current_state: self.current_state,
        }
    }

    /// Estimate battery life in hours for a cell of `capacity_mah` at the
    /// configured voltage, from the average power drawn so far.
    ///
    /// `None` when nothing has been consumed yet (unbounded life).
    pub fn estimate_battery_life_hours(&self, capacity_mah: f64) -> Option<f64> {
        let total_time_hours = self.total_time_us() / (1_000_000.0 * 3600.0);
        if self.total_energy_mj <= 0.0 || total_time_hours <= 0.0 {
            return None;
        }
        let energy_mwh = self.total_energy_mj / 3600.0;
        let avg_power_mw = energy_mwh / total_time_hours;
        let avg_current_ma = avg_power_mw / self.battery_voltage;
        if avg_current_ma > 0.0 { Some(capacity_mah / avg_current_ma) } else { None }
    }
}
