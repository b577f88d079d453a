//! Discrete-time IoT MQTT network simulator.
//!
//! Sensor nodes publish over simulated BLE and WiFi links to a pair of MQTT
//! brokers; the simulation covers retries, energy drain, mobility, broker
//! failover and relocation. Time runs on a speed-scalable virtual clock.

pub mod config;
pub mod simulation;
pub mod time_driver;
