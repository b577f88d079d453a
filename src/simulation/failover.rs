//! Broker health monitoring, failover and relocation.
//!
//! Contains:
//! - `BrokerFailoverManager`: registry of node handles plus the failover
//!   state machine (`STABLE -> FAILOVER_IN_PROGRESS -> STABLE`)
//! - `FailoverOutcome`, `RelocationReport`, `FailoverReport`
//!
//! Failover and relocation are single-flight and exclude each other. Their
//! flags are checked and set under one lock; each pass works on a snapshot of
//! the registry so nodes can be added or removed while it runs.

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{BrokerConfig, FailoverConfig};

use super::mqtt::BrokerNetwork;
use super::node_task::NodeHandle;
use super::signal_calculations::{LinkChange, calculate_pdr, classify_link_change};
use super::types::{Area, Point, duration_to_secs};

/// Simulated round trip of one liveness check.
const PING_DELAY: Duration = Duration::from_millis(10);
/// Wave entries kept in reports.
const WAVE_TAIL: usize = 10;

/// Delay before reconnecting the `index`-th node of a wave:
/// 1, 2, 4, 8, 1, 2, ... units.
pub fn stagger_delay(index: usize, unit: Duration) -> Duration {
    let factor = (1u64 << (index % 4)).min(8);
    Duration::from_ticks(unit.as_ticks().saturating_mul(factor))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailoverStats {
    pub failovers: u64,
    pub broker_relocations: u64,
    pub coverage_changes: u64,
    pub nodes_disconnected: usize,
    pub nodes_reconnected: usize,
    pub reconnection_time_secs: f64,
    pub inflight_messages_preserved: usize,
    pub retained_messages_preserved: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    Completed { disconnected: usize, reconnected: usize, elapsed_secs: f64 },
    /// Another failover or a relocation was already running; nothing done.
    AlreadyInProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelocationReport {
    pub broker: String,
    pub old_position: Point,
    pub new_position: Point,
    pub offset: (f64, f64),
    pub nodes_affected: usize,
    pub nodes_disconnected: usize,
    pub nodes_improved: usize,
    pub nodes_degraded: usize,
    pub nodes_unchanged: usize,
}

/// Snapshot of the manager for queries and summaries.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverReport {
    pub stats: FailoverStats,
    pub current_broker: String,
    pub primary_alive: bool,
    pub failover_alive: bool,
    pub failover_in_progress: bool,
    pub relocation_in_progress: bool,
    pub nodes_registered: usize,
    pub broker_positions: BTreeMap<String, Point>,
    /// Last few (node_id, seconds since failover start) entries.
    pub reconnection_wave: Vec<(String, f64)>,
}

struct FailoverState {
    primary: String,
    failover: String,
    current: String,
    primary_alive: bool,
    failover_in_progress: bool,
    relocation_in_progress: bool,
    reconnection_wave: Vec<(String, f64)>,
    stats: FailoverStats,
}

impl FailoverState {
    fn busy(&self) -> bool {
        self.failover_in_progress || self.relocation_in_progress
    }
}

pub struct BrokerFailoverManager {
    brokers: Arc<BrokerNetwork>,
    area: Area,
    monitor_interval: Duration,
    stagger_unit: Duration,
    relocation_max_offset: f64,
    state: Mutex<CriticalSectionRawMutex, RefCell<FailoverState>>,
    nodes: Mutex<CriticalSectionRawMutex, RefCell<Vec<Arc<NodeHandle>>>>,
    rng: Mutex<CriticalSectionRawMutex, RefCell<StdRng>>,
}

impl BrokerFailoverManager {
    pub fn new(brokers: Arc<BrokerNetwork>, broker_config: &BrokerConfig, config: &FailoverConfig, area: Area, seed: u64) -> Self {
        Self {
            brokers,
            area,
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
            stagger_unit: Duration::from_millis(config.stagger_unit_ms),
            relocation_max_offset: config.relocation_max_offset,
            state: Mutex::new(RefCell::new(FailoverState {
                primary: broker_config.primary.clone(),
                failover: broker_config.failover.clone(),
                current: broker_config.primary.clone(),
                primary_alive: true,
                failover_in_progress: false,
                relocation_in_progress: false,
                reconnection_wave: Vec::new(),
                stats: FailoverStats::default(),
            })),
            nodes: Mutex::new(RefCell::new(Vec::new())),
            rng: Mutex::new(RefCell::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn register_node(&self, handle: Arc<NodeHandle>) {
        self.nodes.lock(|nodes| nodes.borrow_mut().push(handle));
    }

    /// Returns false when no node with that id was registered.
    pub fn unregister_node(&self, node_id: &str) -> bool {
        self.nodes.lock(|nodes| {
            let mut nodes = nodes.borrow_mut();
            let before = nodes.len();
            nodes.retain(|handle| handle.node_id() != node_id);
            nodes.len() != before
        })
    }

    pub fn find_node(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.nodes.lock(|nodes| nodes.borrow().iter().find(|h| h.node_id() == node_id).cloned())
    }

    /// Stable copy of the registry for one pass.
    pub fn snapshot(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.lock(|nodes| nodes.borrow().clone())
    }

    pub fn current_broker(&self) -> String {
        self.state.lock(|state| state.borrow().current.clone())
    }

    pub fn reconnection_wave(&self) -> Vec<(String, f64)> {
        self.state.lock(|state| state.borrow().reconnection_wave.clone())
    }

    /// Move every node from the primary to the failover broker.
    ///
    /// 1. Detection: connected nodes notice the outage; their in-flight and
    ///    retained counts are recorded.
    /// 2. Switch: the failover broker becomes current.
    /// 3. Reconnection: live nodes migrate one by one with a staggered delay,
    ///    each success appending to the reconnection wave.
    pub async fn trigger_failover(&self) -> FailoverOutcome {
        let claimed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.busy() {
                return None;
            }
            state.failover_in_progress = true;
            state.primary_alive = false;
            state.stats.failovers += 1;
            state.reconnection_wave.clear();
            Some((state.primary.clone(), state.failover.clone()))
        });
        let Some((primary, target)) = claimed else {
            log::debug!("[failover] Failover already in progress, request ignored");
            return FailoverOutcome::AlreadyInProgress;
        };

        let started = Instant::now();
        log::warn!("[failover] Broker failover initiated: {} is down, switching to {}", primary, target);

        // Detection
        let mut candidates = Vec::new();
        let mut disconnected = 0;
        let mut inflight_preserved = 0;
        let mut retained_preserved = 0;
        for handle in self.snapshot() {
            let mut node = handle.lock().await;
            if node.is_halted() {
                continue;
            }
            if let Some((inflight, retained)) = node.detect_broker_loss() {
                disconnected += 1;
                inflight_preserved += inflight;
                retained_preserved += retained;
            }
            drop(node);
            candidates.push(handle);
        }
        log::info!(
            "[failover] {} nodes detected the outage ({} inflight, {} retained messages preserved)",
            disconnected,
            inflight_preserved,
            retained_preserved
        );

        // Switch
        self.state.lock(|state| state.borrow_mut().current = target.clone());

        // Reconnection wave
        let mut reconnected = 0;
        for (index, handle) in candidates.iter().enumerate() {
            Timer::after(stagger_delay(index, self.stagger_unit)).await;
            let mut node = handle.lock().await;
            match node.migrate_to(&target, Instant::now()).await {
                Ok(true) => {
                    let elapsed = duration_to_secs(Instant::now().saturating_duration_since(started));
                    reconnected += 1;
                    self.state.lock(|state| state.borrow_mut().reconnection_wave.push((handle.node_id().to_string(), elapsed)));
                    log::info!("[{}] Reconnected to failover broker (t={:.2}s)", handle.node_id(), elapsed);
                }
                Ok(false) => log::warn!("[{}] Could not reach failover broker {}", handle.node_id(), target),
                Err(err) => log::debug!("[{}] Skipped in reconnection wave: {}", handle.node_id(), err),
            }
        }

        let elapsed_secs = duration_to_secs(Instant::now().saturating_duration_since(started));
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.stats.nodes_disconnected = disconnected;
            state.stats.nodes_reconnected = reconnected;
            state.stats.reconnection_time_secs = elapsed_secs;
            state.stats.inflight_messages_preserved = inflight_preserved;
            state.stats.retained_messages_preserved = retained_preserved;
            state.failover_in_progress = false;
        });
        log::warn!("[failover] Failover complete in {:.2}s: {}/{} nodes reconnected", elapsed_secs, reconnected, disconnected);

        FailoverOutcome::Completed {
            disconnected,
            reconnected,
            elapsed_secs,
        }
    }

    /// Take the primary down, then fail over.
    ///
    /// When a relocation is running the failover is refused; the primary
    /// stays marked alive, so the monitor picks it up on its next poll.
    pub async fn manual_failover(&self) -> FailoverOutcome {
        log::info!("[failover] Manual failover triggered");
        let primary = self.state.lock(|state| state.borrow().primary.clone());
        self.brokers.set_alive(&primary, false);
        self.trigger_failover().await
    }

    /// Check the primary once. Returns true when this check ran a failover.
    ///
    /// The primary is only recorded as down by a failover that actually
    /// started. A refused trigger leaves it marked alive, so the outage is
    /// seen again on the next poll.
    pub async fn monitor_once(&self) -> bool {
        Timer::after(PING_DELAY).await;
        let (primary, was_alive) = self.state.lock(|state| {
            let state = state.borrow();
            (state.primary.clone(), state.primary_alive)
        });

        if self.brokers.is_alive(&primary) {
            if !was_alive {
                self.state.lock(|state| state.borrow_mut().primary_alive = true);
                log::info!("[failover] Primary broker {} is UP", primary);
            }
            return false;
        }
        if !was_alive {
            return false;
        }

        log::warn!("[failover] Primary broker {} is DOWN", primary);
        match self.trigger_failover().await {
            FailoverOutcome::Completed { .. } => true,
            FailoverOutcome::AlreadyInProgress => {
                log::info!("[failover] Failover postponed, another transition is running");
                false
            }
        }
    }

    /// Poll primary liveness forever.
    pub async fn monitor_brokers(&self) {
        loop {
            Timer::after(self.monitor_interval).await;
            self.monitor_once().await;
        }
    }

    /// Move the current broker by `offset`, or by a random offset within the
    /// configured bound, and re-evaluate every node attached to it.
    ///
    /// Returns `None` when a relocation or failover is already running.
    pub async fn relocate_broker(&self, offset: Option<(f64, f64)>) -> Option<RelocationReport> {
        let claimed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.busy() {
                return None;
            }
            state.relocation_in_progress = true;
            state.stats.broker_relocations += 1;
            Some(state.current.clone())
        });
        let Some(broker) = claimed else {
            log::debug!("[failover] Relocation refused, another transition is running");
            return None;
        };

        let (dx, dy) = offset.unwrap_or_else(|| self.random_offset());
        let old_position = self.brokers.position(&broker).unwrap_or_else(|| self.area.center());
        let new_position = self.area.clamp(old_position.offset(dx, dy));
        self.brokers.set_position(&broker, new_position);
        log::warn!("[failover] Broker {} relocated {} -> {} (offset {:.1}m, {:.1}m)", broker, old_position, new_position, dx, dy);

        let mut report = RelocationReport {
            broker: broker.clone(),
            old_position,
            new_position,
            offset: (dx, dy),
            nodes_affected: 0,
            nodes_disconnected: 0,
            nodes_improved: 0,
            nodes_degraded: 0,
            nodes_unchanged: 0,
        };

        for handle in self.snapshot() {
            let mut node = handle.lock().await;
            if node.is_halted() || node.broker_address() != broker {
                continue;
            }
            let position = node.position();
            let old_distance = position.distance_to(&old_position);
            let new_distance = position.distance_to(&new_position);
            let max_range = node.max_range();

            if new_distance > max_range {
                if old_distance <= max_range {
                    report.nodes_affected += 1;
                    report.nodes_disconnected += 1;
                    node.force_disconnect();
                    log::warn!("[{}] Disconnected: out of range ({:.1}m > {:.0}m)", handle.node_id(), new_distance, max_range);
                }
                continue;
            }

            report.nodes_affected += 1;
            let old_pdr = calculate_pdr(old_distance, max_range, node.protocol());
            let new_pdr = calculate_pdr(new_distance, max_range, node.protocol());
            match classify_link_change(old_pdr, new_pdr) {
                LinkChange::Improved => report.nodes_improved += 1,
                LinkChange::Degraded => report.nodes_degraded += 1,
                LinkChange::Unchanged => report.nodes_unchanged += 1,
            }
            log::debug!(
                "[{}] Link {:?}: {:.1}m -> {:.1}m, PDR {:.1}% -> {:.1}%",
                handle.node_id(),
                classify_link_change(old_pdr, new_pdr),
                old_distance,
                new_distance,
                old_pdr * 100.0,
                new_pdr * 100.0
            );
        }

        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.stats.coverage_changes += 1;
            state.relocation_in_progress = false;
        });
        log::warn!(
            "[failover] Relocation complete: {} affected, {} disconnected, {} improved, {} degraded",
            report.nodes_affected,
            report.nodes_disconnected,
            report.nodes_improved,
            report.nodes_degraded
        );
        Some(report)
    }

    fn random_offset(&self) -> (f64, f64) {
        let bound = self.relocation_max_offset;
        if bound <= 0.0 {
            return (0.0, 0.0);
        }
        self.rng.lock(|rng| {
            let mut rng = rng.borrow_mut();
            (rng.gen_range(-bound..=bound), rng.gen_range(-bound..=bound))
        })
    }

    pub fn stats(&self) -> FailoverReport {
        let nodes_registered = self.nodes.lock(|nodes| nodes.borrow().len());
        self.state.lock(|state| {
            let state = state.borrow();
            let broker_positions = [&state.primary, &state.failover]
                .into_iter()
                .filter_map(|address| self.brokers.position(address).map(|p| (address.clone(), p)))
                .collect();
            let tail_start = state.reconnection_wave.len().saturating_sub(WAVE_TAIL);
            FailoverReport {
                stats: state.stats.clone(),
                current_broker: state.current.clone(),
                primary_alive: state.primary_alive,
                failover_alive: self.brokers.is_alive(&state.failover),
                failover_in_progress: state.failover_in_progress,
                relocation_in_progress: state.relocation_in_progress,
                nodes_registered,
                broker_positions,
                reconnection_wave: state.reconnection_wave[tail_start..].to_vec(),
            }
        })
    }
}
