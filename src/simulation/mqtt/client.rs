//! Per-node MQTT client state machine.
//!
//! Implements QoS 0/1 publishing with in-flight tracking and DUP
//! retransmission, duplicate suppression on receipt, retained messages,
//! keep-alive pings, Last Will and Testament, persistent-session replay and
//! reconnection with exponential backoff. Network I/O goes through the shared
//! `BrokerNetwork`; a WAN hop in front of it adds latency and loss.
//!
//! Retransmit watchdogs are deadlines owned by the client and serviced from
//! the node loop, so nothing outlives the client.

use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::config::MqttConfig;
use crate::simulation::types::{QoS, duration_to_secs, secs_to_duration};

use super::broker::{BrokerNetwork, Inbound, Inbox, Will};
use super::message::MqttMessage;

/// Fixed cost of a connect handshake on top of WAN latency.
const CONNECT_DELAY: Duration = Duration::from_millis(10);
/// Fixed cost of one control packet on top of WAN latency.
const PACKET_DELAY: Duration = Duration::from_millis(1);
/// Recent QoS 1 ids remembered per publisher for duplicate detection. Far
/// more than a publisher can have in flight within its retransmit horizon.
const DEDUP_WINDOW: usize = 256;

pub type MessageCallback = Box<dyn FnMut(&MqttMessage) + Send>;

/// Exponential reconnect backoff: the delay doubles after every failed
/// attempt up to the ceiling, and everything resets on a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    ceiling: Duration,
    delay: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(floor: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            floor,
            ceiling,
            delay: floor,
            attempts: 0,
            max_attempts,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.delay
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_failure(&mut self) {
        let doubled = Duration::from_ticks(self.delay.as_ticks().saturating_mul(2));
        self.delay = doubled.min(self.ceiling);
    }

    pub fn reset(&mut self) {
        self.delay = self.floor;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Connected,
    Failed,
    /// The attempt budget is spent. Only `reset_reconnect` revives the client.
    Exhausted,
}

#[derive(Debug, Clone)]
struct InflightEntry {
    message: MqttMessage,
    deadline: Instant,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct BufferedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MqttStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub duplicates_received: u64,
    pub reconnections: u64,
    pub qos0_messages: u64,
    pub qos1_messages: u64,
    pub publish_failures: u64,
    pub retransmissions: u64,
    pub inflight_dropped: u64,
    pub pubacks_received: u64,
    /// PUBACKs returned for QoS 1 deliveries.
    pub pubacks_sent: u64,
    pub wan_losses: u64,
    pub retained_delivered: u64,
    pub session_replays: u64,
    /// Offline publishes discarded because the session buffer was full.
    pub session_buffer_dropped: u64,
    pub pings_sent: u64,
    pub keep_alive_timeouts: u64,
    pub connected: bool,
    pub inflight_messages: usize,
    pub subscriptions: usize,
    pub reconnect_attempts: u32,
    pub broker: String,
}

pub struct MqttClient {
    client_id: String,
    broker_address: String,
    brokers: Arc<BrokerNetwork>,
    keep_alive: Duration,
    clean_session: bool,
    default_qos: QoS,
    retransmit_delay: Duration,
    max_retransmits: u32,
    connected: bool,
    inbox: Arc<Inbox>,
    last_activity: Instant,
    last_ping: Instant,
    lwt: Will,
    next_msg_id: u32,
    inflight: BTreeMap<u32, InflightEntry>,
    received_ids: HashMap<String, VecDeque<u32>>,
    subscriptions: BTreeMap<String, QoS>,
    session_buffer: VecDeque<BufferedPublish>,
    max_session_buffer: usize,
    retained: HashMap<String, MqttMessage>,
    backoff: ReconnectBackoff,
    wan_latency: Duration,
    wan_loss: f64,
    on_message: Option<MessageCallback>,
    stats: MqttStats,
    rng: StdRng,
}

impl MqttClient {
    pub fn new(client_id: &str, broker_address: &str, brokers: Arc<BrokerNetwork>, config: &MqttConfig, seed: u64) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.to_string(),
            broker_address: broker_address.to_string(),
            brokers,
            keep_alive: secs_to_duration(config.keep_alive_secs),
            clean_session: config.clean_session,
            default_qos: config.default_qos,
            retransmit_delay: secs_to_duration(config.retransmit_delay_secs),
            max_retransmits: config.max_retransmits,
            connected: false,
            inbox: Arc::new(Inbox::new()),
            last_activity: now,
            last_ping: now,
            lwt: Will {
                topic: format!("nodes/{client_id}/status"),
                payload: b"offline".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            },
            next_msg_id: 1,
            inflight: BTreeMap::new(),
            received_ids: HashMap::new(),
            subscriptions: BTreeMap::new(),
            session_buffer: VecDeque::new(),
            max_session_buffer: config.max_session_buffer,
            retained: HashMap::new(),
            backoff: ReconnectBackoff::new(
                secs_to_duration(config.reconnect_min_secs),
                secs_to_duration(config.reconnect_max_secs),
                config.max_reconnect_attempts,
            ),
            wan_latency: Duration::from_ticks(0),
            wan_loss: 0.0,
            on_message: None,
            stats: MqttStats::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    /// Point the client at another broker. Takes effect on the next connect.
    pub fn set_broker(&mut self, broker_address: &str) {
        self.broker_address = broker_address.to_string();
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn default_qos(&self) -> QoS {
        self.default_qos
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_inflight(&self, msg_id: u32) -> bool {
        self.inflight.contains_key(&msg_id)
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub fn retained(&self, topic: &str) -> Option<&MqttMessage> {
        self.retained.get(topic)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.iter().map(|(f, q)| (f.clone(), *q)).collect()
    }

    pub fn set_on_message(&mut self, callback: MessageCallback) {
        self.on_message = Some(callback);
    }

    /// Configure the gateway/cloud hop in front of the broker.
    pub fn set_wan(&mut self, latency_ms: u64, loss: f64) {
        self.wan_latency = Duration::from_millis(latency_ms);
        self.wan_loss = loss.clamp(0.0, 1.0);
        log::debug!("[{}] WAN configured: {}ms latency, {:.1}% loss", self.client_id, latency_ms, self.wan_loss * 100.0);
    }

    pub fn set_lwt(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        self.lwt = Will {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
    }

    pub fn lwt_topic(&self) -> &str {
        &self.lwt.topic
    }

    fn wan_drop(&mut self) -> bool {
        self.wan_loss > 0.0 && self.rng.gen_range(0.0..1.0) < self.wan_loss
    }

    /// Connect to the current broker.
    ///
    /// On success the backoff is reset, the retained "online" status is
    /// published on the LWT topic and, for persistent sessions, publishes
    /// buffered while offline are replayed in order.
    pub async fn connect(&mut self) -> bool {
        Timer::after(CONNECT_DELAY + self.wan_latency).await;
        if self.wan_drop() {
            self.stats.wan_losses += 1;
            log::debug!("[{}] Connect packet lost on WAN", self.client_id);
            return false;
        }
        let will = Some(self.lwt.clone());
        match self.brokers.connect(&self.broker_address, &self.client_id, self.clean_session, will, self.inbox.clone()) {
            Ok(resumed) => {
                log::info!("[{}] Connected to {}{}", self.client_id, self.broker_address, if resumed { " (session resumed)" } else { "" });
            }
            Err(err) => {
                log::debug!("[{}] Connect to {} failed: {}", self.client_id, self.broker_address, err);
                return false;
            }
        }

        let now = Instant::now();
        self.connected = true;
        self.last_activity = now;
        self.last_ping = now;
        self.backoff.reset();

        let topic = self.lwt.topic.clone();
        self.publish(&topic, b"online", QoS::AtLeastOnce, true).await;

        if !self.clean_session && !self.session_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.session_buffer);
            log::info!("[{}] Restoring {} session messages", self.client_id, buffered.len());
            for entry in buffered {
                self.stats.session_replays += 1;
                self.publish(&entry.topic, &entry.payload, entry.qos, entry.retain).await;
            }
        }
        true
    }

    /// Close the connection. `send_lwt` marks it abnormal so the broker
    /// publishes the will.
    pub fn disconnect(&mut self, send_lwt: bool) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.brokers.disconnect(&self.broker_address, &self.client_id, !send_lwt);
        if send_lwt {
            log::warn!("[{}] Abnormal disconnect, LWT sent on {}", self.client_id, self.lwt.topic);
        } else {
            log::info!("[{}] Disconnected", self.client_id);
        }
    }

    /// Note a lost connection without talking to the broker.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Publish a message. Returns false when it did not reach the broker.
    ///
    /// QoS 1 messages stay in flight until acknowledged, so a false return
    /// for them only means the first transmission was lost.
    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> bool {
        if !self.connected {
            self.stats.publish_failures += 1;
            if !self.clean_session {
                self.buffer_offline_publish(BufferedPublish {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos,
                    retain,
                });
            }
            return false;
        }

        let now = Instant::now();
        let msg_id = match qos {
            QoS::AtLeastOnce => {
                let id = self.next_msg_id;
                self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
                id
            }
            QoS::AtMostOnce => 0,
        };
        let message = MqttMessage::new(&self.client_id, msg_id, topic, payload, qos, retain, now);

        if retain {
            self.retained.insert(topic.to_string(), message.clone());
        }
        match qos {
            QoS::AtLeastOnce => {
                self.inflight.insert(
                    msg_id,
                    InflightEntry {
                        message: message.clone(),
                        deadline: now + self.retransmit_delay,
                        attempts: 0,
                    },
                );
                self.stats.qos1_messages += 1;
            }
            QoS::AtMostOnce => self.stats.qos0_messages += 1,
        }
        self.stats.messages_sent += 1;

        self.transmit(&message).await
    }

    /// Keep a publish for replay on reconnect, dropping the oldest entry
    /// once the buffer is full.
    fn buffer_offline_publish(&mut self, entry: BufferedPublish) {
        if self.max_session_buffer == 0 {
            self.stats.session_buffer_dropped += 1;
            return;
        }
        if self.session_buffer.len() >= self.max_session_buffer {
            self.session_buffer.pop_front();
            self.stats.session_buffer_dropped += 1;
            log::debug!("[{}] Session buffer full, oldest publish dropped", self.client_id);
        }
        self.session_buffer.push_back(entry);
    }

    /// Carry one publish over the WAN hop to the broker.
    async fn transmit(&mut self, message: &MqttMessage) -> bool {
        Timer::after(PACKET_DELAY + self.wan_latency).await;
        if self.wan_drop() {
            self.stats.wan_losses += 1;
            log::debug!("[{}] Message lost on WAN (topic: {}, QoS: {})", self.client_id, message.topic, u8::from(message.qos));
            return false;
        }
        if self.brokers.publish(&self.broker_address, message) {
            self.last_activity = Instant::now();
            true
        } else {
            false
        }
    }

    /// Re-send in-flight QoS 1 messages whose ACK deadline has passed.
    ///
    /// Each entry is retransmitted with DUP set up to `max_retransmits`
    /// times, then dropped. Returns the number of retransmissions.
    pub async fn service_retransmits(&mut self, now: Instant) -> usize {
        if !self.connected {
            return 0;
        }
        let due: Vec<u32> = self.inflight.iter().filter(|(_, e)| e.deadline <= now).map(|(id, _)| *id).collect();
        let mut sent = 0;
        for msg_id in due {
            let Some(entry) = self.inflight.get_mut(&msg_id) else {
                continue;
            };
            if entry.attempts >= self.max_retransmits {
                self.inflight.remove(&msg_id);
                self.stats.inflight_dropped += 1;
                log::warn!("[{}] Giving up on msg_id {} after {} retransmissions", self.client_id, msg_id, self.max_retransmits);
                continue;
            }
            entry.attempts += 1;
            entry.deadline = now + self.retransmit_delay;
            entry.message.dup = true;
            let message = entry.message.clone();
            self.stats.retransmissions += 1;
            log::debug!("[{}] QoS 1 retransmit (DUP=1) for msg_id {}", self.client_id, msg_id);
            self.transmit(&message).await;
            sent += 1;
        }
        sent
    }

    /// Mark every in-flight message as due now, with DUP set.
    pub fn flag_inflight_for_resend(&mut self, now: Instant) -> usize {
        for entry in self.inflight.values_mut() {
            entry.message.dup = true;
            entry.deadline = now;
        }
        self.inflight.len()
    }

    /// Subscribe to a topic filter on the current broker.
    ///
    /// Adding a filter not yet in the subscription set delivers matching
    /// retained messages to the callback once.
    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> bool {
        if !self.connected {
            return false;
        }
        Timer::after(PACKET_DELAY).await;
        let Some(retained) = self.brokers.subscribe(&self.broker_address, &self.client_id, filter, qos) else {
            return false;
        };
        let is_new = self.subscriptions.insert(filter.to_string(), qos).is_none();
        if is_new {
            log::debug!("[{}] Subscribed to {}", self.client_id, filter);
            for message in retained {
                self.stats.retained_delivered += 1;
                if let Some(callback) = self.on_message.as_mut() {
                    callback(&message);
                }
            }
        }
        true
    }

    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        let removed = self.subscriptions.remove(filter).is_some();
        if self.connected {
            self.brokers.unsubscribe(&self.broker_address, &self.client_id, filter);
        }
        removed
    }

    /// Handle a routed publish. Returns true when it was delivered, false for
    /// a suppressed duplicate.
    ///
    /// A new QoS 1 id is acknowledged to the broker. Ids are remembered per
    /// publisher for the last `DEDUP_WINDOW` messages.
    pub fn handle_message(&mut self, message: &MqttMessage) -> bool {
        if message.qos == QoS::AtLeastOnce {
            let seen = self.received_ids.entry(message.publisher.clone()).or_default();
            if seen.contains(&message.msg_id) {
                self.stats.duplicates_received += 1;
                log::debug!("[{}] Duplicate message {} from {} detected", self.client_id, message.msg_id, message.publisher);
                return false;
            }
            if seen.len() >= DEDUP_WINDOW {
                seen.pop_front();
            }
            seen.push_back(message.msg_id);

            self.stats.pubacks_sent += 1;
            if self.connected {
                self.brokers.subscriber_ack(&self.broker_address, &self.client_id);
            }
        }
        self.stats.messages_received += 1;
        if let Some(callback) = self.on_message.as_mut() {
            callback(message);
        }
        true
    }

    /// Clear an acknowledged in-flight message. Unknown ids are ignored.
    pub fn handle_puback(&mut self, msg_id: u32) {
        if self.inflight.remove(&msg_id).is_some() {
            self.stats.pubacks_received += 1;
        }
    }

    /// Drain everything the broker delivered since the last call.
    /// Returns the messages handed to the application.
    pub fn process_inbox(&mut self) -> Vec<MqttMessage> {
        let mut delivered = Vec::new();
        while let Ok(item) = self.inbox.try_receive() {
            match item {
                Inbound::Publish(message) => {
                    if self.handle_message(&message) {
                        delivered.push(message);
                    }
                }
                Inbound::PubAck(msg_id) => self.handle_puback(msg_id),
            }
        }
        delivered
    }

    /// Send PINGREQ when a keep-alive interval has passed. Returns whether
    /// the broker answered.
    pub async fn send_ping(&mut self, now: Instant) -> bool {
        if !self.connected || now.saturating_duration_since(self.last_ping) < self.keep_alive {
            return false;
        }
        self.last_ping = now;
        self.stats.pings_sent += 1;
        Timer::after(PACKET_DELAY + self.wan_latency).await;
        if self.brokers.ping(&self.broker_address, &self.client_id) {
            self.last_activity = Instant::now();
            true
        } else {
            log::debug!("[{}] PINGREQ unanswered", self.client_id);
            false
        }
    }

    /// Check the keep-alive budget. After 1.5 intervals without activity the
    /// connection is closed abnormally.
    pub fn check_connection(&mut self, now: Instant) -> bool {
        if !self.connected {
            return false;
        }
        let timeout = secs_to_duration(duration_to_secs(self.keep_alive) * 1.5);
        if now.saturating_duration_since(self.last_activity) > timeout {
            self.stats.keep_alive_timeouts += 1;
            log::warn!("[{}] Keep-alive timeout", self.client_id);
            self.disconnect(true);
            return false;
        }
        true
    }

    /// Delay before the next reconnect attempt, `None` once exhausted.
    pub fn next_reconnect_delay(&self) -> Option<Duration> {
        if self.backoff.is_exhausted() { None } else { Some(self.backoff.next_delay()) }
    }

    /// One reconnect attempt without the backoff wait.
    pub async fn attempt_reconnect(&mut self) -> ReconnectOutcome {
        if self.backoff.is_exhausted() {
            return ReconnectOutcome::Exhausted;
        }
        self.backoff.record_attempt();
        log::info!(
            "[{}] Reconnect attempt {} (delay: {:.1}s)",
            self.client_id,
            self.backoff.attempts(),
            duration_to_secs(self.backoff.next_delay())
        );
        if self.connect().await {
            self.stats.reconnections += 1;
            return ReconnectOutcome::Connected;
        }
        self.backoff.record_failure();
        if self.backoff.is_exhausted() {
            log::warn!("[{}] Reconnect attempts exhausted", self.client_id);
            ReconnectOutcome::Exhausted
        } else {
            ReconnectOutcome::Failed
        }
    }

    /// Wait out the backoff delay, then attempt to reconnect.
    pub async fn reconnect(&mut self) -> ReconnectOutcome {
        let Some(delay) = self.next_reconnect_delay() else {
            return ReconnectOutcome::Exhausted;
        };
        Timer::after(delay).await;
        self.attempt_reconnect().await
    }

    /// Manual reset after exhaustion.
    pub fn reset_reconnect(&mut self) {
        self.backoff.reset();
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn stats(&self) -> MqttStats {
        MqttStats {
            connected: self.connected,
            inflight_messages: self.inflight.len(),
            subscriptions: self.subscriptions.len(),
            reconnect_attempts: self.backoff.attempts(),
            broker: self.broker_address.clone(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::Point;
    use futures::executor::block_on;
    use std::sync::Mutex;

    const PRIMARY: &str = "localhost:1883";

    fn quick_config() -> MqttConfig {
        MqttConfig {
            clean_session: false,
            ..Default::default()
        }
    }

    fn network() -> Arc<BrokerNetwork> {
        let network = Arc::new(BrokerNetwork::new());
        network.add_broker(PRIMARY, Point::new(500.0, 500.0));
        network
    }

    fn sensor_message(publisher: &str, msg_id: u32) -> MqttMessage {
        MqttMessage::new(publisher, msg_id, "sensors/p/data", b"temp:20.0", QoS::AtLeastOnce, false, Instant::now())
    }

    #[test]
    fn duplicate_qos1_message_delivered_once() {
        let mut client = MqttClient::new("sub", PRIMARY, network(), &quick_config(), 1);
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        client.set_on_message(Box::new(move |_| *counter.lock().unwrap() += 1));

        let message = sensor_message("pub", 42);
        assert!(client.handle_message(&message));
        let mut dup = message.clone();
        dup.dup = true;
        assert!(!client.handle_message(&dup));

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(client.stats().duplicates_received, 1);
        assert_eq!(client.stats().messages_received, 1);

        // Same id from another publisher is a different message
        assert!(client.handle_message(&sensor_message("other", 42)));
        assert_eq!(client.stats().pubacks_sent, 2);
    }

    #[test]
    fn dedup_memory_is_bounded_per_publisher() {
        let mut client = MqttClient::new("sub", PRIMARY, network(), &quick_config(), 1);
        let last = DEDUP_WINDOW as u32 + 10;
        for msg_id in 1..=last {
            assert!(client.handle_message(&sensor_message("pub", msg_id)));
        }
        assert_eq!(client.received_ids["pub"].len(), DEDUP_WINDOW);
        // Recent ids are still recognized
        assert!(!client.handle_message(&sensor_message("pub", last)));
        assert_eq!(client.stats().duplicates_received, 1);
        assert_eq!(client.stats().pubacks_sent, u64::from(last));
    }

    #[test]
    fn puback_clears_inflight_and_unknown_ids_are_ignored() {
        let network = network();
        let mut client = MqttClient::new("pub", PRIMARY, network, &quick_config(), 1);
        block_on(async {
            assert!(client.connect().await);
            assert!(client.publish("sensors/pub/data", b"x", QoS::AtLeastOnce, false).await);
        });
        // Online status (id 1) and the sensor reading (id 2) are in flight
        assert_eq!(client.inflight_count(), 2);
        client.handle_puback(999);
        assert_eq!(client.inflight_count(), 2);
        client.process_inbox();
        assert_eq!(client.inflight_count(), 0);
        assert_eq!(client.stats().pubacks_received, 2);
    }

    #[test]
    fn qos0_does_not_consume_ids() {
        let mut client = MqttClient::new("pub", PRIMARY, network(), &quick_config(), 1);
        block_on(async {
            client.connect().await;
            client.publish("a", b"0", QoS::AtMostOnce, false).await;
            client.publish("a", b"1", QoS::AtLeastOnce, false).await;
        });
        // Online status took id 1, the QoS 1 publish took id 2
        assert!(client.is_inflight(2));
        assert_eq!(client.stats().qos0_messages, 1);
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 10);
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.next_delay().as_secs());
            backoff.record_attempt();
            backoff.record_failure();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.attempts(), 8);
        assert!(!backoff.is_exhausted());
        backoff.record_attempt();
        backoff.record_attempt();
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_attempts_reset_only_on_success() {
        let network = network();
        network.set_alive(PRIMARY, false);
        let mut client = MqttClient::new("n", PRIMARY, network.clone(), &quick_config(), 1);
        block_on(async {
            assert_eq!(client.attempt_reconnect().await, ReconnectOutcome::Failed);
            assert_eq!(client.attempt_reconnect().await, ReconnectOutcome::Failed);
        });
        assert_eq!(client.reconnect_attempts(), 2);
        assert_eq!(client.next_reconnect_delay(), Some(Duration::from_secs(4)));

        network.set_alive(PRIMARY, true);
        assert_eq!(block_on(client.attempt_reconnect()), ReconnectOutcome::Connected);
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(client.next_reconnect_delay(), Some(Duration::from_secs(1)));
        assert_eq!(client.stats().reconnections, 1);
    }

    #[test]
    fn reconnect_exhaustion_is_sticky_until_reset() {
        let network = network();
        network.set_alive(PRIMARY, false);
        let config = MqttConfig {
            max_reconnect_attempts: 2,
            ..quick_config()
        };
        let mut client = MqttClient::new("n", PRIMARY, network.clone(), &config, 1);
        block_on(async {
            assert_eq!(client.attempt_reconnect().await, ReconnectOutcome::Failed);
            assert_eq!(client.attempt_reconnect().await, ReconnectOutcome::Exhausted);
        });
        network.set_alive(PRIMARY, true);
        assert_eq!(block_on(client.attempt_reconnect()), ReconnectOutcome::Exhausted);
        assert_eq!(client.next_reconnect_delay(), None);
        client.reset_reconnect();
        assert_eq!(block_on(client.attempt_reconnect()), ReconnectOutcome::Connected);
    }

    #[test]
    fn persistent_session_replays_buffered_publishes_in_order() {
        let network = network();
        let mut subscriber = MqttClient::new("sub", PRIMARY, network.clone(), &quick_config(), 2);
        let mut publisher = MqttClient::new("pub", PRIMARY, network.clone(), &quick_config(), 3);
        block_on(async {
            assert!(subscriber.connect().await);
            assert!(subscriber.subscribe("sensors/+/data", QoS::AtLeastOnce).await);
            for i in 0..3 {
                let payload = format!("reading-{i}");
                assert!(!publisher.publish("sensors/pub/data", payload.as_bytes(), QoS::AtLeastOnce, false).await);
            }
            assert_eq!(publisher.stats().publish_failures, 3);
            assert!(publisher.connect().await);
        });

        let delivered = subscriber.process_inbox();
        let payloads: Vec<String> = delivered.iter().filter(|m| m.topic.starts_with("sensors/")).map(|m| m.payload_str().into_owned()).collect();
        assert_eq!(payloads, vec!["reading-0", "reading-1", "reading-2"]);
        assert_eq!(publisher.stats().session_replays, 3);
        // Each QoS 1 delivery is acknowledged by the subscriber
        assert_eq!(subscriber.stats().pubacks_sent, 3);
        assert_eq!(network.stats(PRIMARY).unwrap().pubacks_received, 3);
    }

    #[test]
    fn session_buffer_keeps_only_the_newest_publishes() {
        let network = network();
        let config = MqttConfig {
            max_session_buffer: 2,
            ..quick_config()
        };
        let mut subscriber = MqttClient::new("sub", PRIMARY, network.clone(), &config, 2);
        let mut publisher = MqttClient::new("pub", PRIMARY, network.clone(), &config, 3);
        block_on(async {
            assert!(subscriber.connect().await);
            assert!(subscriber.subscribe("sensors/+/data", QoS::AtLeastOnce).await);
            for i in 0..5 {
                let payload = format!("reading-{i}");
                publisher.publish("sensors/pub/data", payload.as_bytes(), QoS::AtLeastOnce, false).await;
            }
            assert!(publisher.connect().await);
        });

        let payloads: Vec<String> = subscriber
            .process_inbox()
            .iter()
            .filter(|m| m.topic.starts_with("sensors/"))
            .map(|m| m.payload_str().into_owned())
            .collect();
        assert_eq!(payloads, vec!["reading-3", "reading-4"]);
        let stats = publisher.stats();
        assert_eq!(stats.session_buffer_dropped, 3);
        assert_eq!(stats.session_replays, 2);
        assert_eq!(stats.publish_failures, 5);
    }

    #[test]
    fn retained_delivered_once_on_new_subscription() {
        let network = network();
        let mut publisher = MqttClient::new("pub", PRIMARY, network.clone(), &quick_config(), 1);
        let mut subscriber = MqttClient::new("sub", PRIMARY, network.clone(), &quick_config(), 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        subscriber.set_on_message(Box::new(move |m| sink.lock().unwrap().push(m.topic.clone())));
        block_on(async {
            publisher.connect().await;
            subscriber.connect().await;
            assert!(subscriber.subscribe("nodes/+/status", QoS::AtLeastOnce).await);
            // Re-subscribing the same filter does not redeliver
            assert!(subscriber.subscribe("nodes/+/status", QoS::AtLeastOnce).await);
        });
        let topics = seen.lock().unwrap().clone();
        assert_eq!(topics.iter().filter(|t| t.as_str() == "nodes/pub/status").count(), 1);
        assert_eq!(publisher.retained("nodes/pub/status").map(|m| m.payload.clone()), Some(b"online".to_vec()));
    }

    #[test]
    fn unacknowledged_message_dropped_after_max_retransmits() {
        let network = network();
        let config = MqttConfig {
            max_retransmits: 2,
            ..quick_config()
        };
        let mut client = MqttClient::new("pub", PRIMARY, network.clone(), &config, 1);
        block_on(client.connect());
        client.process_inbox();
        assert_eq!(client.inflight_count(), 0);

        // The broker goes away: publishes are never acknowledged
        network.set_alive(PRIMARY, false);
        block_on(client.publish("sensors/pub/data", b"x", QoS::AtLeastOnce, false));
        assert_eq!(client.inflight_count(), 1);

        let mut now = Instant::now();
        for _ in 0..3 {
            now += Duration::from_secs(4);
            block_on(client.service_retransmits(now));
        }
        assert_eq!(client.inflight_count(), 0);
        let stats = client.stats();
        assert_eq!(stats.retransmissions, 2);
        assert_eq!(stats.inflight_dropped, 1);
    }

    #[test]
    fn keep_alive_timeout_forces_abnormal_disconnect() {
        let network = network();
        let mut client = MqttClient::new("n", PRIMARY, network.clone(), &quick_config(), 1);
        block_on(client.connect());
        let start = Instant::now();
        assert!(client.check_connection(start + Duration::from_secs(80)));
        assert!(!client.check_connection(start + Duration::from_secs(95)));
        assert!(!client.is_connected());
        assert_eq!(client.stats().keep_alive_timeouts, 1);
    }

    #[test]
    fn custom_will_replaces_offline_status() {
        let network = network();
        let mut node = MqttClient::new("n", PRIMARY, network.clone(), &quick_config(), 1);
        let mut watcher = MqttClient::new("w", PRIMARY, network, &quick_config(), 2);
        node.set_lwt("alerts/n", b"gone", QoS::AtMostOnce, false);
        assert_eq!(node.lwt_topic(), "alerts/n");

        block_on(async {
            assert!(watcher.connect().await);
            assert!(watcher.subscribe("alerts/#", QoS::AtLeastOnce).await);
            assert!(node.connect().await);
        });
        node.disconnect(true);

        let received = watcher.process_inbox();
        let payloads: Vec<_> = received.iter().map(|m| m.payload_str().into_owned()).collect();
        // "online" is published on the will topic at connect
        assert_eq!(payloads, vec!["online", "gone"]);
    }

    #[test]
    fn publish_while_disconnected_counts_failure() {
        let config = MqttConfig {
            clean_session: true,
            ..Default::default()
        };
        let mut client = MqttClient::new("n", PRIMARY, network(), &config, 1);
        assert!(!block_on(client.publish("t", b"x", QoS::AtMostOnce, false)));
        assert_eq!(client.stats().publish_failures, 1);
        // Clean sessions do not buffer
        assert!(block_on(client.connect()));
        assert_eq!(client.stats().session_replays, 0);
    }
}
