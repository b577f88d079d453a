//! In-process stand-in for the MQTT brokers.
//!
//! Holds every broker's sessions, subscriptions and retained store. Clients
//! hand over a bounded inbox when they connect; routed publishes and PUBACKs
//! land there and are drained by the owning node on its next tick. A broker
//! that is marked down refuses every operation.

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::simulation::types::{Point, QoS};

use super::message::{MqttMessage, topic_matches};

/// Capacity of each client's inbox.
pub const CLIENT_INBOX_SIZE: usize = 64;

/// Something the broker delivers to a client.
#[derive(Debug, Clone)]
pub enum Inbound {
    Publish(MqttMessage),
    PubAck(u32),
}

pub type Inbox = Channel<CriticalSectionRawMutex, Inbound, CLIENT_INBOX_SIZE>;

/// Last Will and Testament registered at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    Unknown,
    Down,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unknown => write!(f, "unknown broker"),
            BrokerError::Down => write!(f, "broker down"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub messages_received: u64,
    pub messages_routed: u64,
    pub pubacks_sent: u64,
    /// Acknowledgements from subscribers for QoS 1 deliveries.
    pub pubacks_received: u64,
    pub inbox_drops: u64,
    pub wills_published: u64,
    pub connects: u64,
    pub connected_clients: usize,
    pub retained_messages: usize,
}

struct Session {
    inbox: Arc<Inbox>,
    subscriptions: BTreeMap<String, QoS>,
    will: Option<Will>,
    connected: bool,
    clean_session: bool,
}

struct BrokerState {
    alive: bool,
    position: Point,
    sessions: HashMap<String, Session>,
    retained: BTreeMap<String, MqttMessage>,
    stats: BrokerStats,
}

impl BrokerState {
    fn deliver(stats: &mut BrokerStats, inbox: &Inbox, item: Inbound) {
        if inbox.try_send(item).is_err() {
            stats.inbox_drops += 1;
        }
    }

    /// Store retained state and fan out to matching subscribers.
    fn route(&mut self, message: &MqttMessage) {
        self.stats.messages_received += 1;
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained.insert(message.topic.clone(), message.clone());
            }
        }

        for (client_id, session) in self.sessions.iter() {
            if *client_id == message.publisher {
                continue;
            }
            let Some(granted) = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, qos)| *qos)
                .max()
            else {
                continue;
            };
            let qos = granted.min(message.qos);
            // Offline persistent sessions keep their QoS 1 traffic queued
            if !session.connected && (session.clean_session || qos == QoS::AtMostOnce) {
                continue;
            }
            let mut delivered = message.clone();
            delivered.qos = qos;
            delivered.retain = false;
            if qos == QoS::AtMostOnce {
                delivered.msg_id = 0;
            }
            Self::deliver(&mut self.stats, &session.inbox, Inbound::Publish(delivered));
            self.stats.messages_routed += 1;
        }
    }
}

/// All simulated brokers, keyed by address.
pub struct BrokerNetwork {
    brokers: Mutex<CriticalSectionRawMutex, RefCell<HashMap<String, BrokerState>>>,
}

impl Default for BrokerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerNetwork {
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(RefCell::new(HashMap::new())),
        }
    }

    fn with_broker<R>(&self, address: &str, f: impl FnOnce(&mut BrokerState) -> R) -> Option<R> {
        self.brokers.lock(|brokers| brokers.borrow_mut().get_mut(address).map(f))
    }

    /// Run `f` against a broker that is up.
    fn with_live_broker<R>(&self, address: &str, f: impl FnOnce(&mut BrokerState) -> R) -> Result<R, BrokerError> {
        self.brokers.lock(|brokers| {
            let mut brokers = brokers.borrow_mut();
            let broker = brokers.get_mut(address).ok_or(BrokerError::Unknown)?;
            if !broker.alive {
                return Err(BrokerError::Down);
            }
            Ok(f(broker))
        })
    }

    pub fn add_broker(&self, address: &str, position: Point) {
        self.brokers.lock(|brokers| {
            brokers.borrow_mut().insert(
                address.to_string(),
                BrokerState {
                    alive: true,
                    position,
                    sessions: HashMap::new(),
                    retained: BTreeMap::new(),
                    stats: BrokerStats::default(),
                },
            );
        });
    }

    /// Mark a broker up or down. Going down drops every live connection.
    pub fn set_alive(&self, address: &str, alive: bool) {
        let changed = self.with_broker(address, |broker| {
            let changed = broker.alive != alive;
            broker.alive = alive;
            if !alive {
                for session in broker.sessions.values_mut() {
                    session.connected = false;
                }
            }
            changed
        });
        if changed == Some(true) {
            log::info!("Broker {} is now {}", address, if alive { "up" } else { "down" });
        }
    }

    pub fn is_alive(&self, address: &str) -> bool {
        self.with_broker(address, |broker| broker.alive).unwrap_or(false)
    }

    pub fn position(&self, address: &str) -> Option<Point> {
        self.with_broker(address, |broker| broker.position)
    }

    pub fn set_position(&self, address: &str, position: Point) -> bool {
        self.with_broker(address, |broker| broker.position = position).is_some()
    }

    /// Open (or resume) a session. Returns whether a previous session was resumed.
    pub fn connect(&self, address: &str, client_id: &str, clean_session: bool, will: Option<Will>, inbox: Arc<Inbox>) -> Result<bool, BrokerError> {
        self.with_live_broker(address, |broker| {
            broker.stats.connects += 1;
            let resumed = match broker.sessions.get_mut(client_id) {
                Some(session) if !clean_session && !session.clean_session => {
                    session.connected = true;
                    session.will = will.clone();
                    session.inbox = inbox.clone();
                    true
                }
                _ => false,
            };
            if !resumed {
                broker.sessions.insert(
                    client_id.to_string(),
                    Session {
                        inbox,
                        subscriptions: BTreeMap::new(),
                        will,
                        connected: true,
                        clean_session,
                    },
                );
            }
            resumed
        })
    }

    /// Close a client's connection. An abnormal close publishes its will.
    pub fn disconnect(&self, address: &str, client_id: &str, graceful: bool) {
        let _ = self.with_live_broker(address, |broker| {
            let Some(session) = broker.sessions.get_mut(client_id) else {
                return;
            };
            if !session.connected {
                return;
            }
            session.connected = false;
            let will = if graceful { None } else { session.will.clone() };
            let clean = session.clean_session;
            if clean {
                broker.sessions.remove(client_id);
            }
            if let Some(will) = will {
                let message = MqttMessage {
                    msg_id: 0,
                    topic: will.topic,
                    payload: will.payload,
                    qos: will.qos,
                    retain: will.retain,
                    dup: false,
                    timestamp: embassy_time::Instant::now(),
                    publisher: client_id.to_string(),
                };
                broker.stats.wills_published += 1;
                log::debug!("[{}] Will published on {}", client_id, message.topic);
                broker.route(&message);
            }
        });
    }

    /// Accept a publish from a connected client. QoS 1 publishes are
    /// acknowledged into the publisher's inbox.
    pub fn publish(&self, address: &str, message: &MqttMessage) -> bool {
        self.with_live_broker(address, |broker| {
            let Some(session) = broker.sessions.get(&message.publisher) else {
                return false;
            };
            if !session.connected {
                return false;
            }
            let publisher_inbox = session.inbox.clone();
            broker.route(message);
            if message.qos == QoS::AtLeastOnce {
                broker.stats.pubacks_sent += 1;
                BrokerState::deliver(&mut broker.stats, &publisher_inbox, Inbound::PubAck(message.msg_id));
            }
            true
        })
        .unwrap_or(false)
    }

    /// PUBACK from a subscriber for a QoS 1 delivery. False when the
    /// broker is down or the session is not connected.
    pub fn subscriber_ack(&self, address: &str, client_id: &str) -> bool {
        self.with_live_broker(address, |broker| {
            if !broker.sessions.get(client_id).is_some_and(|s| s.connected) {
                return false;
            }
            broker.stats.pubacks_received += 1;
            true
        })
        .unwrap_or(false)
    }

    /// Register a subscription. Returns the retained messages matching it.
    pub fn subscribe(&self, address: &str, client_id: &str, filter: &str, qos: QoS) -> Option<Vec<MqttMessage>> {
        self.with_live_broker(address, |broker| {
            let session = broker.sessions.get_mut(client_id).filter(|s| s.connected)?;
            session.subscriptions.insert(filter.to_string(), qos);
            Some(broker.retained.values().filter(|m| topic_matches(filter, &m.topic)).cloned().collect())
        })
        .ok()
        .flatten()
    }

    pub fn unsubscribe(&self, address: &str, client_id: &str, filter: &str) -> bool {
        self.with_live_broker(address, |broker| {
            broker
                .sessions
                .get_mut(client_id)
                .map(|session| session.subscriptions.remove(filter).is_some())
                .unwrap_or(false)
        })
        .unwrap_or(false)
    }

    /// PINGREQ. True when the broker answers for a connected session.
    pub fn ping(&self, address: &str, client_id: &str) -> bool {
        self.with_live_broker(address, |broker| broker.sessions.get(client_id).is_some_and(|s| s.connected))
            .unwrap_or(false)
    }

    pub fn retained_count(&self, address: &str) -> usize {
        self.with_broker(address, |broker| broker.retained.len()).unwrap_or(0)
    }

    pub fn stats(&self, address: &str) -> Option<BrokerStats> {
        self.with_broker(address, |broker| BrokerStats {
            connected_clients: broker.sessions.values().filter(|s| s.connected).count(),
            retained_messages: broker.retained.len(),
            ..broker.stats.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Instant;

    const PRIMARY: &str = "localhost:1883";

    fn network() -> BrokerNetwork {
        let network = BrokerNetwork::new();
        network.add_broker(PRIMARY, Point::new(500.0, 500.0));
        network
    }

    fn publish(publisher: &str, msg_id: u32, topic: &str, qos: QoS, retain: bool) -> MqttMessage {
        MqttMessage::new(publisher, msg_id, topic, b"v", qos, retain, Instant::now())
    }

    fn drain(inbox: &Inbox) -> Vec<Inbound> {
        let mut items = Vec::new();
        while let Ok(item) = inbox.try_receive() {
            items.push(item);
        }
        items
    }

    #[test]
    fn routes_to_matching_subscribers_but_not_publisher() {
        let network = network();
        let pub_inbox = Arc::new(Inbox::new());
        let sub_inbox = Arc::new(Inbox::new());
        network.connect(PRIMARY, "pub", false, None, pub_inbox.clone()).unwrap();
        network.connect(PRIMARY, "sub", false, None, sub_inbox.clone()).unwrap();
        network.subscribe(PRIMARY, "pub", "sensors/+/data", QoS::AtLeastOnce).unwrap();
        network.subscribe(PRIMARY, "sub", "sensors/+/data", QoS::AtLeastOnce).unwrap();

        assert!(network.publish(PRIMARY, &publish("pub", 1, "sensors/pub/data", QoS::AtLeastOnce, false)));

        let to_sub = drain(&sub_inbox);
        assert_eq!(to_sub.len(), 1);
        assert!(matches!(&to_sub[0], Inbound::Publish(m) if m.msg_id == 1 && m.publisher == "pub"));
        let to_pub = drain(&pub_inbox);
        assert_eq!(to_pub.len(), 1);
        assert!(matches!(to_pub[0], Inbound::PubAck(1)));
    }

    #[test]
    fn retained_messages_returned_on_subscribe() {
        let network = network();
        let inbox = Arc::new(Inbox::new());
        network.connect(PRIMARY, "a", true, None, inbox.clone()).unwrap();
        network.publish(PRIMARY, &publish("a", 1, "nodes/a/status", QoS::AtLeastOnce, true));
        network.publish(PRIMARY, &publish("a", 2, "nodes/a/status", QoS::AtLeastOnce, true));
        assert_eq!(network.retained_count(PRIMARY), 1);

        let other = Arc::new(Inbox::new());
        network.connect(PRIMARY, "b", true, None, other).unwrap();
        let retained = network.subscribe(PRIMARY, "b", "nodes/+/status", QoS::AtLeastOnce).unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].msg_id, 2);
    }

    #[test]
    fn abnormal_disconnect_publishes_will() {
        let network = network();
        let watcher = Arc::new(Inbox::new());
        network.connect(PRIMARY, "watcher", true, None, watcher.clone()).unwrap();
        network.subscribe(PRIMARY, "watcher", "nodes/#", QoS::AtLeastOnce).unwrap();

        let will = Will {
            topic: "nodes/n1/status".to_string(),
            payload: b"offline".to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        network.connect(PRIMARY, "n1", false, Some(will.clone()), Arc::new(Inbox::new())).unwrap();
        network.disconnect(PRIMARY, "n1", true);
        assert!(drain(&watcher).is_empty());

        network.connect(PRIMARY, "n1", false, Some(will), Arc::new(Inbox::new())).unwrap();
        network.disconnect(PRIMARY, "n1", false);
        let items = drain(&watcher);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Inbound::Publish(m) if m.payload == b"offline"));
        assert_eq!(network.stats(PRIMARY).unwrap().wills_published, 1);
    }

    #[test]
    fn down_broker_refuses_everything() {
        let network = network();
        let inbox = Arc::new(Inbox::new());
        network.connect(PRIMARY, "a", false, None, inbox.clone()).unwrap();
        network.set_alive(PRIMARY, false);
        assert!(!network.is_alive(PRIMARY));
        assert!(!network.ping(PRIMARY, "a"));
        assert!(!network.publish(PRIMARY, &publish("a", 1, "t", QoS::AtMostOnce, false)));
        assert_eq!(network.connect(PRIMARY, "a", false, None, inbox.clone()), Err(BrokerError::Down));
        assert_eq!(network.connect("nowhere:1", "a", false, None, inbox), Err(BrokerError::Unknown));

        network.set_alive(PRIMARY, true);
        assert!(!network.ping(PRIMARY, "a"));
    }

    #[test]
    fn persistent_session_survives_reconnect() {
        let network = network();
        let sub_inbox = Arc::new(Inbox::new());
        network.connect(PRIMARY, "sub", false, None, sub_inbox.clone()).unwrap();
        network.subscribe(PRIMARY, "sub", "sensors/#", QoS::AtLeastOnce).unwrap();
        network.disconnect(PRIMARY, "sub", true);

        network.connect(PRIMARY, "pub", true, None, Arc::new(Inbox::new())).unwrap();
        network.publish(PRIMARY, &publish("pub", 1, "sensors/pub/data", QoS::AtLeastOnce, false));
        network.publish(PRIMARY, &publish("pub", 0, "sensors/pub/data", QoS::AtMostOnce, false));

        // Only the QoS 1 publish was queued for the offline session
        assert_eq!(drain(&sub_inbox).len(), 1);
        assert_eq!(network.connect(PRIMARY, "sub", false, None, sub_inbox), Ok(true));
    }
}
