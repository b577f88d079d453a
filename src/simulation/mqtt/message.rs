//! MQTT message model and topic-filter matching.

use embassy_time::Instant;

use crate::simulation::types::QoS;

#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    /// Per-publisher packet id. QoS 0 messages carry 0.
    pub msg_id: u32,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub timestamp: Instant,
    /// Client id of the publisher.
    pub publisher: String,
}

impl MqttMessage {
    pub fn new(publisher: &str, msg_id: u32, topic: &str, payload: &[u8], qos: QoS, retain: bool, timestamp: Instant) -> Self {
        Self {
            msg_id,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            dup: false,
            timestamp,
            publisher: publisher.to_string(),
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Check whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level, `#` (last level only) matches the rest of
/// the topic including its parent level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_single_level_wildcards() {
        assert!(topic_matches("sensors/node_1/data", "sensors/node_1/data"));
        assert!(!topic_matches("sensors/node_1/data", "sensors/node_2/data"));
        assert!(topic_matches("sensors/+/data", "sensors/node_2/data"));
        assert!(!topic_matches("sensors/+/data", "sensors/node_2/data/raw"));
        assert!(!topic_matches("sensors/+", "sensors"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("nodes/#", "nodes/node_1/status"));
        assert!(topic_matches("nodes/#", "nodes"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("nodes/#/status", "nodes/a/status"));
        assert!(!topic_matches("nodes/#", "sensors/a"));
    }
}
