//! Device identity and topic names derived from the station MAC address

use core::fmt::Write;
use heapless::String;

pub type NodeId = String<12>;
pub type Topic = String<64>;
pub type ClientId = String<24>;

/// Identity computed once at boot. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    node_id: NodeId,
    data_topic: Topic,
    command_topic: Topic,
    last_command_topic: Topic,
    client_id: ClientId,
}

impl DeviceIdentity {
    /// Build the identity from a MAC address, e.g. `A1B2C3D4E5F6`
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut node_id = NodeId::new();
        for byte in mac {
            // 12 hex digits always fit
            let _ = write!(node_id, "{:02X}", byte);
        }

        let mut data_topic = Topic::new();
        let _ = write!(data_topic, "devices/{}/data", node_id);
        let mut command_topic = Topic::new();
        let _ = write!(command_topic, "devices/{}/commands", node_id);
        let mut last_command_topic = Topic::new();
        let _ = write!(last_command_topic, "devices/{}/commands/last", node_id);
        let mut client_id = ClientId::new();
        let _ = write!(client_id, "ESP32-{}", node_id);

        Self {
            node_id,
            data_topic,
            command_topic,
            last_command_topic,
            client_id,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Outbound telemetry, heartbeat and status
    pub fn data_topic(&self) -> &str {
        &self.data_topic
    }

    /// Inbound commands
    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Retained copy of the most recent command, replayed by the broker on subscribe
    pub fn last_command_topic(&self) -> &str {
        &self.last_command_topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether `topic` carries commands for this node
    pub fn is_command_topic(&self, topic: &str) -> bool {
        topic == self.command_topic.as_str() || topic == self.last_command_topic.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_node_id() {
        let id = DeviceIdentity::from_mac([0xa1, 0xb2, 0xc3, 0x04, 0x05, 0xf6]);

        assert_eq!(id.node_id(), "A1B2C30405F6");
        assert_eq!(id.data_topic(), "devices/A1B2C30405F6/data");
        assert_eq!(id.command_topic(), "devices/A1B2C30405F6/commands");
        assert_eq!(id.last_command_topic(), "devices/A1B2C30405F6/commands/last");
        assert_eq!(id.client_id(), "ESP32-A1B2C30405F6");
    }

    #[test]
    fn recognises_both_command_topics() {
        let id = DeviceIdentity::from_mac([0; 6]);
        assert!(id.is_command_topic("devices/000000000000/commands"));
        assert!(id.is_command_topic("devices/000000000000/commands/last"));
        assert!(!id.is_command_topic("devices/000000000000/data"));
    }
}
