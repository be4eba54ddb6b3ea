//! Wire envelope carried as an opaque transport payload

use crate::error::MeshResult;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Literal destination value addressing every node in the mesh
pub const BROADCAST: &str = "BROADCAST";

/// Transport-local identifier of a direct link
pub type EndpointId = String;

/// Unique envelope identifier
pub type MessageId = String;

/// Kind of payload an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Emergency,
    KeyExchange,
}

/// Where an envelope is addressed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    #[default]
    Broadcast,
    Peer(String),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Broadcast => BROADCAST,
            Destination::Peer(nickname) => nickname,
        }
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        if value == BROADCAST {
            Destination::Broadcast
        } else {
            Destination::Peer(value.to_string())
        }
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Destination::from(value.as_str()))
    }
}

/// A mesh envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: MessageId,
    pub sender: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub hops: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_aes_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Envelope {
    /// Create a new envelope with a fresh id and zero hops
    pub fn new(
        sender: impl Into<String>,
        message_type: MessageType,
        destination: Destination,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            message_type,
            destination,
            hops: 0,
            content: content.into(),
            encrypted_aes_key: None,
            public_key: None,
        }
    }

    /// Create a key exchange envelope announcing `public_key`
    pub fn key_exchange(sender: impl Into<String>, public_key: impl Into<String>) -> Self {
        let mut envelope = Self::new(sender, MessageType::KeyExchange, Destination::Broadcast, "");
        envelope.public_key = Some(public_key.into());
        envelope
    }

    pub fn is_emergency(&self) -> bool {
        self.message_type == MessageType::Emergency
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted_aes_key.is_some()
    }

    /// Copy of this envelope with one more hop counted
    pub fn next_hop(&self) -> Self {
        let mut relayed = self.clone();
        relayed.hops = relayed.hops.saturating_add(1);
        relayed
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use serde_json::{json, Value};

    #[test]
    fn test_wire_field_names() {
        let mut envelope = Envelope::new("alice", MessageType::Text, Destination::from("bob"), "hi");
        envelope.encrypted_aes_key = Some("a2V5".to_string());

        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "TEXT");
        assert_eq!(value["destination"], "bob");
        assert_eq!(value["hops"], 0);
        assert_eq!(value["encryptedAesKey"], "a2V5");
        assert!(value.get("publicKey").is_none());
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let raw = json!({
            "id": "m1",
            "sender": "carol",
            "type": "EMERGENCY",
            "content": "help"
        });

        let envelope = Envelope::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.destination, Destination::Broadcast);
        assert_eq!(envelope.hops, 0);
        assert!(envelope.is_emergency());
        assert!(!envelope.is_encrypted());
    }

    #[test]
    fn test_key_exchange_shape() {
        let envelope = Envelope::key_exchange("dave", "cHVi");
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "KEY_EXCHANGE");
        assert_eq!(value["publicKey"], "cHVi");
        assert_eq!(value["destination"], BROADCAST);
    }

    #[test]
    fn test_next_hop_increments() {
        let envelope = Envelope::new("alice", MessageType::Text, Destination::Broadcast, "x");
        let relayed = envelope.next_hop().next_hop();
        assert_eq!(relayed.hops, 2);
        assert_eq!(relayed.id, envelope.id);
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        for raw in [
            &b"not json"[..],
            br#"{"sender":"a","type":"TEXT"}"#,
            br#"{"id":"1","sender":"a","type":"GOSSIP"}"#,
            br#"{"id":"1","sender":"a","type":"TEXT","hops":-1}"#,
        ] {
            let result = Envelope::from_bytes(raw);
            assert!(matches!(result, Err(MeshError::ParseFailure(_))));
        }
    }
}
