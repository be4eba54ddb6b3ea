//! Envelope routing with flood relay, hop counting and deduplication

use crate::envelope::{Destination, EndpointId, Envelope, MessageId, MessageType, BROADCAST};
use crate::error::{MeshError, MeshResult};
use crate::identity::{EncryptedBundle, KeyStore};
use crate::peers::PeerDirectory;
use crate::seen::SeenMessageSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Display content for a direct message that could not be decrypted
pub const UNREADABLE_PLACEHOLDER: &str = "[unreadable encrypted message]";

/// A message delivered to (or sent from) this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: String,
    pub content: String,
    pub is_emergency: bool,
    pub hops: u32,
    pub is_direct: bool,
    pub recipient: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    fn from_envelope(envelope: &Envelope, content: String, hops: u32) -> Self {
        let recipient = match &envelope.destination {
            Destination::Broadcast => None,
            Destination::Peer(nickname) => Some(nickname.clone()),
        };
        Self {
            id: envelope.id.clone(),
            sender: envelope.sender.clone(),
            content,
            is_emergency: envelope.is_emergency(),
            hops,
            is_direct: recipient.is_some(),
            recipient,
            received_at: Utc::now(),
        }
    }
}

/// Serialized envelope bound for one connected endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub endpoint_id: EndpointId,
    pub payload: Vec<u8>,
}

/// Result of composing a local message
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: ChatMessage,
    pub envelope: Envelope,
    pub transmissions: Vec<Transmission>,
}

/// What the router decided for an incoming payload
#[derive(Debug, Clone)]
pub enum ReceiveOutcome {
    /// Payload was not a valid envelope
    Dropped,
    /// Envelope id was already processed
    Duplicate,
    /// A peer's public key was recorded
    KeyStored { nickname: String },
    /// Message was logged locally, and relayed if it was a broadcast
    Delivered {
        message: ChatMessage,
        emergency_raised: bool,
        relay: Vec<Transmission>,
    },
    /// Message was addressed to another node and only relayed
    Relayed { relay: Vec<Transmission> },
}

impl ReceiveOutcome {
    /// Transmissions the caller must perform
    pub fn transmissions(&self) -> &[Transmission] {
        match self {
            ReceiveOutcome::Delivered { relay, .. } | ReceiveOutcome::Relayed { relay } => relay,
            _ => &[],
        }
    }
}

/// Mesh message router
///
/// Owns the seen set, the message log and the current emergency alert. It
/// never performs I/O: every operation returns the transmissions to make.
pub struct MessageRouter {
    nickname: String,
    seen: SeenMessageSet,
    log: Vec<ChatMessage>,
    emergency: Option<ChatMessage>,
}

impl MessageRouter {
    pub fn new(nickname: impl Into<String>) -> Self {
        let nickname = nickname.into();
        info!("MessageRouter initialized for {}", nickname);
        Self {
            nickname,
            seen: SeenMessageSet::new(),
            log: Vec::new(),
            emergency: None,
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Send a broadcast to every connected peer
    pub fn compose_broadcast(
        &mut self,
        content: &str,
        is_emergency: bool,
        peers: &PeerDirectory,
    ) -> MeshResult<Outbound> {
        let message_type = if is_emergency {
            MessageType::Emergency
        } else {
            MessageType::Text
        };
        let envelope = Envelope::new(&self.nickname, message_type, Destination::Broadcast, content);

        self.originate(envelope, content.to_string(), peers)
    }

    /// Send a direct message, encrypted when the recipient's key is known
    ///
    /// The envelope is flooded to every connected peer like a broadcast;
    /// only the addressed node displays it.
    pub fn compose_direct(
        &mut self,
        content: &str,
        recipient: &str,
        keys: &KeyStore,
        peers: &PeerDirectory,
    ) -> MeshResult<Outbound> {
        if recipient.is_empty() || recipient == BROADCAST {
            return Err(MeshError::InvalidNickname(format!(
                "cannot address a direct message to {:?}",
                recipient
            )));
        }

        let mut envelope = Envelope::new(
            &self.nickname,
            MessageType::Text,
            Destination::Peer(recipient.to_string()),
            content,
        );

        match keys.encrypt_for_peer(recipient, content)? {
            Some(bundle) => {
                debug!(message_id = %envelope.id, peer = %recipient, "Encrypted direct message");
                envelope.content = bundle.cipher_text;
                envelope.encrypted_aes_key = Some(bundle.wrapped_key);
            }
            None => {
                debug!(
                    message_id = %envelope.id,
                    peer = %recipient,
                    "No key on record, sending direct message in plaintext"
                );
            }
        }

        self.originate(envelope, content.to_string(), peers)
    }

    /// Build the key announcement for a newly connected endpoint
    pub fn compose_key_exchange(
        &mut self,
        public_key: &str,
        endpoint_id: &str,
    ) -> MeshResult<Transmission> {
        let envelope = Envelope::key_exchange(&self.nickname, public_key);
        self.seen.mark_seen(&envelope.id);

        Ok(Transmission {
            endpoint_id: endpoint_id.to_string(),
            payload: envelope.to_bytes()?,
        })
    }

    fn originate(
        &mut self,
        envelope: Envelope,
        display: String,
        peers: &PeerDirectory,
    ) -> MeshResult<Outbound> {
        self.seen.mark_seen(&envelope.id);

        let payload = envelope.to_bytes()?;
        let transmissions = fan_out(&payload, peers, None);

        let message = ChatMessage::from_envelope(&envelope, display, 0);
        self.log.push(message.clone());

        info!(
            message_id = %envelope.id,
            destination = %envelope.destination.as_str(),
            peers = transmissions.len(),
            "Composed message"
        );

        Ok(Outbound {
            message,
            envelope,
            transmissions,
        })
    }

    /// Receive and route an incoming payload
    pub fn on_receive(
        &mut self,
        raw: &[u8],
        from_endpoint: &str,
        keys: &mut KeyStore,
        peers: &PeerDirectory,
    ) -> ReceiveOutcome {
        let envelope = match Envelope::from_bytes(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = %from_endpoint, error = %e, "Dropping malformed payload");
                return ReceiveOutcome::Dropped;
            }
        };

        if !self.seen.mark_seen(&envelope.id) {
            debug!(message_id = %envelope.id, from = %from_endpoint, "Discarding duplicate envelope");
            return ReceiveOutcome::Duplicate;
        }

        match envelope.message_type {
            MessageType::KeyExchange => self.receive_key(envelope, keys),
            MessageType::Text | MessageType::Emergency => {
                self.route_message(envelope, from_endpoint, keys, peers)
            }
        }
    }

    fn receive_key(&mut self, envelope: Envelope, keys: &mut KeyStore) -> ReceiveOutcome {
        let Some(public_key) = envelope.public_key.as_deref() else {
            warn!(message_id = %envelope.id, sender = %envelope.sender, "Key exchange without a key");
            return ReceiveOutcome::Dropped;
        };

        match keys.store_peer_key(&envelope.sender, public_key) {
            Ok(()) => {
                info!(peer = %envelope.sender, "Received public key");
                ReceiveOutcome::KeyStored {
                    nickname: envelope.sender,
                }
            }
            Err(e) => {
                warn!(peer = %envelope.sender, error = %e, "Ignoring unusable public key");
                ReceiveOutcome::Dropped
            }
        }
    }

    fn route_message(
        &mut self,
        envelope: Envelope,
        from_endpoint: &str,
        keys: &KeyStore,
        peers: &PeerDirectory,
    ) -> ReceiveOutcome {
        let relayed = envelope.next_hop();

        match &envelope.destination {
            Destination::Broadcast => {
                let message = ChatMessage::from_envelope(&envelope, envelope.content.clone(), relayed.hops);
                self.log.push(message.clone());

                let emergency_raised = message.is_emergency && message.sender != self.nickname;
                if emergency_raised {
                    warn!(message_id = %message.id, sender = %message.sender, "Emergency broadcast received");
                    self.emergency = Some(message.clone());
                }

                let relay = self.relay(&relayed, from_endpoint, peers);
                ReceiveOutcome::Delivered {
                    message,
                    emergency_raised,
                    relay,
                }
            }
            Destination::Peer(recipient)
                if *recipient == self.nickname || envelope.sender == self.nickname =>
            {
                let content = self.open_direct(&envelope, keys);
                let message = ChatMessage::from_envelope(&envelope, content, relayed.hops);
                self.log.push(message.clone());

                debug!(message_id = %message.id, sender = %message.sender, "Delivered direct message");
                ReceiveOutcome::Delivered {
                    message,
                    emergency_raised: false,
                    relay: Vec::new(),
                }
            }
            Destination::Peer(recipient) => {
                debug!(message_id = %envelope.id, recipient = %recipient, "Relaying direct message");
                ReceiveOutcome::Relayed {
                    relay: self.relay(&relayed, from_endpoint, peers),
                }
            }
        }
    }

    fn open_direct(&self, envelope: &Envelope, keys: &KeyStore) -> String {
        let Some(wrapped_key) = envelope.encrypted_aes_key.clone() else {
            return envelope.content.clone();
        };

        let bundle = EncryptedBundle {
            wrapped_key,
            cipher_text: envelope.content.clone(),
        };
        match keys.decrypt_own(&bundle) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(message_id = %envelope.id, sender = %envelope.sender, error = %e, "Could not decrypt direct message");
                UNREADABLE_PLACEHOLDER.to_string()
            }
        }
    }

    fn relay(&self, envelope: &Envelope, from_endpoint: &str, peers: &PeerDirectory) -> Vec<Transmission> {
        match envelope.to_bytes() {
            Ok(payload) => {
                let transmissions = fan_out(&payload, peers, Some(from_endpoint));
                debug!(
                    message_id = %envelope.id,
                    hops = envelope.hops,
                    peers = transmissions.len(),
                    "Relaying envelope"
                );
                transmissions
            }
            Err(e) => {
                warn!(message_id = %envelope.id, error = %e, "Failed to serialize relay");
                Vec::new()
            }
        }
    }

    /// Clear the current emergency alert
    ///
    /// Returns true when an alert was active.
    pub fn dismiss_emergency(&mut self) -> bool {
        self.emergency.take().is_some()
    }

    pub fn current_emergency(&self) -> Option<&ChatMessage> {
        self.emergency.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.log
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

fn fan_out(payload: &[u8], peers: &PeerDirectory, excluded: Option<&str>) -> Vec<Transmission> {
    peers
        .connected_endpoints_except(excluded)
        .into_iter()
        .map(|endpoint_id| Transmission {
            endpoint_id,
            payload: payload.to_vec(),
        })
        .collect()
}
