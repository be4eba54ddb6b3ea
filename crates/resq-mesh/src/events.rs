//! Observable mesh state changes for the presentation layer

use crate::envelope::EndpointId;
use crate::router::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Mesh event types that can be pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Scanning flag changed
    ScanningChanged { scanning: bool },
    /// Connected peer set changed
    PeersChanged { peers: BTreeMap<EndpointId, String> },
    /// A message was appended to the log
    MessageLogged { message: ChatMessage },
    /// An emergency broadcast from another node became the current alert
    EmergencyRaised { message: ChatMessage },
    /// The current emergency alert was dismissed
    EmergencyCleared,
    /// Set of nicknames with a known public key changed
    KeysChanged { nicknames: BTreeSet<String> },
    /// Transient, non-blocking notice
    Notice { text: String },
}

/// Fan-out of mesh events to any number of subscribers
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for mesh event");
        }
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.publish(MeshEvent::Notice { text: text.into() });
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
