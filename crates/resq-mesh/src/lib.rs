//! Offline peer-to-peer mesh messaging
//!
//! This crate implements a flooding mesh over short-range radio links:
//! peer discovery with a deterministic connection tie-break, multi-hop
//! relay with duplicate suppression, end-to-end encrypted direct messages
//! and emergency broadcast alerts.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod loopback;
pub mod nickname;
pub mod peers;
pub mod router;
pub mod seen;

// Re-export main types
pub use adapter::{TransportAdapter, TransportEventHandler};
pub use config::MeshConfig;
pub use controller::MeshController;
pub use envelope::{Destination, Envelope, MessageType, BROADCAST};
pub use error::{MeshError, MeshResult};
pub use events::{EventPublisher, MeshEvent};
pub use identity::KeyStore;
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use nickname::{MeshMode, SOS_MESSAGE};
pub use peers::PeerDirectory;
pub use router::{ChatMessage, MessageRouter};
