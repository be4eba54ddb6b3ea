//! Mesh lifecycle and the single serialization point for mesh state
//!
//! Every local operation and every transport callback locks [`MeshState`]
//! once, lets the router and directories decide, releases the lock, and
//! only then performs the resulting transmissions. A transport that
//! delivers synchronously into another node therefore never waits on a
//! lock held by its caller.

use crate::adapter::{TransportAdapter, TransportEventHandler};
use crate::config::MeshConfig;
use crate::envelope::EndpointId;
use crate::error::{connection_failure_reason, MeshError, MeshResult};
use crate::events::{EventPublisher, MeshEvent};
use crate::identity::KeyStore;
use crate::nickname::{resolve_nickname, MeshMode, SOS_MESSAGE};
use crate::peers::{should_initiate, PeerDirectory};
use crate::router::{ChatMessage, MessageRouter, ReceiveOutcome, Transmission};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Nickname recorded for a connection whose initiation was never seen
const UNKNOWN_PEER_NAME: &str = "Peer";

/// All mutable mesh state
struct MeshState {
    scanning: bool,
    mode: MeshMode,
    peers: PeerDirectory,
    keys: KeyStore,
    router: MessageRouter,
}

/// Orchestrates the transport, peer directory, key store and router
pub struct MeshController {
    nickname: String,
    service_id: String,
    state: Mutex<MeshState>,
    transport: Arc<dyn TransportAdapter>,
    events: EventPublisher,
}

impl MeshController {
    pub fn new(config: &MeshConfig, transport: Arc<dyn TransportAdapter>) -> MeshResult<Self> {
        let nickname = resolve_nickname(config.nickname.as_deref())?;
        info!(nickname = %nickname, mode = %config.mode, "MeshController initialized");

        Ok(Self {
            state: Mutex::new(MeshState {
                scanning: false,
                mode: config.mode,
                peers: PeerDirectory::new(),
                keys: KeyStore::generate(),
                router: MessageRouter::new(nickname.clone()),
            }),
            nickname,
            service_id: config.service_id.clone(),
            transport,
            events: EventPublisher::new(config.event_channel_capacity),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Begin advertising and discovery
    ///
    /// Peer links, key records and the seen set survive from earlier
    /// sessions. On a transport failure scanning is reverted and the error
    /// is both published as a notice and returned; there is no retry.
    pub async fn start(&self) -> MeshResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.scanning {
                debug!("Mesh already scanning");
                return Ok(());
            }
            state.scanning = true;
        }
        self.events.publish(MeshEvent::ScanningChanged { scanning: true });
        info!(service_id = %self.service_id, "Starting mesh");

        if let Err(e) = self
            .transport
            .start_advertising(&self.nickname, &self.service_id)
            .await
        {
            warn!(error = %e, "Advertising failed");
            self.revert_scanning(format!("Advertising Failed: {}", e)).await;
            return Err(e);
        }
        self.events.notice("Advertising...");

        if let Err(e) = self.transport.start_discovery(&self.service_id).await {
            warn!(error = %e, "Discovery failed");
            self.revert_scanning(format!("Discovery Error: {}", e)).await;
            return Err(e);
        }
        self.events.notice("Scanning for peers...");

        Ok(())
    }

    async fn revert_scanning(&self, notice: String) {
        self.state.lock().await.scanning = false;
        self.events.publish(MeshEvent::ScanningChanged { scanning: false });
        self.events.notice(notice);
    }

    /// Tear down every link and forget peers and their keys
    ///
    /// The message log and seen set are kept. Outstanding sends are not
    /// awaited.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            state.scanning = false;
            state.peers.clear();
            state.keys.clear_peer_keys();
        }
        info!("Stopping mesh");

        self.events.publish(MeshEvent::ScanningChanged { scanning: false });
        self.events.publish(MeshEvent::PeersChanged {
            peers: BTreeMap::new(),
        });
        self.events.publish(MeshEvent::KeysChanged {
            nicknames: BTreeSet::new(),
        });

        if let Err(e) = self.transport.stop_all().await {
            warn!(error = %e, "Transport teardown reported an error");
        }
        self.events.notice("Mesh stopped");
    }

    /// Broadcast a text or emergency message to the whole mesh
    pub async fn send_broadcast(&self, content: &str, is_emergency: bool) -> MeshResult<ChatMessage> {
        let outbound = {
            let mut state = self.state.lock().await;
            let MeshState { peers, router, .. } = &mut *state;
            router.compose_broadcast(content, is_emergency, peers)?
        };

        self.events.publish(MeshEvent::MessageLogged {
            message: outbound.message.clone(),
        });
        self.transmit(outbound.transmissions).await;
        Ok(outbound.message)
    }

    /// Send a direct message to `recipient`
    pub async fn send_direct(&self, content: &str, recipient: &str) -> MeshResult<ChatMessage> {
        let outbound = {
            let mut state = self.state.lock().await;
            let MeshState {
                peers, keys, router, ..
            } = &mut *state;
            router.compose_direct(content, recipient, keys, peers)?
        };

        self.events.publish(MeshEvent::MessageLogged {
            message: outbound.message.clone(),
        });
        self.transmit(outbound.transmissions).await;
        Ok(outbound.message)
    }

    /// Broadcast the preset emergency SOS
    pub async fn send_sos(&self) -> MeshResult<ChatMessage> {
        self.send_broadcast(SOS_MESSAGE, true).await
    }

    /// Broadcast one of the current mode's quick messages
    pub async fn send_quick_message(&self, index: usize) -> MeshResult<ChatMessage> {
        let mode = self.mode().await;
        let content = mode.quick_messages().get(index).copied().ok_or_else(|| {
            MeshError::Other(anyhow::anyhow!("no quick message {} in {} mode", index, mode))
        })?;
        self.send_broadcast(content, mode == MeshMode::Emergency).await
    }

    /// Clear the current emergency alert
    pub async fn dismiss_emergency(&self) {
        let cleared = self.state.lock().await.router.dismiss_emergency();
        if cleared {
            info!("Emergency alert dismissed");
            self.events.publish(MeshEvent::EmergencyCleared);
        }
    }

    pub async fn set_mode(&self, mode: MeshMode) {
        self.state.lock().await.mode = mode;
        info!(mode = %mode, "Mode changed");
    }

    pub async fn mode(&self) -> MeshMode {
        self.state.lock().await.mode
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    pub async fn connected_peers(&self) -> BTreeMap<EndpointId, String> {
        self.state.lock().await.peers.connected_peers()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.peers.pending_count()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.router.messages().to_vec()
    }

    pub async fn current_emergency(&self) -> Option<ChatMessage> {
        self.state.lock().await.router.current_emergency().cloned()
    }

    pub async fn known_keys(&self) -> BTreeSet<String> {
        self.state.lock().await.keys.known_peers()
    }

    pub async fn seen_count(&self) -> usize {
        self.state.lock().await.router.seen_count()
    }

    pub async fn public_key(&self) -> String {
        self.state.lock().await.keys.public_key_encoded()
    }

    /// Send each transmission, continuing past individual failures
    async fn transmit(&self, transmissions: Vec<Transmission>) {
        for transmission in transmissions {
            if let Err(e) = self
                .transport
                .send_payload(&transmission.endpoint_id, &transmission.payload)
                .await
            {
                warn!(endpoint = %transmission.endpoint_id, error = %e, "Failed to send payload");
            }
        }
    }
}

#[async_trait]
impl TransportEventHandler for MeshController {
    async fn on_endpoint_found(&self, endpoint_id: &str, remote_name: &str) {
        if !self.state.lock().await.scanning {
            debug!(endpoint = %endpoint_id, "Ignoring discovery while idle");
            return;
        }

        match should_initiate(&self.nickname, remote_name) {
            Ok(true) => {
                info!(endpoint = %endpoint_id, peer = %remote_name, "Initiating connection");
                self.events
                    .notice(format!("Found Peer: {}, Requesting...", remote_name));
                if let Err(e) = self
                    .transport
                    .request_connection(&self.nickname, endpoint_id)
                    .await
                {
                    warn!(endpoint = %endpoint_id, error = %e, "Connection request failed");
                    self.events.notice(format!("Connection Failed: {}", e));
                }
            }
            Ok(false) => {
                debug!(endpoint = %endpoint_id, peer = %remote_name, "Waiting for peer to initiate");
                self.events
                    .notice(format!("Found Peer: {}, Waiting...", remote_name));
            }
            Err(e) => {
                warn!(endpoint = %endpoint_id, error = %e, "Not connecting");
                self.events.notice(e.to_string());
            }
        }
    }

    async fn on_endpoint_lost(&self, endpoint_id: &str) {
        debug!(endpoint = %endpoint_id, "Endpoint lost");
    }

    async fn on_connection_initiated(&self, endpoint_id: &str, remote_name: &str) {
        self.state
            .lock()
            .await
            .peers
            .register_pending(endpoint_id, remote_name);
        self.events
            .notice(format!("Connecting to {}...", remote_name));

        if let Err(e) = self.transport.accept_connection(endpoint_id).await {
            warn!(endpoint = %endpoint_id, error = %e, "Accepting connection failed");
            self.state.lock().await.peers.discard_pending(endpoint_id);
        }
    }

    async fn on_connection_result(&self, endpoint_id: &str, success: bool, status_code: i32) {
        if !success {
            let nickname = self.state.lock().await.peers.discard_pending(endpoint_id);
            let reason = connection_failure_reason(status_code);
            warn!(
                endpoint = %endpoint_id,
                peer = ?nickname,
                status_code,
                "Connection failed: {}", reason
            );
            self.events.notice(format!("Connection Failed: {}", reason));
            return;
        }

        let (nickname, key_exchange, peers) = {
            let mut state = self.state.lock().await;
            let nickname = match state.peers.promote(endpoint_id) {
                Ok(nickname) => nickname,
                Err(_) => {
                    state.peers.insert_connected(endpoint_id, UNKNOWN_PEER_NAME);
                    UNKNOWN_PEER_NAME.to_string()
                }
            };
            let public_key = state.keys.public_key_encoded();
            let key_exchange = state.router.compose_key_exchange(&public_key, endpoint_id);
            (nickname, key_exchange, state.peers.connected_peers())
        };

        self.events.publish(MeshEvent::PeersChanged { peers });
        self.events
            .notice(format!("Successfully Connected to {}!", nickname));

        match key_exchange {
            Ok(transmission) => self.transmit(vec![transmission]).await,
            Err(e) => warn!(endpoint = %endpoint_id, error = %e, "Could not build key exchange"),
        }
    }

    async fn on_disconnected(&self, endpoint_id: &str) {
        let (peers, keys) = {
            let mut state = self.state.lock().await;
            let key_owner = state.peers.take_key_owner(endpoint_id);
            let nickname = state.peers.remove(endpoint_id);
            // The key is filed under the nickname it was announced with
            let Some(purge) = key_owner.or(nickname) else {
                debug!(endpoint = %endpoint_id, "Disconnect for unknown endpoint");
                return;
            };
            if state.keys.remove_peer_key(&purge) {
                debug!(peer = %purge, "Purged public key");
            }
            (state.peers.connected_peers(), state.keys.known_peers())
        };

        info!(endpoint = %endpoint_id, "Disconnected");
        self.events.publish(MeshEvent::PeersChanged { peers });
        self.events
            .publish(MeshEvent::KeysChanged { nicknames: keys });
    }

    async fn on_payload_received(&self, endpoint_id: &str, payload: &[u8]) {
        let (outcome, known_keys) = {
            let mut state = self.state.lock().await;
            let MeshState {
                peers, keys, router, ..
            } = &mut *state;
            let outcome = router.on_receive(payload, endpoint_id, keys, peers);
            if let ReceiveOutcome::KeyStored { nickname } = &outcome {
                peers.record_key_owner(endpoint_id, nickname);
            }
            (outcome, keys.known_peers())
        };

        match &outcome {
            ReceiveOutcome::KeyStored { .. } => {
                self.events.publish(MeshEvent::KeysChanged {
                    nicknames: known_keys,
                });
            }
            ReceiveOutcome::Delivered {
                message,
                emergency_raised,
                ..
            } => {
                self.events.publish(MeshEvent::MessageLogged {
                    message: message.clone(),
                });
                if *emergency_raised {
                    self.events.publish(MeshEvent::EmergencyRaised {
                        message: message.clone(),
                    });
                }
            }
            ReceiveOutcome::Relayed { .. } | ReceiveOutcome::Duplicate | ReceiveOutcome::Dropped => {}
        }

        if let ReceiveOutcome::Delivered { relay, .. } | ReceiveOutcome::Relayed { relay } = outcome {
            self.transmit(relay).await;
        }
    }
}
