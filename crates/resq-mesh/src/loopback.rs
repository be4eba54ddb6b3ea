//! In-memory transport connecting mesh nodes within one process
//!
//! A [`LoopbackHub`] plays the role of the radio medium. Each node gets a
//! [`LoopbackTransport`] and attaches its event handler. Discovery and
//! connection handshakes call the remote node's handler directly. Payloads
//! go through a per-node FIFO queue drained by its own task, so a send
//! returns as soon as the payload is queued. [`LoopbackHub::settle`] waits
//! until every queued payload has been handled. Pairs can be placed out of
//! range to build line and partitioned topologies.

use crate::adapter::{TransportAdapter, TransportEventHandler, STATUS_OK};
use crate::envelope::EndpointId;
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Unordered endpoint pair
type LinkKey = (EndpointId, EndpointId);

fn link_key(a: &str, b: &str) -> LinkKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// A payload waiting in a node's receive queue
struct Delivery {
    from: EndpointId,
    payload: Vec<u8>,
}

/// Count of queued or in-progress deliveries across the hub
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[derive(Default)]
struct NodeSlot {
    name: Option<String>,
    service_id: Option<String>,
    advertising: bool,
    discovering: bool,
    handler: Option<Weak<dyn TransportEventHandler>>,
    queue: Option<mpsc::UnboundedSender<Delivery>>,
    fail_advertising: Option<i32>,
    fail_discovery: Option<i32>,
    refuse_connections: Option<i32>,
}

enum LinkState {
    Requested { accepted: HashSet<EndpointId> },
    Connected,
}

#[derive(Default)]
struct HubInner {
    nodes: DashMap<EndpointId, NodeSlot>,
    links: DashMap<LinkKey, LinkState>,
    out_of_range: DashSet<LinkKey>,
    in_flight: Arc<InFlight>,
}

impl HubInner {
    fn handler(&self, endpoint_id: &str) -> Option<Arc<dyn TransportEventHandler>> {
        let weak = self.nodes.get(endpoint_id)?.handler.clone()?;
        weak.upgrade()
    }

    fn in_range(&self, a: &str, b: &str) -> bool {
        !self.out_of_range.contains(&link_key(a, b))
    }

    fn name_of(&self, endpoint_id: &str) -> String {
        self.nodes
            .get(endpoint_id)
            .and_then(|node| node.name.clone())
            .unwrap_or_else(|| endpoint_id.to_string())
    }

    /// Endpoints other than `local` matching the predicate and in range
    fn visible_from<F>(&self, local: &str, predicate: F) -> Vec<(EndpointId, String)>
    where
        F: Fn(&NodeSlot) -> bool,
    {
        let mut visible: Vec<(EndpointId, String)> = self
            .nodes
            .iter()
            .filter(|entry| entry.key() != local && predicate(entry.value()))
            .map(|entry| {
                let name = entry.name.clone().unwrap_or_else(|| entry.key().clone());
                (entry.key().clone(), name)
            })
            .collect();
        visible.retain(|(id, _)| self.in_range(local, id));
        visible.sort();
        visible
    }

    fn is_connected(&self, a: &str, b: &str) -> bool {
        matches!(
            self.links.get(&link_key(a, b)).as_deref(),
            Some(LinkState::Connected)
        )
    }

    fn links_of(&self, endpoint_id: &str) -> Vec<EndpointId> {
        let mut peers: Vec<EndpointId> = self
            .links
            .iter()
            .filter_map(|entry| {
                let (a, b) = entry.key();
                if a == endpoint_id {
                    Some(b.clone())
                } else if b == endpoint_id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers
    }

    /// Remove the link and report the disconnect to the listed sides
    async fn sever(&self, a: &str, b: &str, notify: &[&str]) {
        let Some((_, state)) = self.links.remove(&link_key(a, b)) else {
            return;
        };
        if !matches!(state, LinkState::Connected) {
            return;
        }
        debug!(a = %a, b = %b, "Loopback link severed");
        for side in notify {
            let other = if *side == a { b } else { a };
            if let Some(handler) = self.handler(side) {
                handler.on_disconnected(other).await;
            }
        }
    }
}

/// Shared in-memory radio medium
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its transport
    pub fn transport(&self, endpoint_id: impl Into<EndpointId>) -> Arc<LoopbackTransport> {
        let endpoint_id = endpoint_id.into();
        self.inner
            .nodes
            .entry(endpoint_id.clone())
            .or_default();
        Arc::new(LoopbackTransport {
            endpoint_id,
            hub: self.inner.clone(),
        })
    }

    /// Attach the handler receiving callbacks for `endpoint_id`
    ///
    /// Spawns the task draining the node's payload queue, so this must be
    /// called inside a Tokio runtime. The hub holds only a weak reference;
    /// a dropped handler simply stops receiving callbacks.
    pub fn attach(&self, endpoint_id: &str, handler: Weak<dyn TransportEventHandler>) -> MeshResult<()> {
        let runtime = Handle::try_current().map_err(|e| {
            MeshError::Other(anyhow::anyhow!("loopback delivery needs a Tokio runtime: {}", e))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let in_flight = self.inner.in_flight.clone();
        let receiver = handler.clone();
        let endpoint = endpoint_id.to_string();
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match receiver.upgrade() {
                    Some(handler) => {
                        handler
                            .on_payload_received(&delivery.from, &delivery.payload)
                            .await
                    }
                    None => trace!(endpoint = %endpoint, "Handler gone, dropping payload"),
                }
                in_flight.finish();
            }
        });

        let mut node = self.inner.nodes.entry(endpoint_id.to_string()).or_default();
        node.handler = Some(handler);
        // Replacing the sender ends the previous drain task once it empties
        node.queue = Some(tx);
        Ok(())
    }

    /// Wait until every queued payload, including relays it triggers, has
    /// been handled
    pub async fn settle(&self) {
        self.inner.in_flight.wait_idle().await;
    }

    /// Keep two endpoints from discovering or reaching each other
    pub fn set_out_of_range(&self, a: &str, b: &str) {
        self.inner.out_of_range.insert(link_key(a, b));
    }

    pub fn fail_advertising(&self, endpoint_id: &str, status_code: i32) {
        if let Some(mut node) = self.inner.nodes.get_mut(endpoint_id) {
            node.fail_advertising = Some(status_code);
        }
    }

    pub fn fail_discovery(&self, endpoint_id: &str, status_code: i32) {
        if let Some(mut node) = self.inner.nodes.get_mut(endpoint_id) {
            node.fail_discovery = Some(status_code);
        }
    }

    /// Make every handshake involving `endpoint_id` fail with `status_code`
    pub fn refuse_connections(&self, endpoint_id: &str, status_code: i32) {
        if let Some(mut node) = self.inner.nodes.get_mut(endpoint_id) {
            node.refuse_connections = Some(status_code);
        }
    }

    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        self.inner.is_connected(a, b)
    }

    /// Drop an established link as if the radio lost it
    pub async fn disconnect(&self, a: &str, b: &str) {
        self.inner.sever(a, b, &[a, b]).await;
    }
}

/// One node's view of the [`LoopbackHub`]
pub struct LoopbackTransport {
    endpoint_id: EndpointId,
    hub: Arc<HubInner>,
}

impl LoopbackTransport {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn refusal(&self, remote: &str) -> Option<i32> {
        [self.endpoint_id.as_str(), remote]
            .iter()
            .find_map(|id| self.hub.nodes.get(*id).and_then(|node| node.refuse_connections))
    }

    async fn complete_handshake(&self, remote: &str, status: Result<(), i32>) {
        let local = self.endpoint_id.as_str();
        let (success, status_code) = match status {
            Ok(()) => (true, STATUS_OK),
            Err(code) => (false, code),
        };

        for (side, other) in [(remote, local), (local, remote)] {
            if let Some(handler) = self.hub.handler(side) {
                handler.on_connection_result(other, success, status_code).await;
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn start_advertising(&self, local_name: &str, service_id: &str) -> MeshResult<()> {
        {
            let mut node = self.hub.nodes.entry(self.endpoint_id.clone()).or_default();
            if let Some(code) = node.fail_advertising {
                return Err(MeshError::transport(code));
            }
            node.name = Some(local_name.to_string());
            node.service_id = Some(service_id.to_string());
            node.advertising = true;
        }

        let discoverers = self.hub.visible_from(&self.endpoint_id, |node| {
            node.discovering && node.service_id.as_deref() == Some(service_id)
        });
        for (endpoint_id, _) in discoverers {
            if let Some(handler) = self.hub.handler(&endpoint_id) {
                handler.on_endpoint_found(&self.endpoint_id, local_name).await;
            }
        }
        Ok(())
    }

    async fn start_discovery(&self, service_id: &str) -> MeshResult<()> {
        {
            let mut node = self.hub.nodes.entry(self.endpoint_id.clone()).or_default();
            if let Some(code) = node.fail_discovery {
                return Err(MeshError::transport(code));
            }
            node.service_id = Some(service_id.to_string());
            node.discovering = true;
        }

        let advertisers = self.hub.visible_from(&self.endpoint_id, |node| {
            node.advertising && node.service_id.as_deref() == Some(service_id)
        });
        if let Some(handler) = self.hub.handler(&self.endpoint_id) {
            for (endpoint_id, name) in advertisers {
                handler.on_endpoint_found(&endpoint_id, &name).await;
            }
        }
        Ok(())
    }

    async fn request_connection(&self, local_name: &str, remote_endpoint_id: &str) -> MeshResult<()> {
        let local = self.endpoint_id.as_str();
        if !self.hub.nodes.contains_key(remote_endpoint_id)
            || !self.hub.in_range(local, remote_endpoint_id)
        {
            return Err(MeshError::ConnectionRejected(format!(
                "{} is not reachable",
                remote_endpoint_id
            )));
        }

        {
            let key = link_key(local, remote_endpoint_id);
            if self.hub.links.contains_key(&key) {
                return Err(MeshError::ConnectionRejected(format!(
                    "already linked to {}",
                    remote_endpoint_id
                )));
            }
            self.hub.links.insert(
                key,
                LinkState::Requested {
                    accepted: HashSet::new(),
                },
            );
        }
        trace!(from = %local, to = %remote_endpoint_id, "Loopback connection requested");

        let remote_name = self.hub.name_of(remote_endpoint_id);
        if let Some(handler) = self.hub.handler(local) {
            handler.on_connection_initiated(remote_endpoint_id, &remote_name).await;
        }
        if let Some(handler) = self.hub.handler(remote_endpoint_id) {
            handler.on_connection_initiated(local, local_name).await;
        }
        Ok(())
    }

    async fn accept_connection(&self, endpoint_id: &str) -> MeshResult<()> {
        let local = self.endpoint_id.as_str();
        let key = link_key(local, endpoint_id);

        let both_accepted = {
            let Some(mut link) = self.hub.links.get_mut(&key) else {
                return Err(MeshError::PeerNotFound(endpoint_id.to_string()));
            };
            match &mut *link {
                LinkState::Requested { accepted } => {
                    accepted.insert(local.to_string());
                    accepted.len() == 2
                }
                LinkState::Connected => false,
            }
        };
        if !both_accepted {
            return Ok(());
        }

        match self.refusal(endpoint_id) {
            Some(code) => {
                self.hub.links.remove(&key);
                debug!(a = %local, b = %endpoint_id, status_code = code, "Loopback connection refused");
                self.complete_handshake(endpoint_id, Err(code)).await;
            }
            None => {
                self.hub.links.insert(key, LinkState::Connected);
                debug!(a = %local, b = %endpoint_id, "Loopback link established");
                self.complete_handshake(endpoint_id, Ok(())).await;
            }
        }
        Ok(())
    }

    async fn stop_all(&self) -> MeshResult<()> {
        if let Some(mut node) = self.hub.nodes.get_mut(&self.endpoint_id) {
            node.advertising = false;
            node.discovering = false;
        }

        for remote in self.hub.links_of(&self.endpoint_id) {
            self.hub
                .sever(&self.endpoint_id, &remote, &[remote.as_str()])
                .await;
        }
        Ok(())
    }

    async fn send_payload(&self, endpoint_id: &str, payload: &[u8]) -> MeshResult<()> {
        if !self.hub.is_connected(&self.endpoint_id, endpoint_id) {
            return Err(MeshError::TransmissionFailed(format!(
                "no link to {}",
                endpoint_id
            )));
        }

        if self.hub.handler(endpoint_id).is_none() {
            return Err(MeshError::PeerNotFound(endpoint_id.to_string()));
        }
        let queue = self
            .hub
            .nodes
            .get(endpoint_id)
            .and_then(|node| node.queue.clone())
            .ok_or_else(|| MeshError::PeerNotFound(endpoint_id.to_string()))?;

        self.hub.in_flight.begin();
        let delivery = Delivery {
            from: self.endpoint_id.clone(),
            payload: payload.to_vec(),
        };
        if queue.send(delivery).is_err() {
            self.hub.in_flight.finish();
            return Err(MeshError::TransmissionFailed(format!(
                "delivery queue for {} is closed",
                endpoint_id
            )));
        }
        trace!(from = %self.endpoint_id, to = %endpoint_id, bytes = payload.len(), "Loopback payload queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Handler recording every callback as a string
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl TransportEventHandler for Recorder {
        async fn on_endpoint_found(&self, endpoint_id: &str, remote_name: &str) {
            self.push(format!("found:{}:{}", endpoint_id, remote_name));
        }

        async fn on_endpoint_lost(&self, endpoint_id: &str) {
            self.push(format!("lost:{}", endpoint_id));
        }

        async fn on_connection_initiated(&self, endpoint_id: &str, remote_name: &str) {
            self.push(format!("initiated:{}:{}", endpoint_id, remote_name));
        }

        async fn on_connection_result(&self, endpoint_id: &str, success: bool, status_code: i32) {
            self.push(format!("result:{}:{}:{}", endpoint_id, success, status_code));
        }

        async fn on_disconnected(&self, endpoint_id: &str) {
            self.push(format!("disconnected:{}", endpoint_id));
        }

        async fn on_payload_received(&self, endpoint_id: &str, payload: &[u8]) {
            self.push(format!("payload:{}:{}", endpoint_id, String::from_utf8_lossy(payload)));
        }
    }

    fn node(hub: &LoopbackHub, id: &str) -> (Arc<LoopbackTransport>, Arc<Recorder>) {
        let transport = hub.transport(id);
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn TransportEventHandler> = Arc::downgrade(&recorder) as Weak<dyn TransportEventHandler>;
        hub.attach(id, weak).unwrap();
        (transport, recorder)
    }

    async fn link(a: &LoopbackTransport, b: &LoopbackTransport) {
        a.request_connection("a", b.endpoint_id()).await.unwrap();
        a.accept_connection(b.endpoint_id()).await.unwrap();
        b.accept_connection(a.endpoint_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_is_symmetric_to_start_order() {
        let hub = LoopbackHub::new();
        let (a, rec_a) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");

        b.start_discovery("svc").await.unwrap();
        a.start_advertising("alice", "svc").await.unwrap();
        assert_eq!(rec_b.events(), vec!["found:ep-a:alice"]);

        b.start_advertising("bob", "svc").await.unwrap();
        a.start_discovery("svc").await.unwrap();
        assert_eq!(rec_a.events(), vec!["found:ep-b:bob"]);
    }

    #[tokio::test]
    async fn test_discovery_respects_service_and_range() {
        let hub = LoopbackHub::new();
        let (a, _) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");
        let (c, _) = node(&hub, "ep-c");
        hub.set_out_of_range("ep-b", "ep-c");

        a.start_advertising("alice", "other").await.unwrap();
        c.start_advertising("carol", "svc").await.unwrap();
        b.start_discovery("svc").await.unwrap();

        assert!(rec_b.events().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_requires_both_accepts() {
        let hub = LoopbackHub::new();
        let (a, rec_a) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");

        a.request_connection("alice", "ep-b").await.unwrap();
        assert_eq!(rec_b.events(), vec!["initiated:ep-a:alice"]);

        a.accept_connection("ep-b").await.unwrap();
        assert!(!hub.is_connected("ep-a", "ep-b"));
        assert!(a.send_payload("ep-b", b"hi").await.is_err());

        b.accept_connection("ep-a").await.unwrap();
        assert!(hub.is_connected("ep-a", "ep-b"));
        assert!(rec_a.events().contains(&"result:ep-b:true:0".to_string()));
        assert!(rec_b.events().contains(&"result:ep-a:true:0".to_string()));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_status() {
        let hub = LoopbackHub::new();
        let (a, rec_a) = node(&hub, "ep-a");
        let (b, _) = node(&hub, "ep-b");
        hub.refuse_connections("ep-b", 8004);

        link(&a, &b).await;

        assert!(!hub.is_connected("ep-a", "ep-b"));
        assert!(rec_a.events().contains(&"result:ep-b:false:8004".to_string()));
    }

    #[tokio::test]
    async fn test_payload_delivery_and_stop() {
        let hub = LoopbackHub::new();
        let (a, rec_a) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");
        link(&a, &b).await;

        a.send_payload("ep-b", b"hello").await.unwrap();
        hub.settle().await;
        assert!(rec_b.events().contains(&"payload:ep-a:hello".to_string()));

        a.stop_all().await.unwrap();
        assert!(!hub.is_connected("ep-a", "ep-b"));
        assert!(rec_b.events().contains(&"disconnected:ep-a".to_string()));
        assert!(!rec_a.events().iter().any(|e| e.starts_with("disconnected")));
    }

    #[tokio::test]
    async fn test_payloads_queue_in_send_order() {
        let hub = LoopbackHub::new();
        let (a, _) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");
        link(&a, &b).await;

        a.send_payload("ep-b", b"first").await.unwrap();
        a.send_payload("ep-b", b"second").await.unwrap();
        assert!(!rec_b.events().iter().any(|e| e.starts_with("payload")));

        hub.settle().await;
        let payloads: Vec<String> = rec_b
            .events()
            .into_iter()
            .filter(|e| e.starts_with("payload"))
            .collect();
        assert_eq!(payloads, vec!["payload:ep-a:first", "payload:ep-a:second"]);
    }

    #[tokio::test]
    async fn test_settle_returns_when_idle() {
        let hub = LoopbackHub::new();
        hub.settle().await;
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let hub = LoopbackHub::new();
        let (a, _) = node(&hub, "ep-a");
        hub.fail_advertising("ep-a", 8002);

        let err = a.start_advertising("alice", "svc").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::TransportFailure { status_code: Some(8002), .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_handler_stops_callbacks() {
        let hub = LoopbackHub::new();
        let (a, _) = node(&hub, "ep-a");
        let (b, rec_b) = node(&hub, "ep-b");
        link(&a, &b).await;
        drop(rec_b);

        assert!(matches!(
            a.send_payload("ep-b", b"x").await,
            Err(MeshError::PeerNotFound(_))
        ));
    }
}
