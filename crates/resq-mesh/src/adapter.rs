//! Transport abstraction for short-range discovery and payload delivery

use crate::error::MeshResult;
use async_trait::async_trait;

/// Status code reported with a successful connection result
pub const STATUS_OK: i32 = 0;

/// Trait for platform-agnostic radio transport operations
///
/// Implementations report asynchronous outcomes (discovered endpoints,
/// connection results, payloads) through a [`TransportEventHandler`].
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Start advertising this device under `local_name`
    async fn start_advertising(&self, local_name: &str, service_id: &str) -> MeshResult<()>;

    /// Start discovering advertisers of `service_id`
    async fn start_discovery(&self, service_id: &str) -> MeshResult<()>;

    /// Ask a discovered endpoint for a connection
    async fn request_connection(&self, local_name: &str, remote_endpoint_id: &str) -> MeshResult<()>;

    /// Accept an initiated connection
    async fn accept_connection(&self, endpoint_id: &str) -> MeshResult<()>;

    /// Stop advertising and discovery and tear down every link
    async fn stop_all(&self) -> MeshResult<()>;

    /// Send raw bytes to a connected endpoint
    async fn send_payload(&self, endpoint_id: &str, payload: &[u8]) -> MeshResult<()>;
}

/// Callbacks a transport delivers to the mesh
///
/// Callbacks may arrive concurrently from several links.
#[async_trait]
pub trait TransportEventHandler: Send + Sync {
    async fn on_endpoint_found(&self, endpoint_id: &str, remote_name: &str);

    async fn on_endpoint_lost(&self, endpoint_id: &str);

    async fn on_connection_initiated(&self, endpoint_id: &str, remote_name: &str);

    async fn on_connection_result(&self, endpoint_id: &str, success: bool, status_code: i32);

    async fn on_disconnected(&self, endpoint_id: &str);

    async fn on_payload_received(&self, endpoint_id: &str, payload: &[u8]);
}
