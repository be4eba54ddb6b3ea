//! Pending and established peer links

use crate::envelope::EndpointId;
use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Link state of a peer endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Connected,
}

/// A peer endpoint known to the directory
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub endpoint_id: EndpointId,
    pub nickname: String,
    pub state: PeerState,
    pub since: DateTime<Utc>,
}

/// Decide whether the local node should request the connection
///
/// Only the side whose nickname sorts strictly lower initiates, so at most
/// one request is issued per discovered pair. Equal nicknames cannot be
/// ordered and are reported as a collision.
pub fn should_initiate(local: &str, remote: &str) -> MeshResult<bool> {
    if local == remote {
        return Err(MeshError::NicknameCollision(remote.to_string()));
    }
    Ok(local < remote)
}

/// Tracks peer endpoints by endpoint id
///
/// Pending entries that never receive a connection result stay here until
/// `clear()`; there is no timeout.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    endpoints: HashMap<EndpointId, PeerEndpoint>,
    /// Nickname whose public key arrived over each endpoint
    key_owners: HashMap<EndpointId, String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an in-progress connection with `endpoint_id`
    ///
    /// An established link is never demoted: a repeated initiation for a
    /// connected endpoint leaves it connected, so a failed re-attempt
    /// cannot drop it.
    pub fn register_pending(&mut self, endpoint_id: &str, nickname: &str) {
        if let Some(existing) = self.endpoints.get(endpoint_id) {
            if existing.state == PeerState::Connected {
                debug!(endpoint = %endpoint_id, peer = %existing.nickname, "Already connected, keeping link");
                return;
            }
        }

        debug!(endpoint = %endpoint_id, peer = %nickname, "Registered pending connection");
        self.endpoints.insert(
            endpoint_id.to_string(),
            PeerEndpoint {
                endpoint_id: endpoint_id.to_string(),
                nickname: nickname.to_string(),
                state: PeerState::Pending,
                since: Utc::now(),
            },
        );
    }

    /// Mark a pending endpoint as connected and return its nickname
    pub fn promote(&mut self, endpoint_id: &str) -> MeshResult<String> {
        let endpoint = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| MeshError::PeerNotFound(endpoint_id.to_string()))?;

        endpoint.state = PeerState::Connected;
        endpoint.since = Utc::now();
        info!(endpoint = %endpoint_id, peer = %endpoint.nickname, "Peer connected");
        Ok(endpoint.nickname.clone())
    }

    /// Insert an endpoint directly as connected
    ///
    /// Used when a connection result arrives for an endpoint the directory
    /// never saw initiated.
    pub fn insert_connected(&mut self, endpoint_id: &str, nickname: &str) {
        self.endpoints.insert(
            endpoint_id.to_string(),
            PeerEndpoint {
                endpoint_id: endpoint_id.to_string(),
                nickname: nickname.to_string(),
                state: PeerState::Connected,
                since: Utc::now(),
            },
        );
        info!(endpoint = %endpoint_id, peer = %nickname, "Peer connected");
    }

    /// Drop a pending entry after a failed connection attempt
    pub fn discard_pending(&mut self, endpoint_id: &str) -> Option<String> {
        match self.endpoints.get(endpoint_id) {
            Some(endpoint) if endpoint.state == PeerState::Pending => self
                .endpoints
                .remove(endpoint_id)
                .map(|endpoint| endpoint.nickname),
            _ => None,
        }
    }

    /// Remove an endpoint in any state and return its nickname
    pub fn remove(&mut self, endpoint_id: &str) -> Option<String> {
        let removed = self.endpoints.remove(endpoint_id)?;
        info!(endpoint = %endpoint_id, peer = %removed.nickname, "Removed peer");
        Some(removed.nickname)
    }

    /// Remember that `nickname`'s public key arrived over `endpoint_id`
    pub fn record_key_owner(&mut self, endpoint_id: &str, nickname: &str) {
        self.key_owners
            .insert(endpoint_id.to_string(), nickname.to_string());
    }

    /// Forget and return the key owner recorded for `endpoint_id`
    pub fn take_key_owner(&mut self, endpoint_id: &str) -> Option<String> {
        self.key_owners.remove(endpoint_id)
    }

    /// Connected peers ordered by endpoint id
    pub fn connected_peers(&self) -> BTreeMap<EndpointId, String> {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.state == PeerState::Connected)
            .map(|endpoint| (endpoint.endpoint_id.clone(), endpoint.nickname.clone()))
            .collect()
    }

    /// Connected endpoint ids, optionally excluding one
    pub fn connected_endpoints_except(&self, excluded: Option<&str>) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|endpoint| endpoint.state == PeerState::Connected)
            .filter(|endpoint| Some(endpoint.endpoint_id.as_str()) != excluded)
            .map(|endpoint| endpoint.endpoint_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether a connected link to `nickname` exists
    pub fn has_key_eligible_peer(&self, nickname: &str) -> bool {
        self.endpoints
            .values()
            .any(|endpoint| endpoint.state == PeerState::Connected && endpoint.nickname == nickname)
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&PeerEndpoint> {
        self.endpoints.get(endpoint_id)
    }

    pub fn pending_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.state == PeerState::Pending)
            .count()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
        self.key_owners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pending_then_connected() {
        let mut directory = PeerDirectory::new();
        directory.register_pending("ep1", "bob");

        assert!(directory.connected_peers().is_empty());
        assert!(!directory.has_key_eligible_peer("bob"));
        assert_eq!(directory.pending_count(), 1);

        assert_eq!(directory.promote("ep1").unwrap(), "bob");
        assert_eq!(directory.connected_peers().get("ep1").map(String::as_str), Some("bob"));
        assert!(directory.has_key_eligible_peer("bob"));
        assert_eq!(directory.pending_count(), 0);
    }

    #[test]
    fn test_promote_unknown_endpoint() {
        let mut directory = PeerDirectory::new();
        assert!(matches!(
            directory.promote("ghost"),
            Err(MeshError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_remove_returns_nickname() {
        let mut directory = PeerDirectory::new();
        directory.register_pending("ep1", "bob");
        directory.promote("ep1").unwrap();

        assert_eq!(directory.remove("ep1").as_deref(), Some("bob"));
        assert_eq!(directory.remove("ep1"), None);
        assert!(!directory.has_key_eligible_peer("bob"));
    }

    #[test]
    fn test_discard_pending_leaves_connected() {
        let mut directory = PeerDirectory::new();
        directory.register_pending("ep1", "bob");
        directory.register_pending("ep2", "carol");
        directory.promote("ep2").unwrap();

        assert_eq!(directory.discard_pending("ep1").as_deref(), Some("bob"));
        assert_eq!(directory.discard_pending("ep2"), None);
        assert_eq!(directory.connected_peers().len(), 1);
    }

    #[test]
    fn test_reinitiation_keeps_connected_link() {
        let mut directory = PeerDirectory::new();
        directory.register_pending("ep1", "bob");
        directory.promote("ep1").unwrap();

        directory.register_pending("ep1", "bob");
        assert_eq!(directory.pending_count(), 0);
        assert_eq!(directory.discard_pending("ep1"), None);
        assert_eq!(directory.connected_peers().get("ep1").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_key_owner_tracking() {
        let mut directory = PeerDirectory::new();
        directory.insert_connected("ep1", "Peer");
        directory.record_key_owner("ep1", "bob");

        assert_eq!(directory.take_key_owner("ep1").as_deref(), Some("bob"));
        assert_eq!(directory.take_key_owner("ep1"), None);

        directory.record_key_owner("ep2", "carol");
        directory.clear();
        assert_eq!(directory.take_key_owner("ep2"), None);
    }

    #[test]
    fn test_connected_endpoints_except_source() {
        let mut directory = PeerDirectory::new();
        for (id, name) in [("c", "carol"), ("a", "alice"), ("b", "bob")] {
            directory.register_pending(id, name);
            directory.promote(id).unwrap();
        }
        directory.register_pending("p", "pending");

        assert_eq!(directory.connected_endpoints_except(None), vec!["a", "b", "c"]);
        assert_eq!(directory.connected_endpoints_except(Some("b")), vec!["a", "c"]);
    }

    #[test]
    fn test_tie_break_examples() {
        assert!(should_initiate("alice", "bob").unwrap());
        assert!(!should_initiate("bob", "alice").unwrap());
        assert!(should_initiate("Node-1", "Node-10").unwrap());
        assert!(should_initiate("Zed", "alice").unwrap());
        assert!(matches!(
            should_initiate("same", "same"),
            Err(MeshError::NicknameCollision(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_exactly_one_side_initiates(x in "\\PC{0,12}", y in "\\PC{0,12}") {
            prop_assume!(x != y);
            let x_initiates = should_initiate(&x, &y).unwrap();
            let y_initiates = should_initiate(&y, &x).unwrap();
            prop_assert!(x_initiates != y_initiates);
            prop_assert_eq!(x_initiates, x < y);
        }

        #[test]
        fn prop_near_duplicates_resolve(base in "[a-zA-Z0-9]{1,10}", suffix in "[a-zA-Z0-9 ]{1,3}") {
            let longer = format!("{}{}", base, suffix);
            prop_assert!(should_initiate(&base, &longer).unwrap());
            prop_assert!(!should_initiate(&longer, &base).unwrap());
        }
    }
}
