//! Content-addressed transport
//!
//! The ledger uses pins as ownership signals: the owner pins a token ID,
//! quorum members pin the token states they consumed. [`ContentTransport`] is
//! the only thing the protocol needs from the storage network.
//!
//! [`MemorySwarm`] keeps content and provider sets in process. Every node
//! gets its own [`MemoryTransport`] handle bound to its peer ID.

use crate::error::TransportError;
use crate::types::{ProviderCheckReply, ProviderRole};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

#[async_trait]
pub trait ContentTransport: Send + Sync {
    /// ID `put` would assign to the data, without storing it
    fn content_id(&self, data: &[u8]) -> String;

    /// Store and pin data, returning its content ID
    async fn put(&self, data: &[u8]) -> Result<String, TransportError>;

    async fn get(&self, id: &str) -> Result<Vec<u8>, TransportError>;

    async fn pin(&self, id: &str) -> Result<(), TransportError>;

    async fn unpin(&self, id: &str) -> Result<(), TransportError>;

    /// Peer IDs currently providing the content
    async fn find_providers(&self, id: &str) -> Result<Vec<String>, TransportError>;
}

#[derive(Default)]
struct SwarmState {
    blobs: DashMap<String, Vec<u8>>,
    providers: DashMap<String, BTreeSet<String>>,
}

/// Shared in-process content network
#[derive(Clone, Default)]
pub struct MemorySwarm {
    state: Arc<SwarmState>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle acting as `peer_id`
    pub fn handle(&self, peer_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            peer_id: peer_id.into(),
            state: self.state.clone(),
        }
    }
}

/// One peer's view of a [`MemorySwarm`]
#[derive(Clone)]
pub struct MemoryTransport {
    peer_id: String,
    state: Arc<SwarmState>,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl ContentTransport for MemoryTransport {
    fn content_id(&self, data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    async fn put(&self, data: &[u8]) -> Result<String, TransportError> {
        let id = self.content_id(data);
        self.state.blobs.insert(id.clone(), data.to_vec());
        self.pin(&id).await?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>, TransportError> {
        self.state
            .blobs
            .get(id)
            .map(|b| b.value().clone())
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    async fn pin(&self, id: &str) -> Result<(), TransportError> {
        self.state
            .providers
            .entry(id.to_string())
            .or_default()
            .insert(self.peer_id.clone());
        Ok(())
    }

    async fn unpin(&self, id: &str) -> Result<(), TransportError> {
        if let Some(mut set) = self.state.providers.get_mut(id) {
            set.remove(&self.peer_id);
        }
        Ok(())
    }

    async fn find_providers(&self, id: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .state
            .providers
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Why this node provides a piece of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub did: String,
    pub func_id: u32,
    pub role: ProviderRole,
    /// Transaction the content was pinned for, if any
    pub reference: String,
}

/// Content ID -> provider record for everything this node pins
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    records: Arc<DashMap<String, ProviderRecord>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &str, did: &str, role: ProviderRole) {
        self.set_with_reference(id, did, role, "");
    }

    pub fn set_with_reference(&self, id: &str, did: &str, role: ProviderRole, reference: &str) {
        self.records.insert(
            id.to_string(),
            ProviderRecord {
                did: did.to_string(),
                func_id: 0,
                role,
                reference: reference.to_string(),
            },
        );
    }

    /// Record `id` for `reference` unless it is already held for another one
    ///
    /// Check and insert happen under the map entry lock. Returns whether the
    /// record is new, or the conflicting record.
    pub fn claim(
        &self,
        id: &str,
        did: &str,
        role: ProviderRole,
        reference: &str,
    ) -> Result<bool, ProviderRecord> {
        let record = ProviderRecord {
            did: did.to_string(),
            func_id: 0,
            role,
            reference: reference.to_string(),
        };
        match self.records.entry(id.to_string()) {
            Entry::Occupied(entry)
                if entry.get().role == role && entry.get().reference != reference =>
            {
                Err(entry.get().clone())
            }
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                Ok(false)
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ProviderRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Provider check answer for `id`
    pub fn check(&self, id: &str) -> ProviderCheckReply {
        match self.get(id) {
            Some(record) => ProviderCheckReply {
                status: true,
                token: id.to_string(),
                did: record.did,
                func_id: record.func_id,
                role: Some(record.role),
                reference: record.reference,
            },
            None => ProviderCheckReply {
                status: false,
                token: id.to_string(),
                did: String::new(),
                func_id: 0,
                role: None,
                reference: String::new(),
            },
        }
    }

    pub fn remove(&self, id: &str) {
        self.records.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pins_are_per_peer() {
        let swarm = MemorySwarm::new();
        let a = swarm.handle("peer-a");
        let b = swarm.handle("peer-b");

        let id = a.put(b"token").await.unwrap();
        assert_eq!(id, b.content_id(b"token"));
        assert_eq!(b.get(&id).await.unwrap(), b"token".to_vec());

        b.pin(&id).await.unwrap();
        assert_eq!(
            a.find_providers(&id).await.unwrap(),
            vec!["peer-a".to_string(), "peer-b".to_string()]
        );

        a.unpin(&id).await.unwrap();
        assert_eq!(a.find_providers(&id).await.unwrap(), vec!["peer-b".to_string()]);
        assert!(a.find_providers("unknown").await.unwrap().is_empty());
    }

    #[test]
    fn test_provider_registry() {
        let registry = ProviderRegistry::new();
        registry.set("t1", "did-a", ProviderRole::Owner);
        assert_eq!(registry.get("t1").unwrap().role, ProviderRole::Owner);
        registry.set("t1", "did-a", ProviderRole::PrevSender);
        assert_eq!(registry.get("t1").unwrap().role, ProviderRole::PrevSender);
        registry.set_with_reference("s1", "did-q", ProviderRole::Quorum, "tid");
        assert_eq!(registry.get("s1").unwrap().reference, "tid");
        registry.remove("t1");
        assert!(registry.get("t1").is_none());
    }

    #[test]
    fn test_claim_holds_state_for_one_transaction() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.claim("s1", "did-q", ProviderRole::Quorum, "tid-a"), Ok(true));
        // the same transaction may ask again
        assert_eq!(registry.claim("s1", "did-q", ProviderRole::Quorum, "tid-a"), Ok(false));

        let held = registry
            .claim("s1", "did-q", ProviderRole::Quorum, "tid-b")
            .unwrap_err();
        assert_eq!(held.reference, "tid-a");
        assert_eq!(registry.get("s1").unwrap().reference, "tid-a");
    }

    #[test]
    fn test_concurrent_claims_one_wins() {
        let registry = ProviderRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .claim("s1", "did-q", ProviderRole::Quorum, &format!("tid-{i}"))
                        .is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1);
    }
}
