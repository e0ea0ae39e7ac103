//! Peer RPC seam
//!
//! [`PeerNetwork`] has one method per peer endpoint. Requests are addressed by
//! the DID hosted on the remote node, except provider checks, which go to a
//! peer ID taken from the transport's provider list.

use crate::error::PeerError;
use crate::types::{
    BasicResponse, ChainSyncReply, ChainSyncRequest, ConsensusReply, ConsensusRequest,
    CreditRequest, PeerStatusReply, PledgeReply, PledgeRequest, ProviderCheckReply,
    ProviderCheckRequest, SendTokenRequest, UnlockTokensRequest, UpdatePledgeRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn ping(&self, did: &str) -> Result<BasicResponse, PeerError>;

    async fn peer_status(&self, did: &str) -> Result<PeerStatusReply, PeerError>;

    async fn consensus(
        &self,
        did: &str,
        req: &ConsensusRequest,
    ) -> Result<ConsensusReply, PeerError>;

    async fn request_pledge(&self, did: &str, req: &PledgeRequest)
        -> Result<PledgeReply, PeerError>;

    async fn update_pledge(
        &self,
        did: &str,
        req: &UpdatePledgeRequest,
    ) -> Result<BasicResponse, PeerError>;

    async fn unlock_tokens(
        &self,
        did: &str,
        req: &UnlockTokensRequest,
    ) -> Result<BasicResponse, PeerError>;

    async fn send_credit(&self, did: &str, req: &CreditRequest)
        -> Result<BasicResponse, PeerError>;

    async fn send_token(&self, did: &str, req: &SendTokenRequest)
        -> Result<BasicResponse, PeerError>;

    async fn sync_chain(
        &self,
        did: &str,
        req: &ChainSyncRequest,
    ) -> Result<ChainSyncReply, PeerError>;

    async fn provider_check(
        &self,
        peer_id: &str,
        req: &ProviderCheckRequest,
    ) -> Result<ProviderCheckReply, PeerError>;
}

/// Where a DID can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub did: String,
    pub peer_id: String,
    /// Base URL of the peer's RPC server
    #[serde(default)]
    pub url: String,
}

/// DID -> endpoint directory
#[derive(Clone, Default)]
pub struct PeerDirectory {
    by_did: Arc<DashMap<String, PeerEndpoint>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: PeerEndpoint) {
        self.by_did.insert(endpoint.did.clone(), endpoint);
    }

    pub fn get(&self, did: &str) -> Option<PeerEndpoint> {
        self.by_did.get(did).map(|e| e.value().clone())
    }

    pub fn peer_id_of(&self, did: &str) -> Option<String> {
        self.by_did.get(did).map(|e| e.peer_id.clone())
    }

    /// Any endpoint served by the given peer
    pub fn by_peer_id(&self, peer_id: &str) -> Option<PeerEndpoint> {
        self.by_did
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_did.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_did.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lookups() {
        let directory = PeerDirectory::new();
        directory.register(PeerEndpoint {
            did: "did-a".to_string(),
            peer_id: "peer-a".to_string(),
            url: "http://127.0.0.1:20000".to_string(),
        });
        assert_eq!(directory.peer_id_of("did-a").as_deref(), Some("peer-a"));
        assert_eq!(directory.by_peer_id("peer-a").unwrap().did, "did-a");
        assert!(directory.by_peer_id("peer-b").is_none());
    }
}
