//! In-process cluster for end-to-end protocol tests
//!
//! Every node gets its own chain store and context but shares one content
//! swarm, one DID registry and one peer directory. [`LocalNetwork`] routes
//! peer calls straight into the target node's responder.

mod responder_test;
mod transfer_flow_test;

use crate::context::{ConsensusConfig, NodeContextBuilder};
use crate::error::PeerError;
use crate::network::{PeerDirectory, PeerEndpoint, PeerNetwork};
use crate::node::LedgerNode;
use crate::quorum::{QuorumData, QuorumType};
use crate::transport::MemorySwarm;
use crate::types::{
    BasicResponse, ChainSyncReply, ChainSyncRequest, ConsensusReply, ConsensusRequest,
    CreditRequest, PeerStatusReply, PledgeReply, PledgeRequest, ProviderCheckReply,
    ProviderCheckRequest, SendTokenRequest, TransferRequest, UnlockTokensRequest,
    UpdatePledgeRequest,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use token_chain::{ChainStore, DidCrypto, DidRegistry, KeyDid};

/// Routes peer calls to nodes in the same process
#[derive(Default)]
pub struct LocalNetwork {
    by_did: RwLock<HashMap<String, Weak<LedgerNode>>>,
    by_peer: RwLock<HashMap<String, Weak<LedgerNode>>>,
    down: RwLock<HashSet<String>>,
    /// Every token delivery attempted, reachable or not
    deliveries: RwLock<Vec<SendTokenRequest>>,
}

impl LocalNetwork {
    fn attach(&self, node: &Arc<LedgerNode>) {
        let weak = Arc::downgrade(node);
        self.by_peer
            .write()
            .insert(node.ctx().peer_id.clone(), weak.clone());
        let mut by_did = self.by_did.write();
        for did in node.ctx().hosted_dids() {
            by_did.insert(did, weak.clone());
        }
    }

    /// Make calls to `did` fail as if its node were offline
    pub fn take_down(&self, did: &str) {
        self.down.write().insert(did.to_string());
    }

    pub fn bring_up(&self, did: &str) {
        self.down.write().remove(did);
    }

    pub fn last_delivery(&self) -> Option<SendTokenRequest> {
        self.deliveries.read().last().cloned()
    }

    fn node(&self, did: &str) -> Result<Arc<LedgerNode>, PeerError> {
        if self.down.read().contains(did) {
            return Err(PeerError::Unreachable {
                did: did.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.by_did
            .read()
            .get(did)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PeerError::UnknownPeer(did.to_string()))
    }

    fn peer(&self, peer_id: &str) -> Result<Arc<LedgerNode>, PeerError> {
        self.by_peer
            .read()
            .get(peer_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn ping(&self, did: &str) -> Result<BasicResponse, PeerError> {
        Ok(self.node(did)?.responder().ping())
    }

    async fn peer_status(&self, did: &str) -> Result<PeerStatusReply, PeerError> {
        Ok(self.node(did)?.responder().peer_status(did))
    }

    async fn consensus(
        &self,
        did: &str,
        req: &ConsensusRequest,
    ) -> Result<ConsensusReply, PeerError> {
        Ok(self.node(did)?.responder().consensus(did, req).await)
    }

    async fn request_pledge(
        &self,
        did: &str,
        req: &PledgeRequest,
    ) -> Result<PledgeReply, PeerError> {
        Ok(self.node(did)?.responder().request_pledge(did, req).await)
    }

    async fn update_pledge(
        &self,
        did: &str,
        req: &UpdatePledgeRequest,
    ) -> Result<BasicResponse, PeerError> {
        Ok(self.node(did)?.responder().update_pledge(did, req).await)
    }

    async fn unlock_tokens(
        &self,
        did: &str,
        req: &UnlockTokensRequest,
    ) -> Result<BasicResponse, PeerError> {
        Ok(self.node(did)?.responder().unlock_tokens(did, req).await)
    }

    async fn send_credit(
        &self,
        did: &str,
        req: &CreditRequest,
    ) -> Result<BasicResponse, PeerError> {
        Ok(self.node(did)?.responder().store_credit(did, req))
    }

    async fn send_token(
        &self,
        did: &str,
        req: &SendTokenRequest,
    ) -> Result<BasicResponse, PeerError> {
        self.deliveries.write().push(req.clone());
        Ok(self.node(did)?.responder().receive_tokens(did, req).await)
    }

    async fn sync_chain(
        &self,
        did: &str,
        req: &ChainSyncRequest,
    ) -> Result<ChainSyncReply, PeerError> {
        Ok(self.node(did)?.responder().chain_sync(req))
    }

    async fn provider_check(
        &self,
        peer_id: &str,
        req: &ProviderCheckRequest,
    ) -> Result<ProviderCheckReply, PeerError> {
        Ok(self.peer(peer_id)?.responder().provider_check(req))
    }
}

pub fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        consensus_timeout: Duration::from_secs(5),
        status_timeout: Duration::from_secs(2),
        pledge_rpc_timeout: Duration::from_secs(2),
        pledge_poll_interval: Duration::from_millis(10),
        pledge_timeout: Duration::from_secs(2),
    }
}

/// Nodes sharing a swarm, a DID registry and a directory
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub swarm: MemorySwarm,
    pub registry: DidRegistry,
    pub directory: PeerDirectory,
    nodes: Vec<Arc<LedgerNode>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            network: Arc::new(LocalNetwork::default()),
            swarm: MemorySwarm::new(),
            registry: DidRegistry::new(),
            directory: PeerDirectory::new(),
            nodes: Vec::new(),
        }
    }

    /// Start a node hosting one fresh DID, returns the node and the DID
    pub fn spawn_node(&mut self, name: &str) -> (Arc<LedgerNode>, String) {
        let key = Arc::new(KeyDid::generate());
        let did = key.did().to_string();
        self.registry.register(Arc::new(key.verify_only()));

        let peer_id = format!("peer-{name}");
        self.directory.register(PeerEndpoint {
            did: did.clone(),
            peer_id: peer_id.clone(),
            url: String::new(),
        });

        let chain = Arc::new(ChainStore::temporary().expect("temporary chain store"));
        let ctx = NodeContextBuilder::new(
            peer_id.clone(),
            chain,
            Arc::new(self.swarm.handle(peer_id)),
            self.network.clone(),
        )
        .resolver(Arc::new(self.registry.clone()))
        .directory(self.directory.clone())
        .config(fast_config())
        .host_did(key)
        .build();

        let node = Arc::new(LedgerNode::new(Arc::new(ctx)));
        self.network.attach(&node);
        self.nodes.push(node.clone());
        (node, did)
    }
}

/// Sender, receiver and a configured quorum whose members hold pledgeable tokens
pub struct TransferSetup {
    pub cluster: TestCluster,
    pub sender: Arc<LedgerNode>,
    pub sender_did: String,
    pub receiver: Arc<LedgerNode>,
    pub receiver_did: String,
    pub quorum: Vec<(Arc<LedgerNode>, String)>,
}

impl TransferSetup {
    pub async fn new(quorum_size: usize, tokens_per_member: usize) -> Self {
        let mut cluster = TestCluster::new();
        let (sender, sender_did) = cluster.spawn_node("sender");
        let (receiver, receiver_did) = cluster.spawn_node("receiver");

        let mut quorum = Vec::new();
        for i in 0..quorum_size {
            let (node, did) = cluster.spawn_node(&format!("quorum-{i}"));
            node.issuer()
                .mint(&did, tokens_per_member, 1.0)
                .await
                .expect("mint pledge tokens");
            quorum.push((node, did));
        }
        sender
            .ctx()
            .quorums
            .add_quorum(
                quorum
                    .iter()
                    .map(|(_, did)| QuorumData::new(QuorumType::Configured, did.clone()))
                    .collect(),
            )
            .expect("configure quorum");

        Self {
            cluster,
            sender,
            sender_did,
            receiver,
            receiver_did,
            quorum,
        }
    }

    pub fn transfer_request(&self, tokens: Vec<String>, comment: &str) -> TransferRequest {
        TransferRequest {
            sender_did: self.sender_did.clone(),
            receiver_did: self.receiver_did.clone(),
            receiver_peer_id: String::new(),
            tokens,
            comment: comment.to_string(),
            quorum_type: QuorumType::Configured,
        }
    }

    pub fn quorum_node(&self, did: &str) -> Option<&Arc<LedgerNode>> {
        self.quorum.iter().find(|(_, d)| d == did).map(|(n, _)| n)
    }
}
