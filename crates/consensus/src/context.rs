//! Shared node state
//!
//! Everything the coordinator, responder and validator touch lives in one
//! [`NodeContext`] behind an `Arc`.

use crate::credit::CreditStore;
use crate::network::{PeerDirectory, PeerNetwork};
use crate::quorum::QuorumManager;
use crate::transport::{ContentTransport, ProviderRegistry};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use token_chain::{ChainStore, DidCrypto, DidError, DidRegistry, DidResolver, TokenStore};

/// Protocol timing
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Budget for one quorum consensus call
    pub consensus_timeout: Duration,
    /// Budget for ping and status calls
    pub status_timeout: Duration,
    /// Budget for one pledge request
    pub pledge_rpc_timeout: Duration,
    /// How often pledge completion is checked
    pub pledge_poll_interval: Duration,
    /// How long to wait for the pledge to complete
    pub pledge_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            consensus_timeout: Duration::from_secs(600),
            status_timeout: Duration::from_secs(120),
            pledge_rpc_timeout: Duration::from_secs(60),
            pledge_poll_interval: Duration::from_secs(1),
            pledge_timeout: Duration::from_secs(300),
        }
    }
}

pub struct NodeContext {
    /// This node's transport peer ID
    pub peer_id: String,
    pub chain: Arc<ChainStore>,
    pub tokens: TokenStore,
    pub quorums: QuorumManager,
    pub transport: Arc<dyn ContentTransport>,
    pub network: Arc<dyn PeerNetwork>,
    pub resolver: Arc<dyn DidResolver>,
    pub directory: PeerDirectory,
    pub providers: ProviderRegistry,
    pub credits: CreditStore,
    pub config: ConsensusConfig,
    local_dids: DashMap<String, Arc<dyn DidCrypto>>,
}

impl NodeContext {
    /// Start hosting a DID on this node
    pub fn host_did(&self, did: Arc<dyn DidCrypto>) {
        self.local_dids.insert(did.did().to_string(), did);
    }

    /// Signing capability for a hosted DID
    pub fn local_did(&self, did: &str) -> Option<Arc<dyn DidCrypto>> {
        self.local_dids.get(did).map(|d| d.value().clone())
    }

    pub fn hosts(&self, did: &str) -> bool {
        self.local_dids.contains_key(did)
    }

    pub fn hosted_dids(&self) -> Vec<String> {
        self.local_dids.iter().map(|d| d.key().clone()).collect()
    }

    /// Verification capability for any DID, hosted ones first
    pub fn resolve(&self, did: &str) -> Result<Arc<dyn DidCrypto>, DidError> {
        match self.local_did(did) {
            Some(local) => Ok(local),
            None => self.resolver.resolve(did),
        }
    }

    /// Transport peer ID serving a DID
    pub fn peer_of(&self, did: &str) -> Option<String> {
        if self.hosts(did) {
            return Some(self.peer_id.clone());
        }
        self.directory.peer_id_of(did)
    }
}

/// Builder for NodeContext
pub struct NodeContextBuilder {
    peer_id: String,
    chain: Arc<ChainStore>,
    transport: Arc<dyn ContentTransport>,
    network: Arc<dyn PeerNetwork>,
    tokens: TokenStore,
    quorums: QuorumManager,
    resolver: Option<Arc<dyn DidResolver>>,
    directory: PeerDirectory,
    config: ConsensusConfig,
    dids: Vec<Arc<dyn DidCrypto>>,
}

impl NodeContextBuilder {
    pub fn new(
        peer_id: impl Into<String>,
        chain: Arc<ChainStore>,
        transport: Arc<dyn ContentTransport>,
        network: Arc<dyn PeerNetwork>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            chain,
            transport,
            network,
            tokens: TokenStore::new(),
            quorums: QuorumManager::new(),
            resolver: None,
            directory: PeerDirectory::new(),
            config: ConsensusConfig::default(),
            dids: Vec::new(),
        }
    }

    pub fn tokens(mut self, tokens: TokenStore) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn quorums(mut self, quorums: QuorumManager) -> Self {
        self.quorums = quorums;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn DidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn directory(mut self, directory: PeerDirectory) -> Self {
        self.directory = directory;
        self
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host_did(mut self, did: Arc<dyn DidCrypto>) -> Self {
        self.dids.push(did);
        self
    }

    pub fn build(self) -> NodeContext {
        let ctx = NodeContext {
            peer_id: self.peer_id,
            chain: self.chain,
            tokens: self.tokens,
            quorums: self.quorums,
            transport: self.transport,
            network: self.network,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(DidRegistry::new())),
            directory: self.directory,
            providers: ProviderRegistry::new(),
            credits: CreditStore::new(),
            config: self.config,
            local_dids: DashMap::new(),
        };
        for did in self.dids {
            ctx.host_did(did);
        }
        ctx
    }
}
