//! HTTP client side of the peer API
//!
//! Resolves a DID (or, for provider checks, a peer ID) to a base URL through
//! the shared [`PeerDirectory`] and posts JSON to the matching route.

use crate::paths;
use async_trait::async_trait;
use quorum_consensus::{
    BasicResponse, ChainSyncReply, ChainSyncRequest, ConsensusReply, ConsensusRequest,
    CreditRequest, PeerDirectory, PeerError, PeerNetwork, PeerStatusReply, PledgeReply,
    PledgeRequest, ProviderCheckReply, ProviderCheckRequest, SendTokenRequest,
    UnlockTokensRequest, UpdatePledgeRequest,
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// [`PeerNetwork`] over HTTP
#[derive(Clone)]
pub struct HttpPeerNetwork {
    client: Client,
    directory: PeerDirectory,
}

impl HttpPeerNetwork {
    /// Client with a per-request timeout
    pub fn new(directory: PeerDirectory, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, directory })
    }

    fn base_url(&self, did: &str) -> Result<String, PeerError> {
        match self.directory.get(did) {
            Some(endpoint) if !endpoint.url.is_empty() => {
                Ok(endpoint.url.trim_end_matches('/').to_string())
            }
            _ => Err(PeerError::UnknownPeer(did.to_string())),
        }
    }

    async fn get<Rep>(&self, did: &str, path: &str) -> Result<Rep, PeerError>
    where
        Rep: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url(did)?, path);
        let resp = self
            .client
            .get(&url)
            .query(&[("did", did)])
            .send()
            .await
            .map_err(|e| map_error(did, e))?;
        decode(did, resp).await
    }

    async fn post<Req, Rep>(&self, did: &str, path: &str, req: &Req) -> Result<Rep, PeerError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url(did)?, path);
        self.post_url(did, &url, req).await
    }

    async fn post_url<Req, Rep>(&self, did: &str, url: &str, req: &Req) -> Result<Rep, PeerError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let resp = self
            .client
            .post(url)
            .query(&[("did", did)])
            .json(req)
            .send()
            .await
            .map_err(|e| map_error(did, e))?;
        decode(did, resp).await
    }
}

async fn decode<Rep: DeserializeOwned>(did: &str, resp: reqwest::Response) -> Result<Rep, PeerError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PeerError::Unreachable {
            did: did.to_string(),
            reason: format!("HTTP {status}: {body}"),
        });
    }
    resp.json::<Rep>().await.map_err(|e| PeerError::Decode {
        did: did.to_string(),
        reason: e.to_string(),
    })
}

fn map_error(did: &str, e: reqwest::Error) -> PeerError {
    if e.is_timeout() {
        PeerError::Timeout(did.to_string())
    } else if e.is_decode() {
        PeerError::Decode {
            did: did.to_string(),
            reason: e.to_string(),
        }
    } else {
        PeerError::Unreachable {
            did: did.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PeerNetwork for HttpPeerNetwork {
    async fn ping(&self, did: &str) -> Result<BasicResponse, PeerError> {
        self.get(did, paths::PING).await
    }

    async fn peer_status(&self, did: &str) -> Result<PeerStatusReply, PeerError> {
        self.get(did, paths::PEER_STATUS).await
    }

    async fn consensus(
        &self,
        did: &str,
        req: &ConsensusRequest,
    ) -> Result<ConsensusReply, PeerError> {
        self.post(did, paths::CONSENSUS, req).await
    }

    async fn request_pledge(
        &self,
        did: &str,
        req: &PledgeRequest,
    ) -> Result<PledgeReply, PeerError> {
        self.post(did, paths::PLEDGE_REQUEST, req).await
    }

    async fn update_pledge(
        &self,
        did: &str,
        req: &UpdatePledgeRequest,
    ) -> Result<BasicResponse, PeerError> {
        self.post(did, paths::PLEDGE_UPDATE, req).await
    }

    async fn unlock_tokens(
        &self,
        did: &str,
        req: &UnlockTokensRequest,
    ) -> Result<BasicResponse, PeerError> {
        self.post(did, paths::PLEDGE_UNLOCK, req).await
    }

    async fn send_credit(
        &self,
        did: &str,
        req: &CreditRequest,
    ) -> Result<BasicResponse, PeerError> {
        self.post(did, paths::CREDIT, req).await
    }

    async fn send_token(
        &self,
        did: &str,
        req: &SendTokenRequest,
    ) -> Result<BasicResponse, PeerError> {
        self.post(did, paths::TOKEN_RECEIVE, req).await
    }

    async fn sync_chain(
        &self,
        did: &str,
        req: &ChainSyncRequest,
    ) -> Result<ChainSyncReply, PeerError> {
        self.post(did, paths::CHAIN_SYNC, req).await
    }

    async fn provider_check(
        &self,
        peer_id: &str,
        req: &ProviderCheckRequest,
    ) -> Result<ProviderCheckReply, PeerError> {
        let endpoint = self
            .directory
            .by_peer_id(peer_id)
            .filter(|e| !e.url.is_empty())
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;
        let url = format!(
            "{}{}",
            endpoint.url.trim_end_matches('/'),
            paths::PROVIDER_CHECK
        );
        self.post_url(&endpoint.did, &url, req).await
    }
}
