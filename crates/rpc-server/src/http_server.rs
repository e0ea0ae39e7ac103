//! Peer HTTP Server
//!
//! One JSON route per endpoint other nodes call. Nothing here acts on a
//! hosted DID's own tokens; transfers and validation live on the
//! [`ControlRpcServer`](crate::ControlRpcServer). Requests that act for a hosted DID name
//! it in the `did` query parameter; refusals come back as `status: false`
//! with HTTP 200.

use crate::paths;
use axum::{
    extract::{Query, State},
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use quorum_consensus::{
    BasicResponse, ChainSyncReply, ChainSyncRequest, ConsensusReply, ConsensusRequest,
    CreditRequest, CreditScoreReply, LedgerNode, PeerStatusReply, PledgeReply, PledgeRequest,
    ProviderCheckReply, ProviderCheckRequest, SendTokenRequest, UnlockTokensRequest,
    UpdatePledgeRequest,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Hosted DID a request is addressed to
#[derive(Debug, Clone, Deserialize)]
pub struct DidQuery {
    pub did: String,
}

/// HTTP server in front of one [`LedgerNode`]
pub struct PeerRpcServer {
    node: Arc<LedgerNode>,
}

impl PeerRpcServer {
    pub fn new(node: Arc<LedgerNode>) -> Self {
        Self { node }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route(paths::PING, get(handle_ping))
            .route(paths::PEER_STATUS, get(handle_peer_status))
            .route(paths::CONSENSUS, post(handle_consensus))
            .route(
                paths::CREDIT,
                get(handle_credit_score).post(handle_store_credit),
            )
            .route(paths::PLEDGE_REQUEST, post(handle_request_pledge))
            .route(paths::PLEDGE_UPDATE, post(handle_update_pledge))
            .route(paths::PLEDGE_UNLOCK, post(handle_unlock_tokens))
            .route(paths::TOKEN_RECEIVE, post(handle_receive_tokens))
            .route(paths::CHAIN_SYNC, post(handle_chain_sync))
            .route(paths::PROVIDER_CHECK, post(handle_provider_check))
            .layer(cors)
            .with_state(self.node)
    }

    /// Bind and serve until the process ends
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Peer RPC server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn handle_ping(State(node): State<Arc<LedgerNode>>) -> Json<BasicResponse> {
    Json(node.responder().ping())
}

async fn handle_peer_status(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
) -> Json<PeerStatusReply> {
    Json(node.responder().peer_status(&query.did))
}

async fn handle_consensus(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<ConsensusRequest>,
) -> Json<ConsensusReply> {
    tracing::debug!("Consensus request {} for {}", req.req_id, query.did);
    Json(node.responder().consensus(&query.did, &req).await)
}

async fn handle_credit_score(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
) -> Json<CreditScoreReply> {
    Json(node.responder().credit_score(&query.did))
}

async fn handle_store_credit(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<CreditRequest>,
) -> Json<BasicResponse> {
    Json(node.responder().store_credit(&query.did, &req))
}

async fn handle_request_pledge(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<PledgeRequest>,
) -> Json<PledgeReply> {
    Json(node.responder().request_pledge(&query.did, &req).await)
}

async fn handle_update_pledge(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<UpdatePledgeRequest>,
) -> Json<BasicResponse> {
    Json(node.responder().update_pledge(&query.did, &req).await)
}

async fn handle_unlock_tokens(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<UnlockTokensRequest>,
) -> Json<BasicResponse> {
    Json(node.responder().unlock_tokens(&query.did, &req).await)
}

async fn handle_receive_tokens(
    State(node): State<Arc<LedgerNode>>,
    Query(query): Query<DidQuery>,
    Json(req): Json<SendTokenRequest>,
) -> Json<BasicResponse> {
    Json(node.responder().receive_tokens(&query.did, &req).await)
}

async fn handle_chain_sync(
    State(node): State<Arc<LedgerNode>>,
    Json(req): Json<ChainSyncRequest>,
) -> Json<ChainSyncReply> {
    Json(node.responder().chain_sync(&req))
}

async fn handle_provider_check(
    State(node): State<Arc<LedgerNode>>,
    Json(req): Json<ProviderCheckRequest>,
) -> Json<ProviderCheckReply> {
    Json(node.responder().provider_check(&req))
}
