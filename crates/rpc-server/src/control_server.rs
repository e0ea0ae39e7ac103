//! Local control HTTP Server
//!
//! Operations a node's own operator runs against its hosted DIDs: starting a
//! transfer and validating a stored chain. Served on a loopback address only
//! and never exposed to peers.

use crate::paths;
use axum::{extract::State, routing::post, Json, Router};
use quorum_consensus::{
    LedgerNode, TransferReply, TransferRequest, ValidateRequest, ValidationReport,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Loopback-only HTTP server for the node operator
pub struct ControlRpcServer {
    node: Arc<LedgerNode>,
}

impl ControlRpcServer {
    pub fn new(node: Arc<LedgerNode>) -> Self {
        Self { node }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(paths::TRANSFER, post(handle_transfer))
            .route(paths::VALIDATE, post(handle_validate))
            .with_state(self.node)
    }

    /// Serve on an already bound loopback listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        if !addr.ip().is_loopback() {
            anyhow::bail!("control API must listen on a loopback address, not {addr}");
        }
        tracing::info!("Control server listening on {}", addr);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn handle_transfer(
    State(node): State<Arc<LedgerNode>>,
    Json(req): Json<TransferRequest>,
) -> Json<TransferReply> {
    tracing::info!(
        "Transfer requested: {} -> {} ({} token(s))",
        req.sender_did,
        req.receiver_did,
        req.tokens.len()
    );
    Json(node.transfer(&req).await)
}

async fn handle_validate(
    State(node): State<Arc<LedgerNode>>,
    Json(req): Json<ValidateRequest>,
) -> Json<ValidationReport> {
    Json(node.validate(&req).await)
}
