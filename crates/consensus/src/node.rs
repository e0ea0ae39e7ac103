//! Ledger node facade

use crate::context::NodeContext;
use crate::coordinator::ConsensusCoordinator;
use crate::issuance::TokenIssuer;
use crate::responder::QuorumResponder;
use crate::types::{TransferReply, TransferRequest, ValidateRequest};
use crate::validator::{ChainValidator, ValidationReport};
use std::sync::Arc;

/// Everything one node runs, sharing a single context
pub struct LedgerNode {
    ctx: Arc<NodeContext>,
    coordinator: ConsensusCoordinator,
    responder: QuorumResponder,
    validator: ChainValidator,
    issuer: TokenIssuer,
}

impl LedgerNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            coordinator: ConsensusCoordinator::new(ctx.clone()),
            responder: QuorumResponder::new(ctx.clone()),
            validator: ChainValidator::new(ctx.clone()),
            issuer: TokenIssuer::new(ctx.clone()),
            ctx,
        }
    }

    pub fn ctx(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn coordinator(&self) -> &ConsensusCoordinator {
        &self.coordinator
    }

    pub fn responder(&self) -> &QuorumResponder {
        &self.responder
    }

    pub fn validator(&self) -> &ChainValidator {
        &self.validator
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Run a transfer and report it as a status reply
    pub async fn transfer(&self, req: &TransferRequest) -> TransferReply {
        match self.coordinator.transfer(req).await {
            Ok(outcome) => TransferReply {
                status: true,
                message: format!(
                    "transaction {} settled",
                    outcome.details.transaction_id
                ),
                details: Some(outcome.details),
                quorum_list: outcome.quorum_list,
                pledge: Some(outcome.pledge),
            },
            Err(e) => TransferReply {
                status: false,
                message: e.to_string(),
                details: None,
                quorum_list: Vec::new(),
                pledge: None,
            },
        }
    }

    pub async fn validate(&self, req: &ValidateRequest) -> ValidationReport {
        self.validator
            .validate(&req.did, &req.token, req.token_type, req.block_limit)
            .await
    }
}
