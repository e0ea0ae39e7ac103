//! Transfer orchestration
//!
//! One transfer runs as a session: the sender's tokens are leased, the quorum
//! is selected from the transaction ID, and one task per quorum member
//! negotiates the pledge and collects that member's signature. Results come
//! back over an mpsc channel. Once enough members signed, the transfer block
//! is built, pledgers are told, the receiver gets the tokens and the local
//! chain is committed.

use crate::context::NodeContext;
use crate::contract::{quorum_signing_hash, transaction_id_of, verify_hex_signature, TokenInfo, TransferContract};
use crate::error::{ConsensusError, PledgeError};
use crate::pledge::{pledge_tokens_required, PledgeCoordinator};
use crate::session::{ConsensusSession, ConsensusSessionStore};
use crate::types::{
    ConsensusMode, ConsensusRequest, CreditRequest, PledgeSummary, ProviderRole,
    SendTokenRequest, TransactionDetails, TransferRequest,
};
use crate::{MIN_CONSENSUS_REQUIRED, MIN_QUORUM_REQUIRED};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use token_chain::{
    ChainError, CreditSignature, DidCrypto, TokenError, TokenKind, TokenLease, TokenStatus,
    TransactionType,
};
use uuid::Uuid;

/// A settled transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub details: TransactionDetails,
    pub quorum_list: Vec<String>,
    pub pledge: PledgeSummary,
}

enum PeerOutcome {
    Signed,
    PledgeFailed(PledgeError),
    Rejected(String),
}

pub struct ConsensusCoordinator {
    ctx: Arc<NodeContext>,
    sessions: ConsensusSessionStore,
    pledge: PledgeCoordinator,
    /// Transaction ID -> transfer block hash, filled on settle and from the chain
    settled: DashMap<String, String>,
}

impl ConsensusCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let pledge = PledgeCoordinator::new(ctx.network.clone(), ctx.config.clone());
        Self {
            ctx,
            sessions: ConsensusSessionStore::new(),
            pledge,
            settled: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &ConsensusSessionStore {
        &self.sessions
    }

    pub fn is_settled(&self, transaction_id: &str) -> bool {
        self.settled.contains_key(transaction_id)
    }

    /// Whether a token of the contract already moved in `transaction_id`
    ///
    /// The chain outlives the in-memory map, so a restarted node still
    /// refuses to replay a settled contract.
    fn settled_on_chain(
        &self,
        contract: &TransferContract,
        transaction_id: &str,
    ) -> Result<bool, ConsensusError> {
        for info in contract.tokens() {
            let Some(latest) = self.ctx.chain.latest(info.kind, &info.token)? else {
                continue;
            };
            if latest.transaction_type() == TransactionType::Transferred
                && latest.transaction_id() == transaction_id
            {
                self.settled
                    .insert(transaction_id.to_string(), latest.hash().to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Transfer tokens held by a hosted DID
    pub async fn transfer(&self, req: &TransferRequest) -> Result<ConsensusOutcome, ConsensusError> {
        let signer = self.ctx.local_did(&req.sender_did).ok_or_else(|| {
            ConsensusError::Configuration(format!("sender {} is not hosted here", req.sender_did))
        })?;
        if req.tokens.is_empty() {
            return Err(ConsensusError::Configuration(
                "transfer names no tokens".to_string(),
            ));
        }

        let mut contract = TransferContract::new(&req.sender_did, &req.receiver_did, &req.comment);
        for token in &req.tokens {
            let record = self
                .ctx
                .tokens
                .get(token)
                .ok_or_else(|| TokenError::NotFound(token.clone()))?;
            if record.owner_did != req.sender_did {
                return Err(TokenError::NotOwner {
                    token: token.clone(),
                    did: req.sender_did.clone(),
                }
                .into());
            }
            if !matches!(record.kind, TokenKind::Whole | TokenKind::Part) {
                return Err(ConsensusError::Configuration(format!(
                    "{:?} token {} cannot be transferred",
                    record.kind, token
                )));
            }
            let latest = self
                .ctx
                .chain
                .latest(record.kind, token)?
                .ok_or_else(|| ChainError::ChainNotFound(token.clone()))?;
            contract.add_token(TokenInfo {
                token: token.clone(),
                kind: record.kind,
                value: record.value,
                owner_did: record.owner_did.clone(),
                block_id: latest.block_id(token)?,
            });
        }
        contract.sign(signer.as_ref())?;

        let receiver_peer_id = if req.receiver_peer_id.is_empty() {
            self.ctx.peer_of(&req.receiver_did).unwrap_or_default()
        } else {
            req.receiver_peer_id.clone()
        };
        let request = ConsensusRequest {
            req_id: Uuid::new_v4().to_string(),
            mode: ConsensusMode::TokenTransfer,
            sender_peer_id: self.ctx.peer_id.clone(),
            receiver_peer_id,
            contract,
            quorum_type: req.quorum_type,
            quorum_list: Vec::new(),
            transaction_id: String::new(),
        };
        self.initiate_consensus(request, signer).await
    }

    /// Run consensus for a prepared request
    pub async fn initiate_consensus(
        &self,
        mut request: ConsensusRequest,
        signer: Arc<dyn DidCrypto>,
    ) -> Result<ConsensusOutcome, ConsensusError> {
        if signer.did() != request.contract.sender_did {
            return Err(ConsensusError::Configuration(format!(
                "signer {} is not the sender {}",
                signer.did(),
                request.contract.sender_did
            )));
        }
        if request.contract.sender_signature.is_none() {
            request.contract.sign(signer.as_ref())?;
        }
        let transaction_id = transaction_id_of(&request.contract.authorization_hash());
        if self.is_settled(&transaction_id)
            || self.settled_on_chain(&request.contract, &transaction_id)?
        {
            return Err(ConsensusError::AlreadySettled(transaction_id));
        }
        request.transaction_id = transaction_id.clone();

        let lease = self
            .ctx
            .tokens
            .lock(&request.contract.sender_did, &request.contract.token_ids())?;

        let tiebreak = transaction_id.chars().last().unwrap_or('0');
        let quorum = self
            .ctx
            .quorums
            .select_quorum(request.quorum_type, tiebreak)?;
        if quorum.len() < MIN_QUORUM_REQUIRED {
            return Err(ConsensusError::Configuration(format!(
                "{} quorum peer(s) configured, need {}",
                quorum.len(),
                MIN_QUORUM_REQUIRED
            )));
        }
        request.quorum_list = quorum.clone();

        let required = pledge_tokens_required(request.contract.total_value());
        let session = self.sessions.create(&request.req_id, required)?;
        tracing::info!(
            "Consensus {} started for transaction {}: {} quorum peer(s), {} pledge token(s)",
            request.req_id,
            transaction_id,
            quorum.len(),
            required
        );

        let result = match self.collect_signatures(&session, &request, &quorum).await {
            Ok(()) => {
                self.settle(&session, &request, &quorum, signer.as_ref(), lease)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!("Consensus {} failed: {}", request.req_id, e);
            self.pledge.release(&session).await;
        }
        self.sessions.delete(&request.req_id);
        result
    }

    /// Dispatch one task per quorum member and wait for the threshold
    async fn collect_signatures(
        &self,
        session: &Arc<ConsensusSession>,
        request: &ConsensusRequest,
        quorum: &[String],
    ) -> Result<(), ConsensusError> {
        let (tx, mut rx) = mpsc::channel(quorum.len().max(1));
        let shared = Arc::new(request.clone());
        for did in quorum {
            session.start_peer();
            let task = PeerTask {
                ctx: self.ctx.clone(),
                pledge: self.pledge.clone(),
                session: session.clone(),
                request: shared.clone(),
                did: did.clone(),
                dispatched: quorum.len(),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = task.run().await;
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut pledge_failure = None;
        let mut last_refusal = None;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                PeerOutcome::Signed => {}
                PeerOutcome::PledgeFailed(e) => {
                    pledge_failure.get_or_insert(e);
                }
                PeerOutcome::Rejected(message) => last_refusal = Some(message),
            }
            let counters = session.counters();
            if counters.running == 0
                || (counters.success >= MIN_CONSENSUS_REQUIRED
                    && unsigned_pledgers(session).await.is_empty())
            {
                break;
            }
        }

        let counters = session.counters();
        if counters.success >= MIN_CONSENSUS_REQUIRED {
            let unsigned = unsigned_pledgers(session).await;
            if !unsigned.is_empty() {
                return Err(ConsensusError::Failed(format!(
                    "pledging quorum {} did not sign",
                    unsigned.join(", ")
                )));
            }
            tracing::info!(
                "Consensus {} reached with {} signature(s)",
                request.req_id,
                counters.success
            );
            return Ok(());
        }
        if let Some(e) = pledge_failure {
            return Err(e.into());
        }
        Err(ConsensusError::Failed(format!(
            "{} of {} quorum peer(s) signed, need {}{}",
            counters.success,
            quorum.len(),
            MIN_CONSENSUS_REQUIRED,
            last_refusal
                .map(|m| format!(" (last refusal: {m})"))
                .unwrap_or_default()
        )))
    }

    async fn settle(
        &self,
        session: &ConsensusSession,
        request: &ConsensusRequest,
        quorum: &[String],
        signer: &dyn DidCrypto,
        lease: TokenLease,
    ) -> Result<ConsensusOutcome, ConsensusError> {
        let credits = session.credits();
        let block = self
            .pledge
            .build_transfer_block(session, request, &self.ctx.chain, credits.clone(), signer)
            .await?;
        self.pledge.notify_pledgers(session, &block).await?;

        let credit_req = CreditRequest { credits };
        let deliveries = session.signers().into_iter().map(|did| {
            let req = &credit_req;
            async move {
                let result = self.ctx.network.send_credit(&did, req).await;
                (did, result)
            }
        });
        for (did, result) in join_all(deliveries).await {
            match result {
                Ok(reply) if reply.status => {}
                Ok(reply) => tracing::warn!("Quorum {} refused credit: {}", did, reply.message),
                Err(e) => tracing::warn!("Credit delivery to {} failed: {}", did, e),
            }
        }

        let contract = &request.contract;
        let send = SendTokenRequest {
            sender_peer_id: self.ctx.peer_id.clone(),
            whole_tokens: contract.whole_tokens.clone(),
            part_tokens: contract.part_tokens.clone(),
            token_chain_block: block.clone(),
            quorum_list: quorum.to_vec(),
        };
        let reply = timeout(
            self.ctx.config.consensus_timeout,
            self.ctx.network.send_token(&contract.receiver_did, &send),
        )
        .await
        .map_err(|_| {
            ConsensusError::Timeout(format!("receiver {} did not answer", contract.receiver_did))
        })??;
        if !reply.status {
            return Err(ConsensusError::Failed(format!(
                "receiver {} rejected the tokens: {}",
                contract.receiver_did, reply.message
            )));
        }

        self.ctx.chain.append(&block)?;
        lease.commit(TokenStatus::Transferred)?;
        for token in contract.token_ids() {
            if let Err(e) = self.ctx.transport.unpin(&token).await {
                tracing::warn!("Failed to unpin {}: {}", token, e);
            }
            self.ctx
                .providers
                .set(&token, &contract.sender_did, ProviderRole::PrevSender);
        }
        self.settled
            .insert(request.transaction_id.clone(), block.hash().to_string());

        let details = TransactionDetails {
            transaction_id: request.transaction_id.clone(),
            sender_did: contract.sender_did.clone(),
            receiver_did: contract.receiver_did.clone(),
            amount: contract.total_value(),
            comment: contract.comment.clone(),
            block_hash: block.hash().to_string(),
            tokens: contract.token_ids(),
            epoch: chrono::Utc::now().timestamp(),
        };
        tracing::info!(
            "Transaction {} settled: {} sent {} to {}",
            details.transaction_id,
            details.sender_did,
            details.amount,
            details.receiver_did
        );
        let pledge = session.pledge.lock().await.summary();
        Ok(ConsensusOutcome {
            details,
            quorum_list: quorum.to_vec(),
            pledge,
        })
    }
}

/// Pledging members whose signature is still missing
///
/// The transfer block may only name pledgers that also signed it.
async fn unsigned_pledgers(session: &ConsensusSession) -> Vec<String> {
    let signers = session.signers();
    session
        .pledge
        .lock()
        .await
        .pledged_by_quorum
        .keys()
        .filter(|did| !signers.contains(did))
        .cloned()
        .collect()
}

/// Work done for one quorum member
struct PeerTask {
    ctx: Arc<NodeContext>,
    pledge: PledgeCoordinator,
    session: Arc<ConsensusSession>,
    request: Arc<ConsensusRequest>,
    did: String,
    dispatched: usize,
}

impl PeerTask {
    async fn run(self) -> PeerOutcome {
        match self.sign().await {
            Ok(credit) => {
                self.session.finish_peer(&self.did, Some(credit));
                PeerOutcome::Signed
            }
            Err(e) => {
                self.session.finish_peer(&self.did, None);
                tracing::warn!("Quorum {} did not sign {}: {}", self.did, self.session.req_id(), e);
                match e {
                    ConsensusError::Pledge(e) => PeerOutcome::PledgeFailed(e),
                    other => PeerOutcome::Rejected(other.to_string()),
                }
            }
        }
    }

    async fn sign(&self) -> Result<CreditSignature, ConsensusError> {
        // a failed request is absorbed, completion decides
        let _ = self.pledge.request_pledge(&self.session, &self.did).await;
        self.pledge
            .await_completion(&self.session, self.dispatched)
            .await?;

        let reply = timeout(
            self.ctx.config.consensus_timeout,
            self.ctx.network.consensus(&self.did, &self.request),
        )
        .await
        .map_err(|_| ConsensusError::Timeout(format!("consensus call to {}", self.did)))??;
        if !reply.status {
            return Err(ConsensusError::Failed(format!(
                "{} refused: {}",
                self.did, reply.message
            )));
        }

        let contract = &self.request.contract;
        let expected = quorum_signing_hash(&contract.authorization_hash(), &contract.receiver_did);
        if reply.hash != expected {
            return Err(ConsensusError::Signature(format!(
                "{} signed an unexpected hash",
                self.did
            )));
        }
        let verifier = self.ctx.resolve(&self.did)?;
        verify_hex_signature(verifier.as_ref(), &expected, &reply.share_sig, &reply.priv_sig)?;

        Ok(CreditSignature {
            did: self.did.clone(),
            share_sig: reply.share_sig,
            priv_sig: reply.priv_sig,
            hash: expected,
            sign_type: verifier.scheme(),
        })
    }
}
