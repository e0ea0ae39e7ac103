//! Pledge negotiation
//!
//! Quorum members back a transfer with their own free whole tokens. For one
//! request the coordinator asks peers in turn for the outstanding amount,
//! waits until nothing is outstanding, then builds the transfer block that
//! references every pledged token and tells each pledging member about it.

use crate::context::ConsensusConfig;
use crate::error::{ConsensusError, PeerError, PledgeError};
use crate::network::PeerNetwork;
use crate::session::ConsensusSession;
use crate::types::{
    ConsensusRequest, PledgeReply, PledgeRequest, PledgeSummary, UnlockTokensRequest,
    UpdatePledgeRequest,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use token_chain::{
    Block, BlockContent, ChainStore, CreditSignature, DidCrypto, PledgeDetail, TokenEntry,
    TokenKind, TransactionType,
};

/// Pledge tokens needed to back a transfer of `total_value`
pub fn pledge_tokens_required(total_value: f64) -> usize {
    ((total_value / 2.0).ceil() as usize).max(1)
}

/// Pledge progress of one request
#[derive(Debug, Clone, Default)]
pub struct PledgeState {
    pub required: usize,
    pub remaining: usize,
    /// Quorum DID -> pledged tokens
    pub pledged_by_quorum: BTreeMap<String, Vec<String>>,
    /// Latest block of each pledged token as handed out
    pub proof_by_token: BTreeMap<String, Block>,
    /// Block ID of each proof
    pub previous_block_by_token: BTreeMap<String, String>,
    pub flat_tokens: Vec<String>,
    /// Peers asked so far
    pub attempted: usize,
}

impl PledgeState {
    pub fn new(required: usize) -> Self {
        Self {
            required,
            remaining: required,
            ..Default::default()
        }
    }

    /// Merge a pledge reply from `did`, returning how many tokens were taken
    pub fn accumulate(&mut self, did: &str, reply: &PledgeReply) -> usize {
        let mut accepted = 0;
        for (token, proof) in reply.tokens.iter().zip(reply.token_chain_block.iter()) {
            if self.remaining == 0 {
                break;
            }
            if self.proof_by_token.contains_key(token) {
                continue;
            }
            let block_id = match check_proof(did, token, proof) {
                Ok(id) => id,
                Err(reason) => {
                    tracing::warn!("Skipping pledge token {} from {}: {}", token, did, reason);
                    continue;
                }
            };
            self.pledged_by_quorum
                .entry(did.to_string())
                .or_default()
                .push(token.clone());
            self.previous_block_by_token
                .insert(token.clone(), block_id);
            self.proof_by_token.insert(token.clone(), proof.clone());
            self.flat_tokens.push(token.clone());
            self.remaining -= 1;
            accepted += 1;
        }
        accepted
    }

    pub fn pledge_details(&self) -> Vec<PledgeDetail> {
        self.pledged_by_quorum
            .iter()
            .flat_map(|(did, tokens)| {
                tokens.iter().map(move |token| PledgeDetail {
                    token: token.clone(),
                    did: did.clone(),
                    token_block_id: self
                        .previous_block_by_token
                        .get(token)
                        .cloned()
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    pub fn summary(&self) -> PledgeSummary {
        PledgeSummary {
            required: self.required,
            pledged_tokens: self.pledged_by_quorum.clone(),
        }
    }
}

/// Check a pledge proof block, returning the token's block ID
fn check_proof(did: &str, token: &str, proof: &Block) -> Result<String, String> {
    proof.verify_hash().map_err(|e| e.to_string())?;
    let entry = proof.entry(token).map_err(|e| e.to_string())?;
    if entry.kind != TokenKind::Whole {
        return Err("only whole tokens can be pledged".to_string());
    }
    if proof.transaction_type() == TransactionType::Pledged {
        return Err("token is already pledged".to_string());
    }
    if proof.owner() != did {
        return Err(format!("token is owned by {}", proof.owner()));
    }
    proof.block_id(token).map_err(|e| e.to_string())
}

/// Drives the pledge state machine for consensus sessions
#[derive(Clone)]
pub struct PledgeCoordinator {
    network: Arc<dyn PeerNetwork>,
    config: ConsensusConfig,
}

impl PledgeCoordinator {
    pub fn new(network: Arc<dyn PeerNetwork>, config: ConsensusConfig) -> Self {
        Self { network, config }
    }

    /// Ask one quorum member for the outstanding pledge
    ///
    /// Serialized per session by the pledge lock. A failed request only counts
    /// as an attempt; the caller decides whether that is fatal.
    pub async fn request_pledge(
        &self,
        session: &ConsensusSession,
        did: &str,
    ) -> Result<usize, PledgeError> {
        let mut state = session.pledge.lock().await;
        let result = self.request_locked(&mut state, did).await;
        state.attempted += 1;
        match &result {
            Ok(0) => {}
            Ok(n) => tracing::info!(
                "Quorum {} pledged {} token(s) for {}, {} outstanding",
                did,
                n,
                session.req_id(),
                state.remaining
            ),
            Err(e) => tracing::warn!("Pledge request to {} failed: {}", did, e),
        }
        result
    }

    async fn request_locked(&self, state: &mut PledgeState, did: &str) -> Result<usize, PledgeError> {
        if state.remaining == 0 {
            return Ok(0);
        }
        let req = PledgeRequest {
            num_tokens: state.remaining,
        };
        let reply = timeout(
            self.config.pledge_rpc_timeout,
            self.network.request_pledge(did, &req),
        )
        .await
        .map_err(|_| PeerError::Timeout(did.to_string()))??;
        if !reply.status {
            return Err(PledgeError::Rejected {
                did: did.to_string(),
                message: reply.message,
            });
        }

        let accepted = state.accumulate(did, &reply);

        let taken = state.pledged_by_quorum.get(did).cloned().unwrap_or_default();
        let unused: Vec<String> = reply
            .tokens
            .iter()
            .filter(|t| !taken.contains(t))
            .cloned()
            .collect();
        if !unused.is_empty() {
            let req = UnlockTokensRequest { tokens: unused };
            if let Err(e) = self.network.unlock_tokens(did, &req).await {
                tracing::warn!("Failed to hand back unused pledge tokens to {}: {}", did, e);
            }
        }
        Ok(accepted)
    }

    /// Wait until nothing is outstanding
    ///
    /// Fails once `dispatched` peers have all been asked and tokens are still
    /// missing, or when the pledge timeout runs out.
    pub async fn await_completion(
        &self,
        session: &ConsensusSession,
        dispatched: usize,
    ) -> Result<(), PledgeError> {
        let started = Instant::now();
        loop {
            {
                let state = session.pledge.lock().await;
                if state.remaining == 0 {
                    return Ok(());
                }
                if state.attempted >= dispatched {
                    return Err(PledgeError::Insufficient {
                        remaining: state.remaining,
                    });
                }
                if started.elapsed() >= self.config.pledge_timeout {
                    return Err(PledgeError::Timeout {
                        waited_secs: started.elapsed().as_secs(),
                        remaining: state.remaining,
                    });
                }
            }
            sleep(self.config.pledge_poll_interval).await;
        }
    }

    /// Build and sign the transfer block once the pledge is complete
    pub async fn build_transfer_block(
        &self,
        session: &ConsensusSession,
        request: &ConsensusRequest,
        chain: &ChainStore,
        credits: Vec<CreditSignature>,
        signer: &dyn DidCrypto,
    ) -> Result<Block, ConsensusError> {
        let state = session.pledge.lock().await;
        if state.remaining > 0 {
            return Err(PledgeError::Incomplete {
                remaining: state.remaining,
            }
            .into());
        }

        let contract = &request.contract;
        let mut content = BlockContent::new(TransactionType::Transferred, &contract.receiver_did);
        content.sender = contract.sender_did.clone();
        content.receiver = contract.receiver_did.clone();
        content.transaction_id = request.transaction_id.clone();
        content.comment = contract.comment.clone();
        content.pledge_details = state.pledge_details();
        content.quorum_signatures = credits;
        content.initiator_signature = contract.sender_signature.clone();

        let mut previous = BTreeMap::new();
        for info in contract.tokens() {
            let latest = chain.latest(info.kind, &info.token)?;
            let head = match &latest {
                Some(block) => Some(block.block_id(&info.token)?),
                None => None,
            };
            if head.as_deref() != Some(info.block_id.as_str()) {
                return Err(ConsensusError::Failed(format!(
                    "chain head of token {} moved since the contract was signed",
                    info.token
                )));
            }
            let mut entry = TokenEntry::new(info.kind, info.value);
            if let Some(block) = &latest {
                entry.parent_token = block.entry(&info.token)?.parent_token.clone();
            }
            content.tokens.insert(info.token.clone(), entry);
            previous.insert(info.token.clone(), latest);
        }

        let mut block = Block::create(&previous, content)?;
        block.sign(signer)?;
        Ok(block)
    }

    /// Send the finished transfer block to every pledging member
    ///
    /// Any rejection fails the whole request.
    pub async fn notify_pledgers(
        &self,
        session: &ConsensusSession,
        block: &Block,
    ) -> Result<(), PledgeError> {
        let pledged = session.pledge.lock().await.pledged_by_quorum.clone();
        let calls = pledged.into_iter().map(|(did, tokens)| {
            let req = UpdatePledgeRequest {
                pledged_tokens: tokens,
                token_chain_block: block.clone(),
            };
            async move {
                let reply = timeout(
                    self.config.consensus_timeout,
                    self.network.update_pledge(&did, &req),
                )
                .await
                .map_err(|_| PeerError::Timeout(did.clone()))??;
                if !reply.status {
                    return Err(PledgeError::Rejected {
                        did,
                        message: reply.message,
                    });
                }
                Ok::<(), PledgeError>(())
            }
        });
        for result in join_all(calls).await {
            result?;
        }
        Ok(())
    }

    /// Return pledged tokens to their owners after a failed request
    pub async fn release(&self, session: &ConsensusSession) {
        let pledged = session.pledge.lock().await.pledged_by_quorum.clone();
        for (did, tokens) in pledged {
            let req = UnlockTokensRequest { tokens };
            match self.network.unlock_tokens(&did, &req).await {
                Ok(reply) if reply.status => {}
                Ok(reply) => tracing::warn!("Quorum {} refused to unlock: {}", did, reply.message),
                Err(e) => tracing::warn!("Failed to unlock pledge at {}: {}", did, e),
            }
        }
    }
}
