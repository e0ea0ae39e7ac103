//! Token chain validation
//!
//! Replays a token's chain from genesis, checking hash, linkage and the
//! signatures each transaction type requires, then asks the transport who
//! pins the token and the state it was spent from. A token that fails and is
//! held free on this node is locked until someone looks at it.

use crate::context::NodeContext;
use crate::contract::{
    quorum_signing_hash, token_state_data, transaction_id_of, verify_hex_signature,
};
use crate::error::ConsensusError;
use crate::types::{ProviderCheckRequest, ProviderRole};
use crate::MIN_CONSENSUS_REQUIRED;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::timeout;
use token_chain::{Block, BlockError, TokenKind, TokenStatus, TransactionType};

/// Why a chain was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailure {
    ChainNotFound,
    HashMismatch,
    PredecessorMismatch,
    SequenceGap,
    SignatureInvalid,
    QuorumSignatureInvalid,
    ParentNotBurnt,
    /// Someone besides the owner pins the token
    MultipleOwners,
    /// The spent state is pinned for another transaction
    StateExhausted,
    Malformed,
}

/// Outcome of validating one token chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: bool,
    pub message: String,
    /// Blocks that passed before the walk stopped
    pub validated_blocks: usize,
    #[serde(default)]
    pub failure: Option<ValidationFailure>,
    /// Number of the block that failed
    #[serde(default)]
    pub failed_block: Option<u64>,
}

impl ValidationReport {
    fn passed(token: &str, validated_blocks: usize) -> Self {
        Self {
            status: true,
            message: format!("token {token} validated ({validated_blocks} block(s))"),
            validated_blocks,
            failure: None,
            failed_block: None,
        }
    }

    fn rejected(rejection: Rejection, validated_blocks: usize) -> Self {
        Self {
            status: false,
            message: rejection.message,
            validated_blocks,
            failure: Some(rejection.failure),
            failed_block: rejection.block,
        }
    }
}

#[derive(Debug)]
struct Rejection {
    failure: ValidationFailure,
    block: Option<u64>,
    message: String,
}

impl Rejection {
    fn new(failure: ValidationFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            block: None,
            message: message.into(),
        }
    }

    fn at(mut self, block: Option<u64>) -> Self {
        self.block = block;
        self
    }
}

impl From<BlockError> for Rejection {
    fn from(e: BlockError) -> Self {
        let failure = match &e {
            BlockError::HashMismatch { .. } => ValidationFailure::HashMismatch,
            BlockError::PredecessorMismatch { .. } => ValidationFailure::PredecessorMismatch,
            BlockError::InvalidSequence { .. } | BlockError::MissingPredecessor(_) => {
                ValidationFailure::SequenceGap
            }
            BlockError::MissingSignature(_)
            | BlockError::InvalidSignature(_)
            | BlockError::Did(_) => ValidationFailure::SignatureInvalid,
            BlockError::UnknownToken(_) | BlockError::Serialization(_) => {
                ValidationFailure::Malformed
            }
        };
        Rejection::new(failure, e.to_string())
    }
}

#[derive(Clone)]
pub struct ChainValidator {
    ctx: Arc<NodeContext>,
}

impl ChainValidator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Validate a locally stored token chain
    ///
    /// `block_limit` caps the replay, 0 replays everything.
    pub async fn validate(
        &self,
        did: &str,
        token: &str,
        kind: TokenKind,
        block_limit: usize,
    ) -> ValidationReport {
        let blocks = match self.ctx.chain.blocks(kind, token) {
            Ok(blocks) if !blocks.is_empty() => blocks,
            Ok(_) => {
                return ValidationReport::rejected(
                    Rejection::new(
                        ValidationFailure::ChainNotFound,
                        format!("no chain for token {token}"),
                    ),
                    0,
                )
            }
            Err(e) => {
                return ValidationReport::rejected(
                    Rejection::new(ValidationFailure::ChainNotFound, e.to_string()),
                    0,
                )
            }
        };

        let report = self.validate_chain(token, &blocks, block_limit).await;
        if report.status {
            tracing::info!("{}", report.message);
        } else {
            tracing::warn!("Token {} failed validation: {}", token, report.message);
            self.quarantine(did, token);
        }
        report
    }

    /// Validate every chain of one kind
    pub async fn validate_all(
        &self,
        did: &str,
        kind: TokenKind,
        block_limit: usize,
    ) -> Result<Vec<(String, ValidationReport)>, ConsensusError> {
        let mut reports = Vec::new();
        for token in self.ctx.chain.all_keys(kind)? {
            let report = self.validate(did, &token, kind, block_limit).await;
            reports.push((token, report));
        }
        Ok(reports)
    }

    /// Replay `blocks` and run the pin checks on the last one
    pub async fn validate_chain(
        &self,
        token: &str,
        blocks: &[Block],
        block_limit: usize,
    ) -> ValidationReport {
        let validated = match self.validate_blocks(token, blocks, block_limit) {
            Ok(n) => n,
            Err((rejection, n)) => return ValidationReport::rejected(rejection, n),
        };
        if let Some(latest) = blocks.last() {
            if let Err(rejection) = self.check_owner_pins(token, latest).await {
                return ValidationReport::rejected(rejection, validated);
            }
            if latest.transaction_type() == TransactionType::Transferred {
                if let Err(rejection) = self.check_state_pins(token, latest).await {
                    return ValidationReport::rejected(rejection, validated);
                }
            }
        }
        ValidationReport::passed(token, validated)
    }

    /// Replay `blocks` without asking the transport
    pub fn replay(&self, token: &str, blocks: &[Block], block_limit: usize) -> ValidationReport {
        match self.validate_blocks(token, blocks, block_limit) {
            Ok(n) => ValidationReport::passed(token, n),
            Err((rejection, n)) => ValidationReport::rejected(rejection, n),
        }
    }

    /// Walk blocks in order, stopping at the first failure
    fn validate_blocks(
        &self,
        token: &str,
        blocks: &[Block],
        block_limit: usize,
    ) -> Result<usize, (Rejection, usize)> {
        let limit = if block_limit == 0 {
            blocks.len()
        } else {
            block_limit.min(blocks.len())
        };
        let mut previous: Option<&Block> = None;
        for (validated, block) in blocks[..limit].iter().enumerate() {
            let number = block.block_number(token).ok();
            self.validate_block(token, previous, block)
                .map_err(|r| (r.at(number), validated))?;
            previous = Some(block);
        }
        Ok(limit)
    }

    fn validate_block(
        &self,
        token: &str,
        previous: Option<&Block>,
        block: &Block,
    ) -> Result<(), Rejection> {
        block.verify_hash()?;
        block.check_successor(previous, token)?;

        match block.transaction_type() {
            TransactionType::Genesis
            | TransactionType::DataGenerated
            | TransactionType::NftGenerated
            | TransactionType::Deployed => {
                self.verify_signer(block, block.owner())?;
                if let Some(parent) = &block.entry(token)?.parent_token {
                    self.check_parent_burnt(parent)?;
                }
            }
            TransactionType::Transferred | TransactionType::Executed => {
                self.validate_transfer(block)?;
            }
            TransactionType::Burnt => {
                self.verify_signer(block, block.owner())?;
            }
            TransactionType::Pledged
            | TransactionType::Unpledged
            | TransactionType::ContractCommitted => {
                let signers: Vec<&str> = block.signers().collect();
                if signers.is_empty() {
                    return Err(Rejection::new(
                        ValidationFailure::SignatureInvalid,
                        "block carries no signature",
                    ));
                }
                if !block.is_signed_by(block.owner()) {
                    return Err(Rejection::new(
                        ValidationFailure::SignatureInvalid,
                        format!("block is not signed by owner {}", block.owner()),
                    ));
                }
                for signer in signers {
                    self.verify_signer(block, signer)?;
                }
            }
        }
        Ok(())
    }

    fn validate_transfer(&self, block: &Block) -> Result<(), Rejection> {
        let initiator = block.initiator_signature().ok_or_else(|| {
            Rejection::new(
                ValidationFailure::SignatureInvalid,
                "transfer block has no initiator signature",
            )
        })?;
        if initiator.did != block.sender() {
            return Err(Rejection::new(
                ValidationFailure::SignatureInvalid,
                format!(
                    "initiator {} is not the sender {}",
                    initiator.did,
                    block.sender()
                ),
            ));
        }
        if block.transaction_id() != transaction_id_of(&initiator.hash) {
            return Err(Rejection::new(
                ValidationFailure::Malformed,
                "transaction ID does not match the authorization hash",
            ));
        }

        let sender = self.resolve(block.sender())?;
        verify_hex_signature(
            sender.as_ref(),
            &initiator.hash,
            &initiator.share_sig,
            &initiator.priv_sig,
        )
        .map_err(|e| Rejection::new(ValidationFailure::SignatureInvalid, e.to_string()))?;

        if !block.is_signed_by(block.sender()) {
            return Err(Rejection::new(
                ValidationFailure::SignatureInvalid,
                format!("block is not signed by sender {}", block.sender()),
            ));
        }
        for signer in block.signers() {
            self.verify_signer(block, signer)?;
        }

        let expected = quorum_signing_hash(&initiator.hash, block.receiver());
        let mut signed = BTreeSet::new();
        for credit in block.quorum_signatures() {
            if credit.hash != expected {
                return Err(Rejection::new(
                    ValidationFailure::QuorumSignatureInvalid,
                    format!("quorum {} signed the wrong hash", credit.did),
                ));
            }
            let verifier = self.ctx.resolve(&credit.did).map_err(|e| {
                Rejection::new(ValidationFailure::QuorumSignatureInvalid, e.to_string())
            })?;
            verify_hex_signature(verifier.as_ref(), &expected, &credit.share_sig, &credit.priv_sig)
                .map_err(|e| {
                    Rejection::new(ValidationFailure::QuorumSignatureInvalid, e.to_string())
                })?;
            signed.insert(credit.did.as_str());
        }
        if signed.len() < MIN_CONSENSUS_REQUIRED {
            return Err(Rejection::new(
                ValidationFailure::QuorumSignatureInvalid,
                format!(
                    "{} distinct quorum signature(s), need {}",
                    signed.len(),
                    MIN_CONSENSUS_REQUIRED
                ),
            ));
        }

        if block.pledge_details().is_empty() {
            return Err(Rejection::new(
                ValidationFailure::Malformed,
                "quorum signed a transfer without pledged collateral",
            ));
        }
        for detail in block.pledge_details() {
            if detail.token.is_empty() || detail.did.is_empty() || detail.token_block_id.is_empty() {
                return Err(Rejection::new(
                    ValidationFailure::Malformed,
                    format!("incomplete pledge detail for token '{}'", detail.token),
                ));
            }
            if !signed.contains(detail.did.as_str()) {
                return Err(Rejection::new(
                    ValidationFailure::QuorumSignatureInvalid,
                    format!(
                        "pledger {} of token {} did not sign the transfer",
                        detail.did, detail.token
                    ),
                ));
            }
        }
        Ok(())
    }

    /// The parent of a part token must end in a burn, up the whole lineage
    fn check_parent_burnt(&self, parent: &str) -> Result<(), Rejection> {
        let mut seen = BTreeSet::new();
        let mut current = parent.to_string();
        loop {
            if !seen.insert(current.clone()) {
                return Err(Rejection::new(
                    ValidationFailure::Malformed,
                    format!("parent lineage of {parent} loops"),
                ));
            }
            let latest = self.latest_any(&current)?.ok_or_else(|| {
                Rejection::new(
                    ValidationFailure::ParentNotBurnt,
                    format!("parent token {current} has no chain here"),
                )
            })?;
            if latest.transaction_type() != TransactionType::Burnt {
                return Err(Rejection::new(
                    ValidationFailure::ParentNotBurnt,
                    format!(
                        "parent token {current} ends in {:?}",
                        latest.transaction_type()
                    ),
                ));
            }
            latest.verify_hash()?;
            self.verify_signer(&latest, latest.owner())?;

            let entry = latest.entry(&current)?;
            match (&entry.kind, &entry.parent_token) {
                (TokenKind::Part, Some(grandparent)) => current = grandparent.clone(),
                _ => return Ok(()),
            }
        }
    }

    fn latest_any(&self, token: &str) -> Result<Option<Block>, Rejection> {
        let chain = &self.ctx.chain;
        let found = chain
            .latest(TokenKind::Whole, token)
            .and_then(|b| match b {
                Some(b) => Ok(Some(b)),
                None => chain.latest(TokenKind::Part, token),
            })
            .map_err(|e| Rejection::new(ValidationFailure::ChainNotFound, e.to_string()))?;
        Ok(found)
    }

    fn resolve(&self, did: &str) -> Result<Arc<dyn token_chain::DidCrypto>, Rejection> {
        self.ctx
            .resolve(did)
            .map_err(|e| Rejection::new(ValidationFailure::SignatureInvalid, e.to_string()))
    }

    fn verify_signer(&self, block: &Block, did: &str) -> Result<(), Rejection> {
        let verifier = self.resolve(did)?;
        block.verify_signature(verifier.as_ref())?;
        Ok(())
    }

    /// Only the owner, and for a fresh transfer the sender, may pin the token
    async fn check_owner_pins(&self, token: &str, latest: &Block) -> Result<(), Rejection> {
        let providers = match self.ctx.transport.find_providers(token).await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::warn!("Provider lookup for {} failed: {}", token, e);
                return Ok(());
            }
        };

        let mut known = BTreeSet::new();
        known.extend(self.ctx.peer_of(latest.owner()));
        if latest.transaction_type() == TransactionType::Transferred {
            known.extend(self.ctx.peer_of(latest.sender()));
        }
        let foreign: Vec<String> = providers
            .into_iter()
            .filter(|p| !known.contains(p))
            .collect();
        if foreign.is_empty() {
            return Ok(());
        }

        let status_timeout = self.ctx.config.status_timeout;
        let checks = foreign.iter().map(|peer| {
            let req = ProviderCheckRequest {
                token: token.to_string(),
            };
            async move {
                let reply = timeout(status_timeout, self.ctx.network.provider_check(peer, &req)).await;
                (peer, reply)
            }
        });

        let mut owners = Vec::new();
        for (peer, reply) in join_all(checks).await {
            match reply {
                Ok(Ok(reply)) if reply.status && reply.role.is_some_and(|r| r != ProviderRole::Owner) => {}
                Ok(Ok(_)) => owners.push(peer.clone()),
                Ok(Err(e)) => {
                    tracing::warn!("Provider check on {} failed: {}", peer, e);
                    owners.push(peer.clone());
                }
                Err(_) => {
                    tracing::warn!("Provider check on {} timed out", peer);
                    owners.push(peer.clone());
                }
            }
        }
        if owners.is_empty() {
            return Ok(());
        }
        Err(Rejection::new(
            ValidationFailure::MultipleOwners,
            format!("token {token} is also held by {}", owners.join(", ")),
        )
        .at(latest.block_number(token).ok()))
    }

    /// The state a transfer spent may only be pinned for that transfer
    ///
    /// Signers are asked too: a quorum member that signed an earlier spend of
    /// the same state answers with that transaction's ID.
    async fn check_state_pins(&self, token: &str, latest: &Block) -> Result<(), Rejection> {
        let spent = latest.previous_block_id(token)?;
        let state_id = self
            .ctx
            .transport
            .content_id(&token_state_data(token, spent));
        let providers = match self.ctx.transport.find_providers(&state_id).await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::warn!("Provider lookup for state of {} failed: {}", token, e);
                return Ok(());
            }
        };

        let status_timeout = self.ctx.config.status_timeout;
        let checks = providers.iter().map(|peer| {
            let req = ProviderCheckRequest {
                token: state_id.clone(),
            };
            async move {
                if *peer == self.ctx.peer_id {
                    return (peer, Ok(Ok(self.ctx.providers.check(&req.token))));
                }
                let reply = timeout(status_timeout, self.ctx.network.provider_check(peer, &req)).await;
                (peer, reply)
            }
        });

        let mut competing = Vec::new();
        for (peer, reply) in join_all(checks).await {
            match reply {
                Ok(Ok(reply))
                    if reply.status
                        && reply.role == Some(ProviderRole::Quorum)
                        && reply.reference == latest.transaction_id() => {}
                Ok(Ok(reply)) if reply.status => competing.push(format!(
                    "{peer} ({:?} for {})",
                    reply.role, reply.reference
                )),
                Ok(Ok(_)) => competing.push(peer.clone()),
                Ok(Err(e)) => {
                    tracing::warn!("State check on {} failed: {}", peer, e);
                    competing.push(peer.clone());
                }
                Err(_) => {
                    tracing::warn!("State check on {} timed out", peer);
                    competing.push(peer.clone());
                }
            }
        }
        if competing.is_empty() {
            return Ok(());
        }
        Err(Rejection::new(
            ValidationFailure::StateExhausted,
            format!(
                "state {spent} of token {token} was also consumed via {}",
                competing.join(", ")
            ),
        )
        .at(latest.block_number(token).ok()))
    }

    /// Lock a free token this node holds for `did`
    fn quarantine(&self, did: &str, token: &str) {
        let held = self
            .ctx
            .tokens
            .get(token)
            .is_some_and(|r| r.owner_did == did && r.status == TokenStatus::Free);
        if !held {
            return;
        }
        match self
            .ctx
            .tokens
            .transition(token, &[TokenStatus::Free], TokenStatus::Locked)
        {
            Ok(_) => tracing::error!(
                "Token {} locked after failed validation, needs manual recovery",
                token
            ),
            Err(e) => tracing::warn!("Failed to lock token {}: {}", token, e),
        }
    }
}
