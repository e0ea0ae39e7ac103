//! Inbound peer requests
//!
//! [`QuorumResponder`] answers everything another node can ask of this one:
//! co-signing a transfer as quorum, pledging collateral, receiving tokens and
//! serving chain pages. Every handler turns internal errors into a reply with
//! `status: false`.

use crate::context::NodeContext;
use crate::contract::{quorum_signing_hash, token_state_data, transaction_id_of, TokenInfo};
use crate::error::{ConsensusError, ResponderError};
use crate::sync::fetch_missing_blocks;
use crate::types::{
    BasicResponse, ChainSyncReply, ChainSyncRequest, ConsensusReply, ConsensusRequest,
    CreditRequest, CreditScoreReply, PeerStatusReply, PledgeReply, PledgeRequest,
    ProviderCheckReply, ProviderCheckRequest, ProviderRole, SendTokenRequest,
    UnlockTokensRequest, UpdatePledgeRequest,
};
use crate::validator::ChainValidator;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use token_chain::{
    Block, BlockContent, TokenEntry, TokenError, TokenKind, TokenRecord, TokenStatus,
    TransactionType, DEFAULT_PAGE_SIZE,
};

#[derive(Clone)]
pub struct QuorumResponder {
    ctx: Arc<NodeContext>,
    validator: ChainValidator,
}

impl QuorumResponder {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let validator = ChainValidator::new(ctx.clone());
        Self { ctx, validator }
    }

    pub fn ping(&self) -> BasicResponse {
        BasicResponse::ok("pong")
    }

    pub fn peer_status(&self, did: &str) -> PeerStatusReply {
        PeerStatusReply {
            version: env!("CARGO_PKG_VERSION").to_string(),
            did_exists: self.ctx.hosts(did),
        }
    }

    /// Co-sign a transfer as quorum member `did`
    pub async fn consensus(&self, did: &str, req: &ConsensusRequest) -> ConsensusReply {
        match self.try_consensus(did, req).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Consensus request {} refused by {}: {}", req.req_id, did, e);
                ConsensusReply::failed(&req.req_id, e.to_string())
            }
        }
    }

    async fn try_consensus(
        &self,
        did: &str,
        req: &ConsensusRequest,
    ) -> Result<ConsensusReply, ResponderError> {
        let signer = self
            .ctx
            .local_did(did)
            .ok_or_else(|| ResponderError::QuorumNotConfigured(did.to_string()))?;

        let contract = &req.contract;
        let sender = self
            .ctx
            .resolve(&contract.sender_did)
            .map_err(|e| ResponderError::SenderSignatureInvalid(e.to_string()))?;
        contract
            .verify_sender(sender.as_ref())
            .map_err(|e| ResponderError::SenderSignatureInvalid(e.to_string()))?;
        let auth_hash = contract.authorization_hash();
        let transaction_id = transaction_id_of(&auth_hash);
        if !req.transaction_id.is_empty() && req.transaction_id != transaction_id {
            return Err(ResponderError::SenderSignatureInvalid(
                "transaction ID does not match the contract".to_string(),
            ));
        }

        // ownership is settled by the receiver's validation
        for info in contract.tokens() {
            match self.ctx.transport.find_providers(&info.token).await {
                Ok(providers) if providers.contains(&req.sender_peer_id) => {}
                Ok(providers) => tracing::warn!(
                    "Token {} is pinned by {:?}, not by sender peer {}",
                    info.token,
                    providers,
                    req.sender_peer_id
                ),
                Err(e) => tracing::warn!("Provider lookup for {} failed: {}", info.token, e),
            }
        }

        let mut allowed: BTreeSet<String> = req
            .quorum_list
            .iter()
            .filter_map(|d| self.ctx.peer_of(d))
            .collect();
        allowed.insert(self.ctx.peer_id.clone());

        let mut states = Vec::new();
        for info in contract.tokens() {
            let data = token_state_data(&info.token, &info.block_id);
            let id = self.ctx.transport.content_id(&data);
            let providers = self.ctx.transport.find_providers(&id).await?;
            if let Some(peer) = providers.iter().find(|p| !allowed.contains(*p)) {
                return Err(ConsensusError::DoubleSpendSuspected {
                    token: info.token.clone(),
                    reason: format!("state {} already consumed via {}", info.block_id, peer),
                }
                .into());
            }
            states.push((info.token.clone(), id, data));
        }

        // one transaction per spent state, whichever quorum DID on this node signs
        let mut claimed = Vec::new();
        for (token, id, _) in &states {
            match self
                .ctx
                .providers
                .claim(id, did, ProviderRole::Quorum, &transaction_id)
            {
                Ok(true) => claimed.push(id.clone()),
                Ok(false) => {}
                Err(held) => {
                    self.release_claims(&claimed);
                    return Err(ConsensusError::DoubleSpendSuspected {
                        token: token.clone(),
                        reason: format!(
                            "state already signed by {} for transaction {}",
                            held.did, held.reference
                        ),
                    }
                    .into());
                }
            }
        }

        let hash = quorum_signing_hash(&auth_hash, &contract.receiver_did);
        let (share, private) = match signer.sign(&hash) {
            Ok(sig) => sig,
            Err(e) => {
                self.release_claims(&claimed);
                return Err(e.into());
            }
        };

        for (_, _, data) in &states {
            self.ctx.transport.put(data).await?;
        }

        tracing::info!(
            "Quorum {} signed transaction {} for {} token(s)",
            did,
            transaction_id,
            contract.whole_tokens.len() + contract.part_tokens.len()
        );
        Ok(ConsensusReply {
            req_id: req.req_id.clone(),
            status: true,
            message: "consensus granted".to_string(),
            hash,
            share_sig: hex::encode(share),
            priv_sig: hex::encode(private),
        })
    }

    fn release_claims(&self, ids: &[String]) {
        for id in ids {
            self.ctx.providers.remove(id);
        }
    }

    /// Lock free whole tokens of `did` and hand out their latest blocks
    pub async fn request_pledge(&self, did: &str, req: &PledgeRequest) -> PledgeReply {
        match self.try_request_pledge(did, req) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Pledge request to {} refused: {}", did, e);
                PledgeReply::failed(e.to_string())
            }
        }
    }

    fn try_request_pledge(&self, did: &str, req: &PledgeRequest) -> Result<PledgeReply, ResponderError> {
        if !self.ctx.hosts(did) {
            return Err(ResponderError::QuorumNotConfigured(did.to_string()));
        }
        let locked = self.ctx.tokens.lock_free_whole(did, req.num_tokens)?;
        if locked.is_empty() {
            return Err(ResponderError::NoPledgeTokens);
        }
        let ids: Vec<String> = locked.iter().map(|r| r.token_id.clone()).collect();

        let proofs = ids
            .iter()
            .map(|token| -> Result<(Block, String), ResponderError> {
                let latest = self
                    .ctx
                    .chain
                    .latest(TokenKind::Whole, token)?
                    .ok_or_else(|| {
                        ResponderError::InvalidTokenBlock(format!("token {token} has no chain"))
                    })?;
                let id = latest.block_id(token)?;
                Ok((latest, id))
            })
            .collect::<Result<Vec<_>, _>>();

        match proofs {
            Ok(proofs) => {
                let (blocks, proof_chain): (Vec<Block>, Vec<String>) = proofs.into_iter().unzip();
                tracing::info!("{} locked {} token(s) for pledging", did, ids.len());
                Ok(PledgeReply {
                    status: true,
                    message: format!("{} token(s) pledged", ids.len()),
                    tokens: ids,
                    token_chain_block: blocks,
                    proof_chain,
                })
            }
            Err(e) => {
                self.unlock(did, &ids);
                Err(e)
            }
        }
    }

    /// Record the pledge of our tokens once the transfer block exists
    pub async fn update_pledge(&self, did: &str, req: &UpdatePledgeRequest) -> BasicResponse {
        match self.try_update_pledge(did, req) {
            Ok(count) => BasicResponse::ok(format!("{count} token(s) pledged")),
            Err(e) => {
                tracing::warn!("Pledge update for {} rejected: {}", did, e);
                BasicResponse::failed(e.to_string())
            }
        }
    }

    fn try_update_pledge(&self, did: &str, req: &UpdatePledgeRequest) -> Result<usize, ResponderError> {
        let signer = self
            .ctx
            .local_did(did)
            .ok_or_else(|| ResponderError::QuorumNotConfigured(did.to_string()))?;

        let transfer = &req.token_chain_block;
        transfer
            .verify_hash()
            .map_err(|e| ResponderError::InvalidPledgeBlock(e.to_string()))?;
        if transfer.transaction_type() != TransactionType::Transferred {
            return Err(ResponderError::InvalidPledgeBlock(format!(
                "expected a transfer block, got {:?}",
                transfer.transaction_type()
            )));
        }

        let mut content = BlockContent::new(TransactionType::Pledged, did);
        content.sender = transfer.sender().to_string();
        content.receiver = transfer.receiver().to_string();
        content.transaction_id = transfer.transaction_id().to_string();
        content.reference = transfer.hash().to_string();
        content.comment = format!("pledged at {}", chrono::Utc::now().to_rfc3339());

        let mut previous = BTreeMap::new();
        for token in &req.pledged_tokens {
            let detail = transfer
                .pledge_details()
                .iter()
                .find(|d| &d.token == token && d.did == did)
                .ok_or_else(|| {
                    ResponderError::InvalidPledgeBlock(format!("no pledge detail for {token}"))
                })?;
            let record = self
                .ctx
                .tokens
                .get(token)
                .ok_or_else(|| TokenError::NotFound(token.clone()))?;
            if record.owner_did != did || record.status != TokenStatus::Locked {
                return Err(ResponderError::InvalidPledgeBlock(format!(
                    "token {token} is not locked for {did}"
                )));
            }
            let latest = self
                .ctx
                .chain
                .latest(TokenKind::Whole, token)?
                .ok_or_else(|| {
                    ResponderError::InvalidPledgeBlock(format!("token {token} has no chain"))
                })?;
            let head = latest.block_id(token)?;
            if head != detail.token_block_id {
                return Err(ResponderError::InvalidPledgeBlock(format!(
                    "token {token} head is {head}, pledge references {}",
                    detail.token_block_id
                )));
            }
            content
                .tokens
                .insert(token.clone(), TokenEntry::new(TokenKind::Whole, record.value));
            previous.insert(token.clone(), Some(latest));
        }
        if content.tokens.is_empty() {
            return Err(ResponderError::InvalidPledgeBlock(
                "no tokens to pledge".to_string(),
            ));
        }

        let mut block = Block::create(&previous, content)?;
        block.sign(signer.as_ref())?;
        self.ctx.chain.append(&block)?;

        for token in &req.pledged_tokens {
            self.ctx
                .tokens
                .transition(token, &[TokenStatus::Locked], TokenStatus::Pledged)?;
            self.ctx.providers.set_with_reference(
                token,
                did,
                ProviderRole::Pledging,
                transfer.transaction_id(),
            );
        }
        tracing::info!(
            "{} pledged {} token(s) for transaction {}",
            did,
            req.pledged_tokens.len(),
            transfer.transaction_id()
        );
        Ok(req.pledged_tokens.len())
    }

    /// Return locked pledge tokens of `did` to free
    pub async fn unlock_tokens(&self, did: &str, req: &UnlockTokensRequest) -> BasicResponse {
        if !self.ctx.hosts(did) {
            return BasicResponse::failed(
                ResponderError::QuorumNotConfigured(did.to_string()).to_string(),
            );
        }
        let released = self.unlock(did, &req.tokens);
        BasicResponse::ok(format!("{released} token(s) unlocked"))
    }

    fn unlock(&self, did: &str, tokens: &[String]) -> usize {
        let mut released = 0;
        for token in tokens {
            match self.ctx.tokens.get(token) {
                Some(record) if record.owner_did == did => {
                    match self
                        .ctx
                        .tokens
                        .transition(token, &[TokenStatus::Locked], TokenStatus::Free)
                    {
                        Ok(_) => released += 1,
                        Err(e) => tracing::debug!("Token {} not unlocked: {}", token, e),
                    }
                }
                _ => tracing::warn!("Refusing to unlock {} for {}", token, did),
            }
        }
        released
    }

    pub fn store_credit(&self, did: &str, req: &CreditRequest) -> BasicResponse {
        if !self.ctx.hosts(did) {
            return BasicResponse::failed(ResponderError::UnknownDid(did.to_string()).to_string());
        }
        let added = self.ctx.credits.store(did, req.credits.clone());
        BasicResponse::ok(format!("{added} credit(s) stored"))
    }

    pub fn credit_score(&self, did: &str) -> CreditScoreReply {
        CreditScoreReply {
            score: self.ctx.credits.score(did),
        }
    }

    /// Accept tokens transferred to `did`
    ///
    /// Missing history is pulled from the sender first; the extended chain
    /// must validate before anything is written.
    pub async fn receive_tokens(&self, did: &str, req: &SendTokenRequest) -> BasicResponse {
        match self.try_receive(did, req).await {
            Ok(count) => BasicResponse::ok(format!("{count} token(s) received")),
            Err(e) => {
                tracing::warn!("Rejected tokens for {}: {}", did, e);
                BasicResponse::failed(e.to_string())
            }
        }
    }

    async fn try_receive(&self, did: &str, req: &SendTokenRequest) -> Result<usize, ResponderError> {
        if !self.ctx.hosts(did) {
            return Err(ResponderError::UnknownDid(did.to_string()));
        }
        let block = &req.token_chain_block;
        block
            .verify_hash()
            .map_err(|e| ResponderError::InvalidTokenBlock(e.to_string()))?;
        if block.transaction_type() != TransactionType::Transferred
            || block.owner() != did
            || block.receiver() != did
        {
            return Err(ResponderError::InvalidTokenBlock(format!(
                "block {} does not transfer to {}",
                block.hash(),
                did
            )));
        }

        let infos: Vec<&TokenInfo> = req.whole_tokens.iter().chain(req.part_tokens.iter()).collect();
        if infos.len() != block.tokens().len() {
            return Err(ResponderError::InvalidTokenBlock(format!(
                "block covers {} token(s), request lists {}",
                block.tokens().len(),
                infos.len()
            )));
        }
        for info in &infos {
            let entry = block.entry(&info.token)?;
            if entry.kind != info.kind {
                return Err(ResponderError::InvalidTokenBlock(format!(
                    "token {} is {:?} in the block, {:?} in the request",
                    info.token, entry.kind, info.kind
                )));
            }
        }

        let sender = block.sender().to_string();
        let mut staged: Vec<(String, Vec<Block>)> = Vec::new();
        for info in &infos {
            let local = self.ctx.chain.blocks(info.kind, &info.token)?;
            let fetched = fetch_missing_blocks(&self.ctx, &sender, &info.token, info.kind).await?;

            let genesis = local.first().or_else(|| fetched.first());
            let parent = genesis
                .and_then(|b| b.entry(&info.token).ok())
                .and_then(|e| e.parent_token.clone());
            if let Some(parent) = parent {
                self.sync_parent(&sender, &parent).await?;
            }

            let mut chain = local;
            chain.extend(fetched.iter().cloned());
            chain.push(block.clone());
            let report = self.validator.validate_chain(&info.token, &chain, 0).await;
            if !report.status {
                return Err(ResponderError::ValidationFailed(report.message));
            }
            staged.push((info.token.clone(), fetched));
        }

        for (token, blocks) in &staged {
            for staged_block in blocks {
                self.ctx.chain.append_token(token, staged_block)?;
            }
        }
        self.ctx.chain.append(block)?;

        for info in &infos {
            let entry = block.entry(&info.token)?;
            let mut record = TokenRecord::new(&info.token, did, info.kind, entry.value);
            record.parent_token = entry.parent_token.clone();
            self.ctx.tokens.upsert(record)?;
            self.ctx.transport.pin(&info.token).await?;
            self.ctx
                .providers
                .set(&info.token, did, ProviderRole::Owner);
        }

        tracing::info!(
            "{} received {} token(s) from {} in transaction {}",
            did,
            infos.len(),
            sender,
            block.transaction_id()
        );
        Ok(infos.len())
    }

    /// Pull and store the chain of a part token's parent
    async fn sync_parent(&self, sender: &str, parent: &str) -> Result<(), ResponderError> {
        let fetched = fetch_missing_blocks(&self.ctx, sender, parent, TokenKind::Whole).await?;
        if fetched.is_empty() {
            return Ok(());
        }
        let mut chain = self.ctx.chain.blocks(TokenKind::Whole, parent)?;
        chain.extend(fetched.iter().cloned());
        let report = self.validator.replay(parent, &chain, 0);
        if !report.status {
            return Err(ResponderError::ValidationFailed(format!(
                "parent token {parent}: {}",
                report.message
            )));
        }
        for block in &fetched {
            self.ctx.chain.append_token(parent, block)?;
        }
        Ok(())
    }

    /// Serve one page of a token chain
    pub fn chain_sync(&self, req: &ChainSyncRequest) -> ChainSyncReply {
        match self
            .ctx
            .chain
            .range(req.token_type, &req.token, &req.block_id, DEFAULT_PAGE_SIZE)
        {
            Ok((blocks, next_block_id)) => ChainSyncReply {
                status: true,
                message: format!("{} block(s)", blocks.len()),
                next_block_id,
                blocks,
            },
            Err(e) => ChainSyncReply {
                status: false,
                message: e.to_string(),
                next_block_id: String::new(),
                blocks: Vec::new(),
            },
        }
    }

    /// Say why this node pins a piece of content
    pub fn provider_check(&self, req: &ProviderCheckRequest) -> ProviderCheckReply {
        self.ctx.providers.check(&req.token)
    }
}
