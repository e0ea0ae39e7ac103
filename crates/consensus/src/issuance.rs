//! Token issuance
//!
//! Minting opens new whole-token chains; splitting burns a whole token and
//! opens one part-token chain per fraction.

use crate::context::NodeContext;
use crate::error::ConsensusError;
use crate::types::ProviderRole;
use std::collections::BTreeMap;
use std::sync::Arc;
use token_chain::{
    Block, BlockContent, ChainError, DidCrypto, TokenEntry, TokenError, TokenKind, TokenRecord,
    TokenStatus, TransactionType,
};
use uuid::Uuid;

#[derive(Clone)]
pub struct TokenIssuer {
    ctx: Arc<NodeContext>,
}

impl TokenIssuer {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn owner(&self, did: &str) -> Result<Arc<dyn DidCrypto>, ConsensusError> {
        self.ctx
            .local_did(did)
            .ok_or_else(|| ConsensusError::Configuration(format!("DID {did} is not hosted here")))
    }

    /// Mint `count` whole tokens worth `value` each for a hosted DID
    pub async fn mint(
        &self,
        did: &str,
        count: usize,
        value: f64,
    ) -> Result<Vec<String>, ConsensusError> {
        let owner = self.owner(did)?;
        let mut minted = Vec::with_capacity(count);
        for _ in 0..count {
            let seed = format!("{}:{}:{}", did, Uuid::new_v4(), value);
            let token = self.ctx.transport.put(seed.as_bytes()).await?;

            let content = BlockContent::new(TransactionType::Genesis, did)
                .with_token(&token, TokenEntry::new(TokenKind::Whole, value));
            let previous = BTreeMap::from([(token.clone(), None)]);
            let mut block = Block::create(&previous, content)?;
            block.sign(owner.as_ref())?;
            self.ctx.chain.append(&block)?;

            self.ctx
                .tokens
                .upsert(TokenRecord::new(&token, did, TokenKind::Whole, value))?;
            self.ctx.providers.set(&token, did, ProviderRole::Owner);
            minted.push(token);
        }
        tracing::info!("Minted {} token(s) of value {} for {}", count, value, did);
        Ok(minted)
    }

    /// Burn a whole token into `parts` equal part tokens
    pub async fn split(
        &self,
        did: &str,
        parent: &str,
        parts: usize,
    ) -> Result<Vec<String>, ConsensusError> {
        if parts < 2 {
            return Err(ConsensusError::Configuration(format!(
                "cannot split into {parts} part(s)"
            )));
        }
        let owner = self.owner(did)?;
        let record = self
            .ctx
            .tokens
            .get(parent)
            .ok_or_else(|| TokenError::NotFound(parent.to_string()))?;
        if record.kind != TokenKind::Whole {
            return Err(ConsensusError::Configuration(format!(
                "only whole tokens can be split, {parent} is {:?}",
                record.kind
            )));
        }

        let lease = self.ctx.tokens.lock(did, &[parent.to_string()])?;
        let latest = self
            .ctx
            .chain
            .latest(TokenKind::Whole, parent)?
            .ok_or_else(|| ChainError::ChainNotFound(parent.to_string()))?;

        let share = record.value / parts as f64;
        let mut children = Vec::with_capacity(parts);
        for index in 0..parts {
            let seed = format!("{}:{}:{}", parent, index, Uuid::new_v4());
            children.push(self.ctx.transport.put(seed.as_bytes()).await?);
        }

        let mut burn = BlockContent::new(TransactionType::Burnt, did)
            .with_token(parent, TokenEntry::new(TokenKind::Whole, record.value));
        burn.child_tokens = children.clone();
        burn.comment = format!("split into {parts} parts");
        let previous = BTreeMap::from([(parent.to_string(), Some(latest))]);
        let mut burnt = Block::create(&previous, burn)?;
        burnt.sign(owner.as_ref())?;
        self.ctx.chain.append(&burnt)?;
        lease.commit(TokenStatus::Burnt)?;
        self.ctx.transport.unpin(parent).await?;
        self.ctx.providers.remove(parent);

        let mut genesis = BlockContent::new(TransactionType::Genesis, did);
        genesis.reference = burnt.hash().to_string();
        let mut previous = BTreeMap::new();
        for child in &children {
            genesis.tokens.insert(
                child.clone(),
                TokenEntry::new(TokenKind::Part, share).with_parent(parent),
            );
            previous.insert(child.clone(), None);
        }
        let mut block = Block::create(&previous, genesis)?;
        block.sign(owner.as_ref())?;
        self.ctx.chain.append(&block)?;

        for child in &children {
            let mut record = TokenRecord::new(child, did, TokenKind::Part, share);
            record.parent_token = Some(parent.to_string());
            self.ctx.tokens.upsert(record)?;
            self.ctx.providers.set(child, did, ProviderRole::Owner);
        }
        tracing::info!("Split {} into {} part token(s) for {}", parent, parts, did);
        Ok(children)
    }
}
