//! Token chain blocks
//!
//! A [`Block`] records one state transition for one or more tokens. The hash
//! covers the canonical JSON form of [`BlockContent`] only, so signatures can
//! be attached after the hash is fixed. Each token in the block carries its
//! own [`TokenEntry`] with the block number and predecessor ID for that
//! token's chain.

use crate::did::{DidCrypto, SigningScheme};
use crate::error::BlockError;
use crate::hashing::sha3_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of token kinds
pub const KIND_COUNT: usize = 5;

/// Token family, doubles as the chain store key prefix
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    #[default]
    Whole,
    Part,
    Nft,
    Data,
    SmartContract,
}

impl TokenKind {
    pub const ALL: [TokenKind; KIND_COUNT] = [
        TokenKind::Whole,
        TokenKind::Part,
        TokenKind::Nft,
        TokenKind::Data,
        TokenKind::SmartContract,
    ];

    /// Key prefix in the chain store
    pub fn prefix(self) -> &'static str {
        match self {
            TokenKind::Whole => "wt",
            TokenKind::Part => "pt",
            TokenKind::Nft => "nft",
            TokenKind::Data => "dt",
            TokenKind::SmartContract => "sc",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// What a block does to its tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Genesis,
    Transferred,
    Pledged,
    Unpledged,
    Burnt,
    ContractCommitted,
    Deployed,
    Executed,
    DataGenerated,
    NftGenerated,
}

impl TransactionType {
    /// Types that may open a chain
    pub fn is_genesis(self) -> bool {
        matches!(
            self,
            TransactionType::Genesis
                | TransactionType::DataGenerated
                | TransactionType::NftGenerated
                | TransactionType::Deployed
        )
    }
}

/// Per-token view of a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenEntry {
    pub kind: TokenKind,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub previous_block_id: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<String>,
}

impl TokenEntry {
    pub fn new(kind: TokenKind, value: f64) -> Self {
        Self {
            kind,
            value,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_token = Some(parent.into());
        self
    }
}

/// A token pledged as collateral for a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PledgeDetail {
    /// Pledged token
    pub token: String,
    /// Quorum DID that pledged it
    pub did: String,
    /// Latest block ID of the pledged token when it was handed out
    pub token_block_id: String,
}

/// Quorum co-signature over a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSignature {
    pub did: String,
    /// Hex share signature, empty for single key schemes
    pub share_sig: String,
    /// Hex private key signature
    pub priv_sig: String,
    /// Hash that was signed
    pub hash: String,
    pub sign_type: SigningScheme,
}

/// Sender signature over the authorization hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorSignature {
    pub did: String,
    pub share_sig: String,
    pub priv_sig: String,
    /// Authorization hash
    pub hash: String,
    pub sign_type: SigningScheme,
}

/// Hashed part of a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BlockContent {
    pub transaction_type: TransactionType,
    pub owner: String,
    pub tokens: BTreeMap<String, TokenEntry>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub comment: String,
    /// Free-form back reference, e.g. the transfer a pledge block belongs to
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub pledge_details: Vec<PledgeDetail>,
    #[serde(default)]
    pub child_tokens: Vec<String>,
    #[serde(default)]
    pub quorum_signatures: Vec<CreditSignature>,
    #[serde(default)]
    pub initiator_signature: Option<InitiatorSignature>,
    #[serde(default)]
    pub epoch: u64,
}

impl BlockContent {
    /// Empty content stamped with the current time
    pub fn new(transaction_type: TransactionType, owner: impl Into<String>) -> Self {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            transaction_type,
            owner: owner.into(),
            epoch,
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, entry: TokenEntry) -> Self {
        self.tokens.insert(token.into(), entry);
        self
    }
}

/// Immutable, content-hashed ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    content: BlockContent,
    hash: String,
    #[serde(default)]
    signatures: BTreeMap<String, String>,
}

impl Block {
    /// Build a block on top of the given predecessors
    ///
    /// `previous` maps each token to its current latest block, `None` when the
    /// token has no chain yet. Block numbers and predecessor IDs are filled in
    /// here; a draft that already carries a non-zero block number must agree
    /// with the computed one.
    pub fn create(
        previous: &BTreeMap<String, Option<Block>>,
        mut content: BlockContent,
    ) -> Result<Self, BlockError> {
        let genesis = content.transaction_type.is_genesis();

        for (token, entry) in content.tokens.iter_mut() {
            match previous.get(token).and_then(|p| p.as_ref()) {
                Some(prev) => {
                    let prev_entry = prev.entry(token)?;
                    let expected = prev_entry.block_number + 1;
                    if genesis || (entry.block_number != 0 && entry.block_number != expected) {
                        return Err(BlockError::InvalidSequence {
                            token: token.clone(),
                            expected,
                            found: entry.block_number,
                        });
                    }
                    entry.block_number = expected;
                    entry.previous_block_id = prev.block_id(token)?;
                }
                None => {
                    if !genesis {
                        return Err(BlockError::MissingPredecessor(token.clone()));
                    }
                    entry.block_number = 0;
                    entry.previous_block_id = String::new();
                }
            }
        }

        let mut block = Self {
            content,
            hash: String::new(),
            signatures: BTreeMap::new(),
        };
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    pub fn content(&self) -> &BlockContent {
        &self.content
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.content.transaction_type
    }

    pub fn owner(&self) -> &str {
        &self.content.owner
    }

    pub fn sender(&self) -> &str {
        &self.content.sender
    }

    pub fn receiver(&self) -> &str {
        &self.content.receiver
    }

    pub fn transaction_id(&self) -> &str {
        &self.content.transaction_id
    }

    pub fn tokens(&self) -> &BTreeMap<String, TokenEntry> {
        &self.content.tokens
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.content.tokens.keys().map(String::as_str)
    }

    pub fn pledge_details(&self) -> &[PledgeDetail] {
        &self.content.pledge_details
    }

    pub fn quorum_signatures(&self) -> &[CreditSignature] {
        &self.content.quorum_signatures
    }

    pub fn initiator_signature(&self) -> Option<&InitiatorSignature> {
        self.content.initiator_signature.as_ref()
    }

    /// Entry for one token
    pub fn entry(&self, token: &str) -> Result<&TokenEntry, BlockError> {
        self.content
            .tokens
            .get(token)
            .ok_or_else(|| BlockError::UnknownToken(token.to_string()))
    }

    /// Stored hash
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Hash of the canonical content serialisation
    pub fn compute_hash(&self) -> Result<String, BlockError> {
        let bytes = serde_json::to_vec(&self.content)
            .map_err(|e| BlockError::Serialization(e.to_string()))?;
        Ok(sha3_hex(bytes))
    }

    /// Recompute the hash and compare it to the stored one
    pub fn verify_hash(&self) -> Result<(), BlockError> {
        let computed = self.compute_hash()?;
        if computed != self.hash {
            return Err(BlockError::HashMismatch {
                stored: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// `"<block_number>-<hash>"` for the token
    pub fn block_id(&self, token: &str) -> Result<String, BlockError> {
        Ok(format!("{}-{}", self.entry(token)?.block_number, self.hash))
    }

    pub fn block_number(&self, token: &str) -> Result<u64, BlockError> {
        Ok(self.entry(token)?.block_number)
    }

    pub fn previous_block_id(&self, token: &str) -> Result<&str, BlockError> {
        Ok(&self.entry(token)?.previous_block_id)
    }

    /// Check that this block directly follows `previous` in the token's chain
    pub fn check_successor(&self, previous: Option<&Block>, token: &str) -> Result<(), BlockError> {
        let entry = self.entry(token)?;
        match previous {
            None => {
                if entry.block_number != 0 {
                    return Err(BlockError::InvalidSequence {
                        token: token.to_string(),
                        expected: 0,
                        found: entry.block_number,
                    });
                }
                if !entry.previous_block_id.is_empty() {
                    return Err(BlockError::MissingPredecessor(token.to_string()));
                }
            }
            Some(prev) => {
                let expected = prev.block_number(token)? + 1;
                if entry.block_number != expected {
                    return Err(BlockError::InvalidSequence {
                        token: token.to_string(),
                        expected,
                        found: entry.block_number,
                    });
                }
                let prev_id = prev.block_id(token)?;
                if entry.previous_block_id != prev_id {
                    return Err(BlockError::PredecessorMismatch {
                        token: token.to_string(),
                        expected: prev_id,
                        found: entry.previous_block_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Attach the signer's signature over the block hash
    pub fn sign(&mut self, signer: &dyn DidCrypto) -> Result<(), BlockError> {
        let sig = signer.pvt_sign(self.hash.as_bytes())?;
        self.signatures
            .insert(signer.did().to_string(), hex::encode(sig));
        Ok(())
    }

    /// Verify the signature left by the verifier's DID
    pub fn verify_signature(&self, verifier: &dyn DidCrypto) -> Result<(), BlockError> {
        let did = verifier.did();
        let sig = self
            .signatures
            .get(did)
            .ok_or_else(|| BlockError::MissingSignature(did.to_string()))?;
        let sig = hex::decode(sig).map_err(|_| BlockError::InvalidSignature(did.to_string()))?;
        if !verifier.pvt_verify(self.hash.as_bytes(), &sig)? {
            return Err(BlockError::InvalidSignature(did.to_string()));
        }
        Ok(())
    }

    /// DIDs that signed this block
    pub fn signers(&self) -> impl Iterator<Item = &str> {
        self.signatures.keys().map(String::as_str)
    }

    pub fn is_signed_by(&self, did: &str) -> bool {
        self.signatures.contains_key(did)
    }
}
