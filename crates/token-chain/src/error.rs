//! Ledger errors

use crate::token_store::TokenStatus;
use thiserror::Error;

/// Errors raised while building or checking a single block
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block does not reference token {0}")]
    UnknownToken(String),

    #[error("missing predecessor block for token {0}")]
    MissingPredecessor(String),

    #[error("invalid sequence for token {token}: expected block {expected}, found {found}")]
    InvalidSequence {
        token: String,
        expected: u64,
        found: u64,
    },

    #[error("previous block mismatch for token {token}: expected {expected}, found {found}")]
    PredecessorMismatch {
        token: String,
        expected: String,
        found: String,
    },

    #[error("block hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("block has no signature from {0}")]
    MissingSignature(String),

    #[error("invalid block signature from {0}")]
    InvalidSignature(String),

    #[error("block serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Did(#[from] DidError),
}

/// Chain store errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("token chain not found: {0}")]
    ChainNotFound(String),

    #[error("corrupt chain entry: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl ChainError {
    /// True when the error is a violation of the block sequence invariant
    pub fn is_sequence_violation(&self) -> bool {
        matches!(
            self,
            ChainError::Block(BlockError::InvalidSequence { .. })
                | ChainError::Block(BlockError::PredecessorMismatch { .. })
                | ChainError::Block(BlockError::MissingPredecessor(_))
        )
    }
}

/// Token record errors
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token not found: {0}")]
    NotFound(String),

    #[error("token {token} is {from:?}, cannot move to {to:?}")]
    InvalidTransition {
        token: String,
        from: TokenStatus,
        to: TokenStatus,
    },

    #[error("token {token} is not owned by {did}")]
    NotOwner { token: String, did: String },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// DID capability errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DidError {
    #[error("unknown DID: {0}")]
    Unknown(String),

    #[error("DID {0} has no private key on this node")]
    VerifyOnly(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signing scheme {0:?} is not supported here")]
    UnsupportedScheme(crate::did::SigningScheme),
}
