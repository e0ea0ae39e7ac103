//! Consensus errors

use thiserror::Error;
use token_chain::{BlockError, ChainError, DidError, TokenError};

/// Failure reaching or talking to a peer
#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("no route to peer {0}")]
    UnknownPeer(String),

    #[error("peer {did} unreachable: {reason}")]
    Unreachable { did: String, reason: String },

    #[error("request to peer {0} timed out")]
    Timeout(String),

    #[error("invalid reply from peer {did}: {reason}")]
    Decode { did: String, reason: String },
}

/// Content transport failures
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Pledge negotiation failures
#[derive(Error, Debug, Clone)]
pub enum PledgeError {
    #[error("pledge timed out after {waited_secs}s with {remaining} token(s) outstanding")]
    Timeout { waited_secs: u64, remaining: usize },

    #[error("every quorum peer was asked, {remaining} pledge token(s) still outstanding")]
    Insufficient { remaining: usize },

    #[error("pledge incomplete, {remaining} token(s) outstanding")]
    Incomplete { remaining: usize },

    #[error("quorum {did} rejected the pledge: {message}")]
    Rejected { did: String, message: String },

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Top level protocol errors
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("sequence error: {0}")]
    Sequence(#[from] ChainError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("double spend suspected for token {token}: {reason}")]
    DoubleSpendSuspected { token: String, reason: String },

    #[error("pledge failed: {0}")]
    Pledge(#[from] PledgeError),

    #[error("consensus failed: {0}")]
    Failed(String),

    #[error("transaction {0} already settled")]
    AlreadySettled(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Did(#[from] DidError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons a responder refuses a request
///
/// These never cross the wire as errors; they become the `message` of a
/// reply with `status: false`.
#[derive(Error, Debug)]
pub enum ResponderError {
    #[error("quorum is not configured for DID {0}")]
    QuorumNotConfigured(String),

    #[error("DID {0} is not hosted on this node")]
    UnknownDid(String),

    #[error("sender signature invalid: {0}")]
    SenderSignatureInvalid(String),

    #[error("invalid pledge block: {0}")]
    InvalidPledgeBlock(String),

    #[error("invalid token block: {0}")]
    InvalidTokenBlock(String),

    #[error("token chain validation failed: {0}")]
    ValidationFailed(String),

    #[error("no tokens left to pledge")]
    NoPledgeTokens,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl From<ChainError> for ResponderError {
    fn from(e: ChainError) -> Self {
        ResponderError::Consensus(e.into())
    }
}

impl From<BlockError> for ResponderError {
    fn from(e: BlockError) -> Self {
        ResponderError::Consensus(e.into())
    }
}

impl From<TokenError> for ResponderError {
    fn from(e: TokenError) -> Self {
        ResponderError::Consensus(e.into())
    }
}

impl From<DidError> for ResponderError {
    fn from(e: DidError) -> Self {
        ResponderError::Consensus(e.into())
    }
}

impl From<PeerError> for ResponderError {
    fn from(e: PeerError) -> Self {
        ResponderError::Consensus(e.into())
    }
}

impl From<TransportError> for ResponderError {
    fn from(e: TransportError) -> Self {
        ResponderError::Consensus(e.into())
    }
}
