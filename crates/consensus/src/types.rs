//! Peer RPC message types
//!
//! Every reply carries an explicit `status` flag and a human readable
//! `message`; refusals never travel as transport errors.

use crate::contract::{TokenInfo, TransferContract};
use crate::quorum::QuorumType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use token_chain::{Block, CreditSignature, TokenKind};

/// Generic `{status, message}` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicResponse {
    pub status: bool,
    pub message: String,
}

impl BasicResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
        }
    }
}

/// Kind of consensus being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    #[default]
    TokenTransfer,
}

/// Request sent to every quorum member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub req_id: String,
    #[serde(default)]
    pub mode: ConsensusMode,
    pub sender_peer_id: String,
    pub receiver_peer_id: String,
    pub contract: TransferContract,
    pub quorum_type: QuorumType,
    /// DIDs of the selected quorum
    #[serde(default)]
    pub quorum_list: Vec<String>,
    #[serde(default)]
    pub transaction_id: String,
}

/// A quorum member's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusReply {
    pub req_id: String,
    pub status: bool,
    pub message: String,
    /// Hash the member signed
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub share_sig: String,
    #[serde(default)]
    pub priv_sig: String,
}

impl ConsensusReply {
    pub fn failed(req_id: &str, message: impl Into<String>) -> Self {
        Self {
            req_id: req_id.to_string(),
            status: false,
            message: message.into(),
            hash: String::new(),
            share_sig: String::new(),
            priv_sig: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub credits: Vec<CreditSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditScoreReply {
    pub score: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PledgeRequest {
    pub num_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PledgeReply {
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Latest block of each token, same order as `tokens`
    #[serde(default)]
    pub token_chain_block: Vec<Block>,
    /// Block IDs of `token_chain_block`
    #[serde(default)]
    pub proof_chain: Vec<String>,
}

impl PledgeReply {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
            tokens: Vec::new(),
            token_chain_block: Vec::new(),
            proof_chain: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePledgeRequest {
    pub pledged_tokens: Vec<String>,
    pub token_chain_block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockTokensRequest {
    pub tokens: Vec<String>,
}

/// Tokens pushed to the receiver once consensus is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTokenRequest {
    pub sender_peer_id: String,
    #[serde(default)]
    pub whole_tokens: Vec<TokenInfo>,
    #[serde(default)]
    pub part_tokens: Vec<TokenInfo>,
    pub token_chain_block: Block,
    #[serde(default)]
    pub quorum_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSyncRequest {
    pub token: String,
    #[serde(default)]
    pub token_type: TokenKind,
    /// Start of the page, empty for genesis
    #[serde(default)]
    pub block_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSyncReply {
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub next_block_id: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCheckRequest {
    pub token: String,
}

/// Why a peer provides a piece of content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Owner,
    Quorum,
    PrevSender,
    Receiver,
    ParentTokenLock,
    Did,
    Staking,
    Pledging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCheckReply {
    pub status: bool,
    pub token: String,
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub func_id: u32,
    #[serde(default)]
    pub role: Option<ProviderRole>,
    /// Transaction the content was pinned for
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatusReply {
    pub version: String,
    pub did_exists: bool,
}

/// Local request to start a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender_did: String,
    pub receiver_did: String,
    pub receiver_peer_id: String,
    pub tokens: Vec<String>,
    #[serde(default)]
    pub comment: String,
    pub quorum_type: QuorumType,
}

/// Summary of a settled transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub transaction_id: String,
    pub sender_did: String,
    pub receiver_did: String,
    pub amount: f64,
    pub comment: String,
    pub block_hash: String,
    pub tokens: Vec<String>,
    pub epoch: i64,
}

/// Collateral secured for a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PledgeSummary {
    pub required: usize,
    /// Quorum DID -> tokens it pledged
    pub pledged_tokens: BTreeMap<String, Vec<String>>,
}

/// Reply of the local transfer endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReply {
    pub status: bool,
    pub message: String,
    #[serde(default)]
    pub details: Option<TransactionDetails>,
    #[serde(default)]
    pub quorum_list: Vec<String>,
    #[serde(default)]
    pub pledge: Option<PledgeSummary>,
}

/// Local request to validate a token chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub did: String,
    pub token: String,
    #[serde(default)]
    pub token_type: TokenKind,
    /// 0 validates the whole chain
    #[serde(default)]
    pub block_limit: usize,
}
