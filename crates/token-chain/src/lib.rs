//! Token Chain - per-token ledger primitives
//!
//! This crate provides the storage side of the ledger node:
//! - Content-hashed blocks with per-token sequencing
//! - Append-only sled chain store with reference dedup for shared blocks
//! - Token records with guarded status transitions
//! - The DID signing capability the rest of the node signs through

pub mod block;
pub mod chain_store;
pub mod did;
pub mod error;
pub mod hashing;
pub mod token_store;

pub use block::{
    Block, BlockContent, CreditSignature, InitiatorSignature, PledgeDetail, TokenEntry, TokenKind,
    TransactionType,
};
pub use chain_store::{ChainStore, DEFAULT_PAGE_SIZE};
pub use did::{DidCrypto, DidRegistry, DidResolver, KeyDid, SigningScheme};
pub use error::{BlockError, ChainError, DidError, TokenError};
pub use hashing::sha3_hex;
pub use token_store::{TokenLease, TokenRecord, TokenStatus, TokenStore};
