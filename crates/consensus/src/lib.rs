//! Quorum Consensus - pledge-backed token transfers
//!
//! Architecture:
//! - The sender's node selects a quorum and fans out one task per member
//! - Members pledge free whole tokens as collateral and co-sign the transfer
//! - The receiver pulls missing history, validates the chain and takes ownership
//! - Content pins on the transport act as ownership and spent-state signals

pub mod context;
pub mod contract;
pub mod coordinator;
pub mod credit;
pub mod error;
pub mod issuance;
pub mod network;
pub mod node;
pub mod pledge;
pub mod quorum;
pub mod responder;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;
pub mod validator;

#[cfg(test)]
mod tests;

/// Quorum size for the public pool
pub const QUORUM_REQUIRED: usize = 7;
/// Smallest quorum a transfer may start with
pub const MIN_QUORUM_REQUIRED: usize = 5;
/// Signatures needed for a transfer to succeed
pub const MIN_CONSENSUS_REQUIRED: usize = 5;

pub use context::{ConsensusConfig, NodeContext, NodeContextBuilder};
pub use contract::{TokenInfo, TransferContract};
pub use coordinator::{ConsensusCoordinator, ConsensusOutcome};
pub use credit::CreditStore;
pub use error::{ConsensusError, PeerError, PledgeError, ResponderError, TransportError};
pub use issuance::TokenIssuer;
pub use network::{PeerDirectory, PeerEndpoint, PeerNetwork};
pub use node::LedgerNode;
pub use pledge::{pledge_tokens_required, PledgeCoordinator, PledgeState};
pub use quorum::{QuorumData, QuorumManager, QuorumType};
pub use responder::QuorumResponder;
pub use session::{ConsensusSession, ConsensusSessionStore, SessionCounters};
pub use transport::{ContentTransport, MemorySwarm, MemoryTransport, ProviderRecord, ProviderRegistry};
pub use types::*;
pub use validator::{ChainValidator, ValidationFailure, ValidationReport};
