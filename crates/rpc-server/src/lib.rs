//! RPC Server - peer HTTP API for a ledger node
//!
//! Provides both sides of node-to-node traffic plus the operator's API:
//! - Peer HTTP server: every endpoint another node calls
//! - Control HTTP server: local transfer and validation, loopback only
//! - HTTP client: [`HttpPeerNetwork`], the `PeerNetwork` used by the consensus engine

pub mod control_server;
pub mod http_server;
pub mod peer_client;

pub use control_server::ControlRpcServer;
pub use http_server::{DidQuery, PeerRpcServer};
pub use peer_client::HttpPeerNetwork;

/// Endpoint paths shared by server and client
pub mod paths {
    pub const PING: &str = "/ping";
    pub const PEER_STATUS: &str = "/peer/status";
    pub const CONSENSUS: &str = "/quorum/consensus";
    pub const CREDIT: &str = "/quorum/credit";
    pub const PLEDGE_REQUEST: &str = "/quorum/pledge/request";
    pub const PLEDGE_UPDATE: &str = "/quorum/pledge/update";
    pub const PLEDGE_UNLOCK: &str = "/quorum/pledge/unlock";
    pub const TOKEN_RECEIVE: &str = "/token/receive";
    pub const CHAIN_SYNC: &str = "/token/chain/sync";
    pub const PROVIDER_CHECK: &str = "/dht/provider-check";

    // control server only
    pub const TRANSFER: &str = "/token/transfer";
    pub const VALIDATE: &str = "/token/validate";
}
