//! Ledger Node
//!
//! Main entry point for a token-chain ledger node.
//! Hosts one or more DIDs, serves the peer API and takes part in quorum
//! consensus for other nodes' transfers. State lives in a sled database
//! under the data directory and survives restarts.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quorum_consensus::{
    LedgerNode, MemorySwarm, NodeContextBuilder, PeerDirectory, PeerEndpoint, QuorumData,
    QuorumManager, QuorumType,
};
use rpc_server::{ControlRpcServer, HttpPeerNetwork, PeerRpcServer};
use std::path::PathBuf;
use std::sync::Arc;
use token_chain::{ChainStore, DidCrypto, DidRegistry, KeyDid, TokenKind, TokenStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Token-chain ledger node
#[derive(Parser, Debug)]
#[command(name = "ledger-node")]
#[command(about = "Permissioned token ledger with quorum consensus", long_about = None)]
struct Args {
    /// Path of the JSON config file
    #[arg(long, global = true, default_value = "node.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the peer and control APIs until Ctrl+C
    Run,
    /// Generate a DID key pair
    Keygen {
        /// Host the new DID on this node by adding it to the config
        #[arg(long)]
        add: bool,
    },
    /// Mint whole tokens for a hosted DID
    Mint {
        /// Hosted DID, defaults to the first one
        #[arg(long)]
        did: Option<String>,
        #[arg(long, default_value = "1")]
        count: usize,
        #[arg(long, default_value = "1.0")]
        value: f64,
    },
    /// Validate every stored token chain of a hosted DID
    Validate {
        #[arg(long)]
        did: Option<String>,
        /// Stop after this many blocks per chain, 0 for all
        #[arg(long, default_value = "0")]
        block_limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::load(&args.config)?;
    match args.command {
        Command::Run => run(config).await,
        Command::Keygen { add } => keygen(config, &args.config, add),
        Command::Mint { did, count, value } => mint(config, did, count, value).await,
        Command::Validate { did, block_limit } => validate(config, did, block_limit).await,
    }
}

/// Open the database and assemble a node from the config
fn open_node(config: &NodeConfig) -> Result<Arc<LedgerNode>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db = sled::open(config.data_dir.join("ledger"))
        .with_context(|| format!("opening database in {:?}", config.data_dir))?;

    let chain = Arc::new(ChainStore::with_db(&db)?);
    let tokens = TokenStore::open(&db)?;
    let quorums = QuorumManager::open(&db)?;
    if !config.quorum.is_empty() {
        let added = quorums.add_quorum(
            config
                .quorum
                .iter()
                .map(|did| QuorumData::new(QuorumType::Configured, did.clone()))
                .collect(),
        )?;
        tracing::info!("Quorum: {} configured, {} new", config.quorum.len(), added);
    }

    let registry = DidRegistry::new();
    let directory = PeerDirectory::new();
    for peer in &config.peers {
        let did = registry
            .register_public(&peer.public_key)
            .with_context(|| format!("peer {}", peer.peer_id))?;
        directory.register(PeerEndpoint {
            did,
            peer_id: peer.peer_id.clone(),
            url: peer.url.clone(),
        });
    }

    let mut hosted = Vec::with_capacity(config.did_secrets.len());
    for secret in &config.did_secrets {
        let key = KeyDid::from_secret_hex(secret)?;
        registry.register(Arc::new(key.verify_only()));
        directory.register(PeerEndpoint {
            did: key.did().to_string(),
            peer_id: config.peer_id.clone(),
            url: config.public_url(),
        });
        hosted.push(Arc::new(key));
    }

    let network = HttpPeerNetwork::new(directory.clone(), config.timeouts.http_timeout())?;
    let transport = MemorySwarm::new().handle(config.peer_id.clone());
    let mut builder = NodeContextBuilder::new(
        config.peer_id.clone(),
        chain,
        Arc::new(transport),
        Arc::new(network),
    )
    .tokens(tokens)
    .quorums(quorums)
    .resolver(Arc::new(registry))
    .directory(directory)
    .config(config.timeouts.consensus_config());
    for key in hosted {
        tracing::info!("Hosting DID {}", key.did());
        builder = builder.host_did(key);
    }

    Ok(Arc::new(LedgerNode::new(Arc::new(builder.build()))))
}

fn pick_did(node: &LedgerNode, did: Option<String>) -> Result<String> {
    match did {
        Some(did) if node.ctx().hosts(&did) => Ok(did),
        Some(did) => bail!("DID {did} is not hosted on this node"),
        None => match node.ctx().hosted_dids().into_iter().next() {
            Some(did) => Ok(did),
            None => bail!("no DID configured, run `keygen --add` first"),
        },
    }
}

/// Serve the peer and control APIs
async fn run(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting ledger node {}", config.peer_id);
    tracing::info!("  Listen: {}", config.listen_addr);
    tracing::info!("  Control: {}", config.control_addr);
    tracing::info!("  Public URL: {}", config.public_url());
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!("  Known peers: {}", config.peers.len());

    let node = open_node(&config)?;
    if node.ctx().hosted_dids().is_empty() {
        tracing::warn!("No DID hosted, this node can only serve chain sync");
    }

    let control_addr = config.control_addr()?;
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let control = tokio::net::TcpListener::bind(control_addr).await?;

    let (stop, stopped) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        let _ = stop.send(true);
    });
    let until_stopped = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    tracing::info!("Press Ctrl+C to stop.");
    tokio::try_join!(
        PeerRpcServer::new(node.clone()).serve(listener, until_stopped(stopped.clone())),
        ControlRpcServer::new(node.clone()).serve(control, until_stopped(stopped)),
    )?;

    tracing::info!("Shutting down...");
    node.ctx().chain.flush()?;
    tracing::info!("Node stopped");
    Ok(())
}

fn keygen(mut config: NodeConfig, path: &std::path::Path, add: bool) -> Result<()> {
    let key = KeyDid::generate();
    let secret = key
        .secret_hex()
        .context("generated key has no secret half")?;
    println!("did:        {}", key.did());
    println!("public key: {}", key.public_hex());
    println!("secret key: {}", secret);

    if add {
        config.did_secrets.push(secret);
        config.save(path)?;
        tracing::info!("Added {} to {:?}", key.did(), path);
    }
    Ok(())
}

async fn mint(config: NodeConfig, did: Option<String>, count: usize, value: f64) -> Result<()> {
    if count == 0 || value <= 0.0 {
        bail!("count and value must be positive");
    }
    let node = open_node(&config)?;
    let did = pick_did(&node, did)?;
    let tokens = node.issuer().mint(&did, count, value).await?;
    for token in &tokens {
        println!("{token}");
    }
    node.ctx().chain.flush()?;
    Ok(())
}

async fn validate(config: NodeConfig, did: Option<String>, block_limit: usize) -> Result<()> {
    let node = open_node(&config)?;
    let did = pick_did(&node, did)?;

    let mut failed = 0;
    for kind in [TokenKind::Whole, TokenKind::Part] {
        for (token, report) in node
            .validator()
            .validate_all(&did, kind, block_limit)
            .await?
        {
            let verdict = if report.status { "ok" } else { "FAILED" };
            println!("{token} {verdict}: {}", report.message);
            if !report.status {
                failed += 1;
            }
        }
    }
    node.ctx().chain.flush()?;
    if failed > 0 {
        bail!("{failed} chain(s) failed validation");
    }
    Ok(())
}
