//! Chain sync pull
//!
//! Fetches the part of a token chain this node does not have yet from the
//! node hosting `peer_did`, starting at the local head.

use crate::context::NodeContext;
use crate::error::{ConsensusError, PeerError};
use crate::types::ChainSyncRequest;
use tokio::time::timeout;
use token_chain::{Block, TokenKind};

/// Blocks the peer holds beyond the local head of `token`, oldest first
pub async fn fetch_missing_blocks(
    ctx: &NodeContext,
    peer_did: &str,
    token: &str,
    kind: TokenKind,
) -> Result<Vec<Block>, ConsensusError> {
    let (mut cursor, held) = match ctx.chain.latest(kind, token)? {
        Some(head) => (head.block_id(token)?, Some(head.block_number(token)?)),
        None => (String::new(), None),
    };

    let mut fetched = Vec::new();
    let mut last = held;
    loop {
        let req = ChainSyncRequest {
            token: token.to_string(),
            token_type: kind,
            block_id: cursor.clone(),
        };
        let reply = timeout(ctx.config.status_timeout, ctx.network.sync_chain(peer_did, &req))
            .await
            .map_err(|_| PeerError::Timeout(peer_did.to_string()))??;
        if !reply.status {
            return Err(ConsensusError::Failed(format!(
                "chain sync of {} from {} refused: {}",
                token, peer_did, reply.message
            )));
        }

        for block in reply.blocks {
            let number = block.block_number(token)?;
            if last.is_some_and(|n| number <= n) {
                continue;
            }
            last = Some(number);
            fetched.push(block);
        }

        if reply.next_block_id.is_empty() || reply.next_block_id == cursor {
            break;
        }
        cursor = reply.next_block_id;
    }

    if !fetched.is_empty() {
        tracing::debug!(
            "Fetched {} block(s) of {} from {}",
            fetched.len(),
            token,
            peer_did
        );
    }
    Ok(fetched)
}
