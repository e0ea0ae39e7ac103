//! Quorum-side request handling

use super::TestCluster;
use crate::contract::{quorum_signing_hash, token_state_data, TokenInfo, TransferContract};
use crate::node::LedgerNode;
use crate::quorum::QuorumType;
use crate::transport::ContentTransport;
use crate::types::{
    ChainSyncRequest, ConsensusMode, ConsensusRequest, PledgeRequest, ProviderCheckRequest,
    ProviderRole, UnlockTokensRequest,
};
use token_chain::{TokenKind, TokenStatus};

/// A signed one-token contract from `sender`, plus the request carrying it
async fn signed_request(
    sender: &LedgerNode,
    sender_did: &str,
    receiver_did: &str,
    quorum_list: Vec<String>,
) -> (ConsensusRequest, TokenInfo) {
    let token = sender
        .issuer()
        .mint(sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);
    let genesis = sender
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .unwrap();
    let info = TokenInfo {
        token: token.clone(),
        kind: TokenKind::Whole,
        value: 1.0,
        owner_did: sender_did.to_string(),
        block_id: genesis.block_id(&token).unwrap(),
    };
    let mut contract = TransferContract::new(sender_did, receiver_did, "lunch");
    contract.add_token(info.clone());
    let signer = sender.ctx().local_did(sender_did).unwrap();
    contract.sign(signer.as_ref()).unwrap();

    let request = ConsensusRequest {
        req_id: "req-responder".to_string(),
        mode: ConsensusMode::TokenTransfer,
        sender_peer_id: sender.ctx().peer_id.clone(),
        receiver_peer_id: "peer-receiver".to_string(),
        transaction_id: contract.transaction_id(),
        contract,
        quorum_type: QuorumType::Configured,
        quorum_list,
    };
    (request, info)
}

#[tokio::test]
async fn test_consensus_signs_and_pins_state() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    let (request, info) =
        signed_request(&sender, &sender_did, "did:receiver", vec![quorum_did.clone()]).await;

    let reply = quorum.responder().consensus(&quorum_did, &request).await;
    assert!(reply.status, "{}", reply.message);
    assert_eq!(reply.req_id, request.req_id);
    let expected = quorum_signing_hash(&request.contract.authorization_hash(), "did:receiver");
    assert_eq!(reply.hash, expected);

    let state = quorum
        .ctx()
        .transport
        .content_id(&token_state_data(&info.token, &info.block_id));
    let providers = quorum.ctx().transport.find_providers(&state).await.unwrap();
    assert_eq!(providers, vec![quorum.ctx().peer_id.clone()]);

    let check = quorum
        .responder()
        .provider_check(&ProviderCheckRequest { token: state });
    assert!(check.status);
    assert_eq!(check.did, quorum_did);
    assert_eq!(check.role, Some(ProviderRole::Quorum));
    assert_eq!(check.reference, request.transaction_id);

    // a second member of the same quorum may still sign
    let (second, second_did) = cluster.spawn_node("second");
    let mut again = request.clone();
    again.quorum_list.push(second_did.clone());
    let reply = second.responder().consensus(&second_did, &again).await;
    assert!(reply.status, "{}", reply.message);
}

#[tokio::test]
async fn test_consensus_refuses_state_pinned_elsewhere() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    let (outsider, _) = cluster.spawn_node("outsider");
    let (request, info) =
        signed_request(&sender, &sender_did, "did:receiver", vec![quorum_did.clone()]).await;

    // someone outside the quorum already consumed this state
    outsider
        .ctx()
        .transport
        .put(&token_state_data(&info.token, &info.block_id))
        .await
        .unwrap();

    let reply = quorum.responder().consensus(&quorum_did, &request).await;
    assert!(!reply.status);
    assert!(reply.message.contains("double spend"), "{}", reply.message);
    assert!(reply.hash.is_empty());
}

/// Same spent state, sent to a different receiver
fn respend(
    request: &ConsensusRequest,
    sender: &LedgerNode,
    sender_did: &str,
    info: &TokenInfo,
    receiver_did: &str,
) -> ConsensusRequest {
    let mut contract = TransferContract::new(sender_did, receiver_did, "lunch");
    contract.add_token(info.clone());
    let signer = sender.ctx().local_did(sender_did).unwrap();
    contract.sign(signer.as_ref()).unwrap();

    let mut respend = request.clone();
    respend.req_id = "req-respend".to_string();
    respend.transaction_id = contract.transaction_id();
    respend.contract = contract;
    respend
}

#[tokio::test]
async fn test_consensus_refuses_second_spend_of_signed_state() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    let (request, info) =
        signed_request(&sender, &sender_did, "did:receiver-a", vec![quorum_did.clone()]).await;

    let reply = quorum.responder().consensus(&quorum_did, &request).await;
    assert!(reply.status, "{}", reply.message);
    // asking again for the same transaction is fine
    let reply = quorum.responder().consensus(&quorum_did, &request).await;
    assert!(reply.status, "{}", reply.message);

    let second = respend(&request, &sender, &sender_did, &info, "did:receiver-b");
    assert_ne!(second.transaction_id, request.transaction_id);
    let reply = quorum.responder().consensus(&quorum_did, &second).await;
    assert!(!reply.status);
    assert!(reply.message.contains("double spend"), "{}", reply.message);
    assert!(reply.hash.is_empty());

    let state = quorum
        .ctx()
        .transport
        .content_id(&token_state_data(&info.token, &info.block_id));
    let check = quorum
        .responder()
        .provider_check(&ProviderCheckRequest { token: state });
    assert_eq!(check.reference, request.transaction_id);
}

#[tokio::test]
async fn test_concurrent_spends_get_one_signature() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    let (first, info) =
        signed_request(&sender, &sender_did, "did:receiver-a", vec![quorum_did.clone()]).await;
    let second = respend(&first, &sender, &sender_did, &info, "did:receiver-b");

    let responder = quorum.responder();
    let (a, b) = tokio::join!(
        responder.consensus(&quorum_did, &first),
        responder.consensus(&quorum_did, &second)
    );
    assert_eq!(
        [a.status, b.status].iter().filter(|granted| **granted).count(),
        1,
        "{} / {}",
        a.message,
        b.message
    );
}

#[tokio::test]
async fn test_consensus_refuses_altered_contract() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    let (mut request, _) =
        signed_request(&sender, &sender_did, "did:receiver", vec![quorum_did.clone()]).await;
    request.contract.receiver_did = "did:thief".to_string();
    request.transaction_id.clear();

    let reply = quorum.responder().consensus(&quorum_did, &request).await;
    assert!(!reply.status);
    assert!(reply.message.starts_with("sender signature invalid"), "{}", reply.message);
}

#[tokio::test]
async fn test_consensus_needs_hosted_quorum_did() {
    let mut cluster = TestCluster::new();
    let (sender, sender_did) = cluster.spawn_node("sender");
    let (quorum, _) = cluster.spawn_node("quorum");
    let (request, _) = signed_request(&sender, &sender_did, "did:receiver", Vec::new()).await;

    let reply = quorum.responder().consensus("did:elsewhere", &request).await;
    assert!(!reply.status);
    assert!(reply.message.starts_with("quorum is not configured"));
}

#[tokio::test]
async fn test_pledge_request_and_unlock() {
    let mut cluster = TestCluster::new();
    let (quorum, quorum_did) = cluster.spawn_node("quorum");
    quorum.issuer().mint(&quorum_did, 3, 1.0).await.unwrap();

    let reply = quorum
        .responder()
        .request_pledge(&quorum_did, &PledgeRequest { num_tokens: 2 })
        .await;
    assert!(reply.status, "{}", reply.message);
    assert_eq!(reply.tokens.len(), 2);
    assert_eq!(reply.token_chain_block.len(), 2);
    for (token, block_id) in reply.tokens.iter().zip(&reply.proof_chain) {
        assert_eq!(quorum.ctx().tokens.get(token).unwrap().status, TokenStatus::Locked);
        assert!(block_id.starts_with("0-"));
    }

    // a stranger cannot release our tokens
    let refused = quorum
        .responder()
        .unlock_tokens(
            "did:stranger",
            &UnlockTokensRequest {
                tokens: reply.tokens.clone(),
            },
        )
        .await;
    assert!(!refused.status);

    let unlocked = quorum
        .responder()
        .unlock_tokens(
            &quorum_did,
            &UnlockTokensRequest {
                tokens: reply.tokens.clone(),
            },
        )
        .await;
    assert!(unlocked.status);
    for token in &reply.tokens {
        assert_eq!(quorum.ctx().tokens.get(token).unwrap().status, TokenStatus::Free);
    }
}

#[tokio::test]
async fn test_pledge_request_without_free_tokens() {
    let mut cluster = TestCluster::new();
    let (quorum, quorum_did) = cluster.spawn_node("quorum");

    let reply = quorum
        .responder()
        .request_pledge(&quorum_did, &PledgeRequest { num_tokens: 1 })
        .await;
    assert!(!reply.status);
    assert!(reply.tokens.is_empty());
    assert_eq!(reply.message, "no tokens left to pledge");
}

#[tokio::test]
async fn test_chain_sync_serves_pages() {
    let mut cluster = TestCluster::new();
    let (node, did) = cluster.spawn_node("holder");
    let parent = node.issuer().mint(&did, 1, 1.0).await.unwrap().remove(0);
    node.issuer().split(&did, &parent, 2).await.unwrap();

    let reply = node.responder().chain_sync(&ChainSyncRequest {
        token: parent.clone(),
        token_type: TokenKind::Whole,
        block_id: String::new(),
    });
    assert!(reply.status);
    assert_eq!(reply.blocks.len(), 2);
    assert!(reply.next_block_id.is_empty());

    // paging from the head returns just the head
    let head = reply.blocks[1].block_id(&parent).unwrap();
    let reply = node.responder().chain_sync(&ChainSyncRequest {
        token: parent.clone(),
        token_type: TokenKind::Whole,
        block_id: head,
    });
    assert_eq!(reply.blocks.len(), 1);

    let reply = node.responder().chain_sync(&ChainSyncRequest {
        token: parent,
        token_type: TokenKind::Whole,
        block_id: "7-deadbeef".to_string(),
    });
    assert!(!reply.status);
    assert!(reply.blocks.is_empty());
}

#[tokio::test]
async fn test_provider_check_unknown_content() {
    let mut cluster = TestCluster::new();
    let (node, _) = cluster.spawn_node("holder");
    let reply = node.responder().provider_check(&ProviderCheckRequest {
        token: "nothing".to_string(),
    });
    assert!(!reply.status);
    assert_eq!(reply.role, None);
}

#[tokio::test]
async fn test_credit_is_stored_per_did() {
    let mut cluster = TestCluster::new();
    let (node, did) = cluster.spawn_node("quorum");
    assert_eq!(node.responder().credit_score(&did).score, 0);

    let credit = token_chain::CreditSignature {
        did: did.clone(),
        share_sig: "00".to_string(),
        priv_sig: "00".to_string(),
        hash: "h".to_string(),
        sign_type: token_chain::SigningScheme::default(),
    };
    let reply = node.responder().store_credit(
        &did,
        &crate::types::CreditRequest {
            credits: vec![credit],
        },
    );
    assert!(reply.status);
    assert_eq!(node.responder().credit_score(&did).score, 1);

    let refused = node.responder().store_credit(
        "did:other",
        &crate::types::CreditRequest {
            credits: Vec::new(),
        },
    );
    assert!(!refused.status);
}
