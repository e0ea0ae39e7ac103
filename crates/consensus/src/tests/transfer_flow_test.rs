//! End-to-end transfer tests
//!
//! Runs the full protocol across a sender, a receiver and a configured quorum:
//! - A settled transfer moves the token chain to the receiver
//! - Collateral is pledged and credits are delivered
//! - Falling below the signature threshold leaves everything untouched,
//!   losing members above it does not stop the transfer
//! - A delivered transfer is accepted once even when delivered twice at once
//! - Part tokens carry their parent's history along

use super::TransferSetup;
use crate::contract::{token_state_data, TokenInfo, TransferContract};
use crate::coordinator::ConsensusCoordinator;
use crate::error::ConsensusError;
use crate::transport::ContentTransport;
use crate::types::{ConsensusMode, ConsensusRequest, ProviderRole};
use crate::validator::ValidationFailure;
use crate::MIN_CONSENSUS_REQUIRED;
use std::collections::BTreeMap;
use token_chain::{Block, PledgeDetail, TokenKind, TokenStatus, TransactionType};

#[tokio::test]
async fn test_transfer_moves_token_to_receiver() {
    let setup = TransferSetup::new(7, 1).await;
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);
    let genesis = setup
        .sender
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .unwrap();

    let outcome = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], "rent"))
        .await
        .unwrap();

    // both ends agree on the new head
    for node in [&setup.sender, &setup.receiver] {
        let latest = node
            .ctx()
            .chain
            .latest(TokenKind::Whole, &token)
            .unwrap()
            .unwrap();
        assert_eq!(latest.block_number(&token).unwrap(), 1);
        assert_eq!(latest.owner(), setup.receiver_did);
        assert_eq!(latest.transaction_type(), TransactionType::Transferred);
        assert_eq!(
            latest.previous_block_id(&token).unwrap(),
            genesis.block_id(&token).unwrap()
        );
        assert_eq!(latest.transaction_id(), outcome.details.transaction_id);
    }

    let sent = setup.sender.ctx().tokens.get(&token).unwrap();
    assert_eq!(sent.status, TokenStatus::Transferred);
    let received = setup.receiver.ctx().tokens.get(&token).unwrap();
    assert_eq!(received.status, TokenStatus::Free);
    assert_eq!(received.owner_did, setup.receiver_did);

    // the receiver now pins the token, the sender no longer does
    let providers = setup
        .receiver
        .ctx()
        .transport
        .find_providers(&token)
        .await
        .unwrap();
    assert_eq!(providers, vec![setup.receiver.ctx().peer_id.clone()]);

    let report = setup
        .receiver
        .validator()
        .validate(&setup.receiver_did, &token, TokenKind::Whole, 0)
        .await;
    assert!(report.status, "{}", report.message);
    assert_eq!(report.validated_blocks, 2);

    assert_eq!(outcome.details.amount, 1.0);
    assert_eq!(outcome.quorum_list.len(), 7);
    assert!(setup.sender.coordinator().is_settled(&outcome.details.transaction_id));
    assert!(setup.sender.coordinator().sessions().is_empty());
}

#[tokio::test]
async fn test_transfer_pledges_collateral_and_pays_credit() {
    let setup = TransferSetup::new(7, 1).await;
    let tokens = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 3, 1.0)
        .await
        .unwrap();

    let outcome = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(tokens, "three"))
        .await
        .unwrap();

    // ceil(3 / 2) tokens backed the transfer
    assert_eq!(outcome.pledge.required, 2);
    let pledged: Vec<(&String, &Vec<String>)> = outcome.pledge.pledged_tokens.iter().collect();
    assert_eq!(pledged.iter().map(|(_, t)| t.len()).sum::<usize>(), 2);

    for (did, tokens) in pledged {
        let node = setup.quorum_node(did).unwrap();
        for token in tokens {
            let record = node.ctx().tokens.get(token).unwrap();
            assert_eq!(record.status, TokenStatus::Pledged);
            let latest = node
                .ctx()
                .chain
                .latest(TokenKind::Whole, token)
                .unwrap()
                .unwrap();
            assert_eq!(latest.transaction_type(), TransactionType::Pledged);
            assert_eq!(latest.transaction_id(), outcome.details.transaction_id);
            assert_eq!(latest.block_number(token).unwrap(), 1);
        }
    }

    let paid = setup
        .quorum
        .iter()
        .filter(|(node, did)| node.responder().credit_score(did).score > 0)
        .count();
    assert!(paid >= MIN_CONSENSUS_REQUIRED);
}

#[tokio::test]
async fn test_transfer_fails_below_signature_threshold() {
    let setup = TransferSetup::new(5, 1).await;
    setup.cluster.network.take_down(&setup.quorum[4].1);
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);

    let result = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], "rent"))
        .await;
    assert!(matches!(result, Err(ConsensusError::Failed(_))));

    // nothing moved and nothing stays locked
    let record = setup.sender.ctx().tokens.get(&token).unwrap();
    assert_eq!(record.status, TokenStatus::Free);
    let latest = setup
        .sender
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .unwrap();
    assert_eq!(latest.block_number(&token).unwrap(), 0);
    assert!(setup
        .receiver
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .is_none());
    for (node, did) in &setup.quorum {
        for record in node.ctx().tokens.tokens_of(did) {
            assert_eq!(record.status, TokenStatus::Free);
        }
    }
    assert!(setup.sender.coordinator().sessions().is_empty());
}

#[tokio::test]
async fn test_too_few_quorum_peers_is_configuration_error() {
    let setup = TransferSetup::new(4, 1).await;
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);

    let result = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], ""))
        .await;
    assert!(matches!(result, Err(ConsensusError::Configuration(_))));
    assert_eq!(
        setup.sender.ctx().tokens.get(&token).unwrap().status,
        TokenStatus::Free
    );
}

#[tokio::test]
async fn test_settled_transaction_is_not_replayed() {
    let setup = TransferSetup::new(5, 1).await;
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);
    let genesis = setup
        .sender
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .unwrap();

    let mut contract = TransferContract::new(&setup.sender_did, &setup.receiver_did, "once");
    contract.add_token(TokenInfo {
        token: token.clone(),
        kind: TokenKind::Whole,
        value: 1.0,
        owner_did: setup.sender_did.clone(),
        block_id: genesis.block_id(&token).unwrap(),
    });
    let request = ConsensusRequest {
        req_id: "req-once".to_string(),
        mode: ConsensusMode::TokenTransfer,
        sender_peer_id: setup.sender.ctx().peer_id.clone(),
        receiver_peer_id: setup.receiver.ctx().peer_id.clone(),
        contract,
        quorum_type: crate::quorum::QuorumType::Configured,
        quorum_list: Vec::new(),
        transaction_id: String::new(),
    };
    let signer = setup.sender.ctx().local_did(&setup.sender_did).unwrap();

    let outcome = setup
        .sender
        .coordinator()
        .initiate_consensus(request.clone(), signer.clone())
        .await
        .unwrap();

    let mut retry = request;
    retry.req_id = "req-again".to_string();
    match setup
        .sender
        .coordinator()
        .initiate_consensus(retry.clone(), signer.clone())
        .await
    {
        Err(ConsensusError::AlreadySettled(tid)) => {
            assert_eq!(tid, outcome.details.transaction_id)
        }
        other => panic!("expected AlreadySettled, got {other:?}"),
    }

    // a fresh coordinator over the same chain, as after a restart
    let restarted = ConsensusCoordinator::new(setup.sender.ctx().clone());
    assert!(!restarted.is_settled(&outcome.details.transaction_id));
    retry.req_id = "req-after-restart".to_string();
    match restarted.initiate_consensus(retry, signer).await {
        Err(ConsensusError::AlreadySettled(tid)) => {
            assert_eq!(tid, outcome.details.transaction_id)
        }
        other => panic!("expected AlreadySettled, got {other:?}"),
    }
    assert!(restarted.is_settled(&outcome.details.transaction_id));
}

#[tokio::test]
async fn test_part_token_transfer_brings_parent_history() {
    let setup = TransferSetup::new(5, 1).await;
    let parent = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);
    let parts = setup
        .sender
        .issuer()
        .split(&setup.sender_did, &parent, 2)
        .await
        .unwrap();
    assert_eq!(
        setup.sender.ctx().tokens.get(&parent).unwrap().status,
        TokenStatus::Burnt
    );

    let outcome = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![parts[0].clone()], "half"))
        .await
        .unwrap();
    assert_eq!(outcome.details.amount, 0.5);

    let receiver = setup.receiver.ctx();
    let burnt = receiver
        .chain
        .latest(TokenKind::Whole, &parent)
        .unwrap()
        .unwrap();
    assert_eq!(burnt.transaction_type(), TransactionType::Burnt);
    let part = receiver.tokens.get(&parts[0]).unwrap();
    assert_eq!(part.kind, TokenKind::Part);
    assert_eq!(part.parent_token.as_deref(), Some(parent.as_str()));

    let report = setup
        .receiver
        .validator()
        .validate(&setup.receiver_did, &parts[0], TokenKind::Part, 0)
        .await;
    assert!(report.status, "{}", report.message);

    // the other half stays with the sender
    assert_eq!(
        setup.sender.ctx().tokens.get(&parts[1]).unwrap().status,
        TokenStatus::Free
    );
}

#[tokio::test]
async fn test_transfer_succeeds_with_members_down() {
    let setup = TransferSetup::new(7, 1).await;
    let down = [setup.quorum[5].1.clone(), setup.quorum[6].1.clone()];
    for did in &down {
        setup.cluster.network.take_down(did);
    }
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);

    let outcome = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], "rent"))
        .await
        .unwrap();

    let latest = setup
        .receiver
        .ctx()
        .chain
        .latest(TokenKind::Whole, &token)
        .unwrap()
        .unwrap();
    assert_eq!(latest.transaction_id(), outcome.details.transaction_id);
    assert_eq!(latest.quorum_signatures().len(), MIN_CONSENSUS_REQUIRED);
    assert!(latest
        .quorum_signatures()
        .iter()
        .all(|credit| !down.contains(&credit.did)));
    for detail in latest.pledge_details() {
        assert!(latest.quorum_signatures().iter().any(|c| c.did == detail.did));
    }
    assert_eq!(
        setup.sender.ctx().tokens.get(&token).unwrap().status,
        TokenStatus::Transferred
    );
}

#[tokio::test]
async fn test_simultaneous_deliveries_accept_once() {
    let setup = TransferSetup::new(5, 1).await;
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);

    // consensus completes but the receiver is offline for the push
    setup.cluster.network.take_down(&setup.receiver_did);
    let result = setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], "twice"))
        .await;
    assert!(result.is_err());
    let delivery = setup.cluster.network.last_delivery().unwrap();
    setup.cluster.network.bring_up(&setup.receiver_did);

    let responder = setup.receiver.responder();
    let (a, b) = tokio::join!(
        responder.receive_tokens(&setup.receiver_did, &delivery),
        responder.receive_tokens(&setup.receiver_did, &delivery)
    );
    assert_eq!(
        [a.status, b.status].iter().filter(|ok| **ok).count(),
        1,
        "{} / {}",
        a.message,
        b.message
    );

    let blocks = setup
        .receiver
        .ctx()
        .chain
        .blocks(TokenKind::Whole, &token)
        .unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1], delivery.token_chain_block);
    let record = setup.receiver.ctx().tokens.get(&token).unwrap();
    assert_eq!(record.owner_did, setup.receiver_did);
}

/// Settle one transfer and return the token with the receiver's copy of its chain
async fn settled_transfer(setup: &TransferSetup) -> (String, Vec<Block>) {
    let token = setup
        .sender
        .issuer()
        .mint(&setup.sender_did, 1, 1.0)
        .await
        .unwrap()
        .remove(0);
    setup
        .sender
        .coordinator()
        .transfer(&setup.transfer_request(vec![token.clone()], "rent"))
        .await
        .unwrap();
    let blocks = setup
        .receiver
        .ctx()
        .chain
        .blocks(TokenKind::Whole, &token)
        .unwrap();
    (token, blocks)
}

/// Re-seal a transfer block with edited content, signed by the sender again
fn reseal(
    setup: &TransferSetup,
    token: &str,
    chain: &[Block],
    edit: impl FnOnce(&mut Vec<PledgeDetail>),
) -> Block {
    let mut content = chain[1].content().clone();
    edit(&mut content.pledge_details);
    let mut previous = BTreeMap::new();
    previous.insert(token.to_string(), Some(chain[0].clone()));
    let mut block = Block::create(&previous, content).unwrap();
    let signer = setup.sender.ctx().local_did(&setup.sender_did).unwrap();
    block.sign(signer.as_ref()).unwrap();
    block
}

#[tokio::test]
async fn test_pledge_details_must_name_signers() {
    let setup = TransferSetup::new(5, 1).await;
    let (token, chain) = settled_transfer(&setup).await;
    let validator = setup.receiver.validator();
    assert!(validator.replay(&token, &chain, 0).status);

    let forged = reseal(&setup, &token, &chain, |details| {
        details[0].did = "did:stranger".to_string();
    });
    let report = validator.replay(&token, &[chain[0].clone(), forged], 0);
    assert!(!report.status);
    assert_eq!(report.failure, Some(ValidationFailure::QuorumSignatureInvalid));
    assert_eq!(report.failed_block, Some(1));
    assert!(report.message.contains("did:stranger"), "{}", report.message);

    let unbacked = reseal(&setup, &token, &chain, |details| details.clear());
    let report = validator.replay(&token, &[chain[0].clone(), unbacked], 0);
    assert!(!report.status);
    assert_eq!(report.failure, Some(ValidationFailure::Malformed));
}

#[tokio::test]
async fn test_signer_holding_state_for_other_transaction_is_exhausted() {
    let setup = TransferSetup::new(5, 1).await;
    let (token, chain) = settled_transfer(&setup).await;

    // one signer reports that it consumed the spent state for another transaction
    let signer = chain[1].quorum_signatures()[0].did.clone();
    let node = setup.quorum_node(&signer).unwrap();
    let state = node
        .ctx()
        .transport
        .content_id(&token_state_data(&token, &chain[0].block_id(&token).unwrap()));
    node.ctx()
        .providers
        .set_with_reference(&state, &signer, ProviderRole::Quorum, "tid-earlier");

    let report = setup
        .receiver
        .validator()
        .validate(&setup.receiver_did, &token, TokenKind::Whole, 0)
        .await;
    assert!(!report.status);
    assert_eq!(report.failure, Some(ValidationFailure::StateExhausted));
    assert_eq!(report.failed_block, Some(1));
}
