//! Transfer contract and the hashes derived from it
//!
//! The authorization hash is a pure function of the token set, each token's
//! latest block ID, receiver, sender and comment. Retrying the same transfer
//! therefore yields the same transaction ID on every node.

use crate::error::ConsensusError;
use serde::{Deserialize, Serialize};
use token_chain::{sha3_hex, DidCrypto, DidError, InitiatorSignature, TokenKind};

/// A token being moved, with the chain head it is moved from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub kind: TokenKind,
    pub value: f64,
    pub owner_did: String,
    /// Latest block ID of the token when the contract was built
    pub block_id: String,
}

/// What the sender authorizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferContract {
    pub sender_did: String,
    pub receiver_did: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub whole_tokens: Vec<TokenInfo>,
    #[serde(default)]
    pub part_tokens: Vec<TokenInfo>,
    #[serde(default)]
    pub sender_signature: Option<InitiatorSignature>,
}

#[derive(Serialize)]
struct AuthorizationPayload<'a> {
    whole_tokens: Vec<(&'a str, &'a str)>,
    part_tokens: Vec<(&'a str, &'a str)>,
    receiver: &'a str,
    sender: &'a str,
    comment: &'a str,
}

impl TransferContract {
    pub fn new(
        sender_did: impl Into<String>,
        receiver_did: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            sender_did: sender_did.into(),
            receiver_did: receiver_did.into(),
            comment: comment.into(),
            whole_tokens: Vec::new(),
            part_tokens: Vec::new(),
            sender_signature: None,
        }
    }

    /// Add a token, whole tokens and fractional ones are kept apart
    pub fn add_token(&mut self, info: TokenInfo) {
        if info.kind == TokenKind::Whole {
            self.whole_tokens.push(info);
        } else {
            self.part_tokens.push(info);
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenInfo> {
        self.whole_tokens.iter().chain(self.part_tokens.iter())
    }

    pub fn token_ids(&self) -> Vec<String> {
        self.tokens().map(|t| t.token.clone()).collect()
    }

    pub fn total_value(&self) -> f64 {
        self.tokens().map(|t| t.value).sum()
    }

    /// Hash the sender signs
    pub fn authorization_hash(&self) -> String {
        fn sorted(tokens: &[TokenInfo]) -> Vec<(&str, &str)> {
            let mut pairs: Vec<(&str, &str)> = tokens
                .iter()
                .map(|t| (t.token.as_str(), t.block_id.as_str()))
                .collect();
            pairs.sort();
            pairs
        }

        let payload = AuthorizationPayload {
            whole_tokens: sorted(&self.whole_tokens),
            part_tokens: sorted(&self.part_tokens),
            receiver: &self.receiver_did,
            sender: &self.sender_did,
            comment: &self.comment,
        };
        // serialising plain strings and tuples cannot fail
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        sha3_hex(bytes)
    }

    pub fn transaction_id(&self) -> String {
        transaction_id_of(&self.authorization_hash())
    }

    /// Sign the authorization hash as the sender
    pub fn sign(&mut self, signer: &dyn DidCrypto) -> Result<(), DidError> {
        let hash = self.authorization_hash();
        let (share, private) = signer.sign(&hash)?;
        self.sender_signature = Some(InitiatorSignature {
            did: signer.did().to_string(),
            share_sig: hex::encode(share),
            priv_sig: hex::encode(private),
            hash,
            sign_type: signer.scheme(),
        });
        Ok(())
    }

    /// Check the sender signature against the recomputed authorization hash
    pub fn verify_sender(&self, verifier: &dyn DidCrypto) -> Result<(), ConsensusError> {
        let sig = self
            .sender_signature
            .as_ref()
            .ok_or_else(|| ConsensusError::Signature("contract is not signed".to_string()))?;
        if sig.did != self.sender_did || verifier.did() != self.sender_did {
            return Err(ConsensusError::Signature(format!(
                "contract signed by {} instead of sender {}",
                sig.did, self.sender_did
            )));
        }
        let hash = self.authorization_hash();
        if sig.hash != hash {
            return Err(ConsensusError::Signature(
                "authorization hash does not match contract".to_string(),
            ));
        }
        verify_hex_signature(verifier, &hash, &sig.share_sig, &sig.priv_sig)
    }
}

/// Transaction ID derived from an authorization hash
pub fn transaction_id_of(authorization_hash: &str) -> String {
    sha3_hex(authorization_hash.as_bytes())
}

/// Hash every quorum member signs for a transfer
pub fn quorum_signing_hash(authorization_hash: &str, receiver_did: &str) -> String {
    sha3_hex(format!("{authorization_hash}{receiver_did}"))
}

/// Content that stands for "token at this block", pinned when it is consumed
pub fn token_state_data(token: &str, block_id: &str) -> Vec<u8> {
    format!("{token}{block_id}").into_bytes()
}

/// Verify a hex encoded `(share, private)` signature pair
pub fn verify_hex_signature(
    verifier: &dyn DidCrypto,
    hash: &str,
    share_sig: &str,
    priv_sig: &str,
) -> Result<(), ConsensusError> {
    let share = hex::decode(share_sig)
        .map_err(|e| ConsensusError::Signature(format!("bad share signature encoding: {e}")))?;
    let private = hex::decode(priv_sig)
        .map_err(|e| ConsensusError::Signature(format!("bad private signature encoding: {e}")))?;
    if !verifier.verify(hash, &share, &private)? {
        return Err(ConsensusError::Signature(format!(
            "signature from {} does not verify",
            verifier.did()
        )));
    }
    Ok(())
}
