//! DID signing capability
//!
//! The ledger never looks inside a signing scheme. Everything that signs or
//! verifies goes through [`DidCrypto`], and a [`DidResolver`] hands out
//! verify-only handles for remote identities.
//!
//! [`KeyDid`] is the ed25519 backed implementation used by this node. Other
//! schemes plug in by implementing the trait and tagging their signatures with
//! the matching [`SigningScheme`].

use crate::error::DidError;
use crate::hashing::sha3_hex;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Closed set of signing schemes a DID may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SigningScheme {
    /// Image based secret sharing
    Nlss,
    /// Single key derived from a BIP style seed
    #[default]
    LiteBip,
    /// Keys held by an external wallet
    Wallet,
    /// Test scheme
    Dummy,
}

/// Signing and verification contract for one DID
pub trait DidCrypto: Send + Sync {
    /// The DID this capability belongs to
    fn did(&self) -> &str;

    /// Scheme tag attached to produced signatures
    fn scheme(&self) -> SigningScheme;

    /// Sign a hash, returning `(share_sig, priv_sig)`
    fn sign(&self, hash: &str) -> Result<(Vec<u8>, Vec<u8>), DidError>;

    /// Verify a `(share_sig, priv_sig)` pair over a hash
    fn verify(&self, hash: &str, share_sig: &[u8], priv_sig: &[u8]) -> Result<bool, DidError>;

    /// Sign arbitrary bytes with the private key only
    fn pvt_sign(&self, data: &[u8]) -> Result<Vec<u8>, DidError>;

    /// Verify a private key signature
    fn pvt_verify(&self, data: &[u8], sig: &[u8]) -> Result<bool, DidError>;
}

/// Looks up verify-only capabilities for DIDs
pub trait DidResolver: Send + Sync {
    fn resolve(&self, did: &str) -> Result<Arc<dyn DidCrypto>, DidError>;
}

/// Derive a DID from an ed25519 public key
pub fn did_from_public_key(key: &VerifyingKey) -> String {
    sha3_hex(key.as_bytes())
}

/// ed25519 backed DID
#[derive(Clone)]
pub struct KeyDid {
    did: String,
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
}

impl KeyDid {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self {
            did: did_from_public_key(&verifying),
            signing: Some(signing),
            verifying,
        }
    }

    /// Load a signing DID from a hex encoded 32 byte secret
    pub fn from_secret_hex(secret: &str) -> Result<Self, DidError> {
        let bytes: [u8; 32] = decode_fixed(secret)?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Load a verify-only DID from a hex encoded public key
    pub fn from_public_hex(public: &str) -> Result<Self, DidError> {
        let bytes: [u8; 32] = decode_fixed(public)?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| DidError::InvalidKey(e.to_string()))?;
        Ok(Self {
            did: did_from_public_key(&verifying),
            signing: None,
            verifying,
        })
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying.as_bytes())
    }

    pub fn secret_hex(&self) -> Option<String> {
        self.signing.as_ref().map(|k| hex::encode(k.to_bytes()))
    }

    /// Copy of this DID without the private key
    pub fn verify_only(&self) -> Self {
        Self {
            did: self.did.clone(),
            signing: None,
            verifying: self.verifying,
        }
    }

    fn signing_key(&self) -> Result<&SigningKey, DidError> {
        self.signing
            .as_ref()
            .ok_or_else(|| DidError::VerifyOnly(self.did.clone()))
    }
}

impl std::fmt::Debug for KeyDid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDid")
            .field("did", &self.did)
            .field("can_sign", &self.signing.is_some())
            .finish()
    }
}

impl DidCrypto for KeyDid {
    fn did(&self) -> &str {
        &self.did
    }

    fn scheme(&self) -> SigningScheme {
        SigningScheme::LiteBip
    }

    fn sign(&self, hash: &str) -> Result<(Vec<u8>, Vec<u8>), DidError> {
        // single key scheme: no share signature
        Ok((Vec::new(), self.pvt_sign(hash.as_bytes())?))
    }

    fn verify(&self, hash: &str, _share_sig: &[u8], priv_sig: &[u8]) -> Result<bool, DidError> {
        self.pvt_verify(hash.as_bytes(), priv_sig)
    }

    fn pvt_sign(&self, data: &[u8]) -> Result<Vec<u8>, DidError> {
        Ok(self.signing_key()?.sign(data).to_bytes().to_vec())
    }

    fn pvt_verify(&self, data: &[u8], sig: &[u8]) -> Result<bool, DidError> {
        let signature = Signature::from_slice(sig)
            .map_err(|e| DidError::MalformedSignature(e.to_string()))?;
        Ok(self.verifying.verify(data, &signature).is_ok())
    }
}

fn decode_fixed(input: &str) -> Result<[u8; 32], DidError> {
    let bytes = hex::decode(input.trim()).map_err(|e| DidError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| DidError::InvalidKey("expected 32 bytes".to_string()))
}

/// In-memory DID directory
///
/// Holds verify-only handles for every identity this node has been told
/// about. Cheap to clone.
#[derive(Clone, Default)]
pub struct DidRegistry {
    entries: Arc<DashMap<String, Arc<dyn DidCrypto>>>,
}

impl DidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own DID
    pub fn register(&self, did: Arc<dyn DidCrypto>) {
        self.entries.insert(did.did().to_string(), did);
    }

    /// Register a remote DID from its hex public key, returning the DID
    pub fn register_public(&self, public_hex: &str) -> Result<String, DidError> {
        let key = KeyDid::from_public_hex(public_hex)?;
        let did = key.did().to_string();
        self.register(Arc::new(key));
        Ok(did)
    }

    pub fn contains(&self, did: &str) -> bool {
        self.entries.contains_key(did)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DidResolver for DidRegistry {
    fn resolve(&self, did: &str) -> Result<Arc<dyn DidCrypto>, DidError> {
        self.entries
            .get(did)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DidError::Unknown(did.to_string()))
    }
}
