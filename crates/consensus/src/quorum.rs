//! Quorum membership
//!
//! Known quorum peers are kept in memory and mirrored to the `quorum` sled
//! tree. Selection only reads the in-memory copy.

use crate::error::ConsensusError;
use crate::{MIN_QUORUM_REQUIRED, QUORUM_REQUIRED};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

/// Quorum class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QuorumType {
    /// Shared pool partitioned by the last hex character of each DID
    PublicPool,
    /// Statically configured list
    Configured,
}

impl TryFrom<u8> for QuorumType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(QuorumType::PublicPool),
            2 => Ok(QuorumType::Configured),
            other => Err(format!("unknown quorum type {other}")),
        }
    }
}

impl From<QuorumType> for u8 {
    fn from(value: QuorumType) -> Self {
        match value {
            QuorumType::PublicPool => 1,
            QuorumType::Configured => 2,
        }
    }
}

/// One known quorum peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumData {
    #[serde(rename = "type")]
    pub quorum_type: QuorumType,
    pub address: String,
}

impl QuorumData {
    pub fn new(quorum_type: QuorumType, address: impl Into<String>) -> Self {
        Self {
            quorum_type,
            address: address.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}-{}", u8::from(self.quorum_type), self.address)
    }
}

/// Split a legacy `"peerID.DID"` address, returning `(peer_id, did)`
pub fn migrate_address(address: &str) -> (Option<&str>, &str) {
    match address.split_once('.') {
        Some((peer, did)) => (Some(peer), did),
        None => (None, address),
    }
}

/// Quorum membership registry
#[derive(Default)]
pub struct QuorumManager {
    entries: RwLock<Vec<QuorumData>>,
    tree: Option<Tree>,
}

impl QuorumManager {
    /// In-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted in the given database, migrating legacy addresses
    pub fn open(db: &Db) -> Result<Self, ConsensusError> {
        let tree = db.open_tree("quorum")?;
        let mut stored = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            let data: QuorumData = serde_json::from_slice(&value)
                .map_err(|e| ConsensusError::Configuration(format!("corrupt quorum entry: {e}")))?;
            stored.push((key, data));
        }

        let mut entries: Vec<QuorumData> = Vec::with_capacity(stored.len());
        let mut migrated = 0;
        for (key, mut data) in stored {
            if let (Some(_), did) = migrate_address(&data.address) {
                data.address = did.to_string();
                tree.remove(key)?;
                tree.insert(data.storage_key().as_bytes(), encode(&data)?)?;
                migrated += 1;
            }
            if !entries.contains(&data) {
                entries.push(data);
            }
        }
        if migrated > 0 {
            tracing::info!("Migrated {} legacy quorum address(es)", migrated);
        }

        Ok(Self {
            entries: RwLock::new(entries),
            tree: Some(tree),
        })
    }

    /// Add quorum peers, returns how many were new
    pub fn add_quorum(&self, list: Vec<QuorumData>) -> Result<usize, ConsensusError> {
        let mut added = 0;
        let mut entries = self.entries.write();
        for mut data in list {
            let (_, did) = migrate_address(&data.address);
            data.address = did.to_string();
            if entries.contains(&data) {
                continue;
            }
            if let Some(tree) = &self.tree {
                tree.insert(data.storage_key().as_bytes(), encode(&data)?)?;
            }
            entries.push(data);
            added += 1;
        }
        Ok(added)
    }

    /// Forget every quorum peer
    pub fn remove_all_quorum(&self) -> Result<(), ConsensusError> {
        if let Some(tree) = &self.tree {
            tree.clear()?;
        }
        self.entries.write().clear();
        Ok(())
    }

    /// Configured addresses of one class
    pub fn get_quorum(&self, quorum_type: QuorumType) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|d| d.quorum_type == quorum_type)
            .map(|d| d.address.clone())
            .collect()
    }

    /// Pick the quorum for a transaction
    ///
    /// Public pool selection keeps DIDs whose last hex character matches the
    /// tiebreak character, needs at least [`MIN_QUORUM_REQUIRED`] of them and
    /// returns at most [`QUORUM_REQUIRED`].
    pub fn select_quorum(
        &self,
        quorum_type: QuorumType,
        tiebreak: char,
    ) -> Result<Vec<String>, ConsensusError> {
        let mut candidates = self.get_quorum(quorum_type);
        match quorum_type {
            QuorumType::PublicPool => {
                let tiebreak = tiebreak.to_ascii_lowercase();
                candidates.retain(|did| {
                    did.chars()
                        .last()
                        .map(|c| c.to_ascii_lowercase() == tiebreak)
                        .unwrap_or(false)
                });
                candidates.sort();
                if candidates.len() < MIN_QUORUM_REQUIRED {
                    return Err(ConsensusError::Configuration(format!(
                        "only {} public quorum candidate(s) in bucket '{}', need {}",
                        candidates.len(),
                        tiebreak,
                        MIN_QUORUM_REQUIRED
                    )));
                }
                candidates.truncate(QUORUM_REQUIRED);
            }
            QuorumType::Configured => {
                if candidates.is_empty() {
                    return Err(ConsensusError::Configuration(
                        "quorum is not configured".to_string(),
                    ));
                }
            }
        }
        Ok(candidates)
    }
}

fn encode(data: &QuorumData) -> Result<Vec<u8>, ConsensusError> {
    serde_json::to_vec(data)
        .map_err(|e| ConsensusError::Configuration(format!("cannot encode quorum entry: {e}")))
}
