//! Token records and status transitions
//!
//! Records live in a DashMap so each token is guarded by its own shard entry.
//! Status changes are compare-and-set operations; a failed precondition leaves
//! the record untouched. An optional sled tree mirrors every write.

use crate::block::TokenKind;
use crate::error::TokenError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::Arc;

/// Lifecycle state of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Free,
    Locked,
    Pledged,
    Transferred,
    Burnt,
}

/// What this node knows about one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub value: f64,
    pub owner_did: String,
    pub kind: TokenKind,
    pub status: TokenStatus,
    #[serde(default)]
    pub parent_token: Option<String>,
}

impl TokenRecord {
    pub fn new(token_id: impl Into<String>, owner_did: impl Into<String>, kind: TokenKind, value: f64) -> Self {
        Self {
            token_id: token_id.into(),
            value,
            owner_did: owner_did.into(),
            kind,
            status: TokenStatus::Free,
            parent_token: None,
        }
    }
}

/// Concurrent token record store
#[derive(Clone, Default)]
pub struct TokenStore {
    tokens: Arc<DashMap<String, TokenRecord>>,
    tree: Option<Tree>,
}

impl TokenStore {
    /// In-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store persisted in the `tokens` tree of the given database
    pub fn open(db: &Db) -> Result<Self, TokenError> {
        let tree = db.open_tree("tokens")?;
        let tokens = DashMap::new();
        for item in tree.iter() {
            let (_, value) = item?;
            let record: TokenRecord = bincode::deserialize(&value)?;
            tokens.insert(record.token_id.clone(), record);
        }
        tracing::info!("Loaded {} token records", tokens.len());
        Ok(Self {
            tokens: Arc::new(tokens),
            tree: Some(tree),
        })
    }

    /// Insert or replace a record
    pub fn upsert(&self, record: TokenRecord) -> Result<(), TokenError> {
        self.persist(&record)?;
        self.tokens.insert(record.token_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<TokenRecord> {
        self.tokens.get(token).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Records owned by a DID, sorted by token ID
    pub fn tokens_of(&self, did: &str) -> Vec<TokenRecord> {
        let mut records: Vec<TokenRecord> = self
            .tokens
            .iter()
            .filter(|r| r.owner_did == did)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        records
    }

    /// Move a token to `to` if its current status is one of `from`
    pub fn transition(
        &self,
        token: &str,
        from: &[TokenStatus],
        to: TokenStatus,
    ) -> Result<TokenRecord, TokenError> {
        let record = {
            let mut entry = self
                .tokens
                .get_mut(token)
                .ok_or_else(|| TokenError::NotFound(token.to_string()))?;
            if !from.contains(&entry.status) {
                return Err(TokenError::InvalidTransition {
                    token: token.to_string(),
                    from: entry.status,
                    to,
                });
            }
            entry.status = to;
            entry.clone()
        };
        self.persist(&record)?;
        Ok(record)
    }

    /// Hand a token to a new owner with the given status
    pub fn set_owner(&self, token: &str, owner: &str, status: TokenStatus) -> Result<TokenRecord, TokenError> {
        let record = {
            let mut entry = self
                .tokens
                .get_mut(token)
                .ok_or_else(|| TokenError::NotFound(token.to_string()))?;
            entry.owner_did = owner.to_string();
            entry.status = status;
            entry.clone()
        };
        self.persist(&record)?;
        Ok(record)
    }

    /// Lock every listed token owned by `did`, all or nothing
    pub fn lock(&self, did: &str, tokens: &[String]) -> Result<TokenLease, TokenError> {
        let mut lease = TokenLease {
            store: self.clone(),
            tokens: Vec::with_capacity(tokens.len()),
            armed: true,
        };
        for token in tokens {
            match self.get(token) {
                Some(record) if record.owner_did == did => {}
                Some(_) => {
                    return Err(TokenError::NotOwner {
                        token: token.clone(),
                        did: did.to_string(),
                    })
                }
                None => return Err(TokenError::NotFound(token.clone())),
            }
            // on error the lease drops and unlocks what it already holds
            self.transition(token, &[TokenStatus::Free], TokenStatus::Locked)?;
            lease.tokens.push(token.clone());
        }
        Ok(lease)
    }

    /// Lock up to `limit` free whole tokens owned by `did`
    pub fn lock_free_whole(&self, did: &str, limit: usize) -> Result<Vec<TokenRecord>, TokenError> {
        let mut candidates: Vec<String> = self
            .tokens
            .iter()
            .filter(|r| {
                r.owner_did == did && r.kind == TokenKind::Whole && r.status == TokenStatus::Free
            })
            .map(|r| r.key().clone())
            .collect();
        candidates.sort();

        let mut locked = Vec::new();
        for token in candidates {
            if locked.len() == limit {
                break;
            }
            // lost a race with another locker, move on
            match self.transition(&token, &[TokenStatus::Free], TokenStatus::Locked) {
                Ok(record) => locked.push(record),
                Err(TokenError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(locked)
    }

    fn persist(&self, record: &TokenRecord) -> Result<(), TokenError> {
        if let Some(tree) = &self.tree {
            tree.insert(record.token_id.as_bytes(), bincode::serialize(record)?)?;
        }
        Ok(())
    }
}

/// Tokens held `Locked` for the duration of an operation
///
/// Dropping the lease without calling [`TokenLease::commit`] returns every
/// token to `Free`.
pub struct TokenLease {
    store: TokenStore,
    tokens: Vec<String>,
    armed: bool,
}

impl TokenLease {
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Move every leased token from `Locked` to `status`
    pub fn commit(mut self, status: TokenStatus) -> Result<(), TokenError> {
        self.armed = false;
        for token in &self.tokens {
            self.store
                .transition(token, &[TokenStatus::Locked], status)?;
        }
        Ok(())
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for token in &self.tokens {
            if let Err(e) = self
                .store
                .transition(token, &[TokenStatus::Locked], TokenStatus::Free)
            {
                tracing::warn!("Failed to release token {}: {}", token, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with(owner: &str, ids: &[&str]) -> TokenStore {
        let store = TokenStore::new();
        for id in ids {
            store
                .upsert(TokenRecord::new(*id, owner, TokenKind::Whole, 1.0))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_transition_checks_current_status() {
        let store = store_with("alice", &["t1"]);
        store
            .transition("t1", &[TokenStatus::Free], TokenStatus::Locked)
            .unwrap();
        let err = store
            .transition("t1", &[TokenStatus::Free], TokenStatus::Locked)
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidTransition { from: TokenStatus::Locked, .. }));
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let store = store_with("alice", &["t1", "t2"]);
        {
            let lease = store
                .lock("alice", &["t1".to_string(), "t2".to_string()])
                .unwrap();
            assert_eq!(lease.tokens().len(), 2);
            assert_eq!(store.get("t1").unwrap().status, TokenStatus::Locked);
        }
        assert_eq!(store.get("t1").unwrap().status, TokenStatus::Free);
        assert_eq!(store.get("t2").unwrap().status, TokenStatus::Free);
    }

    #[test]
    fn test_lease_commit() {
        let store = store_with("alice", &["t1"]);
        let lease = store.lock("alice", &["t1".to_string()]).unwrap();
        lease.commit(TokenStatus::Transferred).unwrap();
        assert_eq!(store.get("t1").unwrap().status, TokenStatus::Transferred);
    }

    #[test]
    fn test_lock_is_all_or_nothing() {
        let store = store_with("alice", &["t1", "t2"]);
        store
            .transition("t2", &[TokenStatus::Free], TokenStatus::Pledged)
            .unwrap();
        assert!(store
            .lock("alice", &["t1".to_string(), "t2".to_string()])
            .is_err());
        assert_eq!(store.get("t1").unwrap().status, TokenStatus::Free);
    }

    #[test]
    fn test_lock_rejects_foreign_tokens() {
        let store = store_with("alice", &["t1"]);
        assert!(matches!(
            store.lock("bob", &["t1".to_string()]),
            Err(TokenError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_lock_free_whole_respects_limit() {
        let store = store_with("quorum", &["a", "b", "c"]);
        store
            .upsert(TokenRecord::new("p", "quorum", TokenKind::Part, 0.5))
            .unwrap();
        let locked = store.lock_free_whole("quorum", 2).unwrap();
        assert_eq!(locked.len(), 2);
        assert_eq!(locked[0].token_id, "a");

        let rest = store.lock_free_whole("quorum", 5).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].token_id, "c");
    }

    #[test]
    fn test_persisted_records_reload() {
        let dir = tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let store = TokenStore::open(&db).unwrap();
            store
                .upsert(TokenRecord::new("t1", "alice", TokenKind::Whole, 2.0))
                .unwrap();
            store
                .transition("t1", &[TokenStatus::Free], TokenStatus::Pledged)
                .unwrap();
            db.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let store = TokenStore::open(&db).unwrap();
        let record = store.get("t1").unwrap();
        assert_eq!(record.status, TokenStatus::Pledged);
        assert_eq!(record.value, 2.0);
    }
}
