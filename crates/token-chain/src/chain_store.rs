//! Token chain storage
//!
//! Append-only block logs keyed per token, kept in sled trees:
//! - `chain_entries`: `<kind>-<token>-<blockID>` -> stored entry
//! - `chain_refs`: `rf-<payloadHash>-<blockHash>` -> block shared by several tokens
//! - `chain_index`: `<kind>-<len(token)>:<token>-` + big endian block number -> blockID
//! - `chain_heads`: `<kind>-<token>` -> latest blockID
//!
//! Writers take one mutex per token kind and commit all four trees in one
//! sled transaction. Readers go straight to sled and never see a block that
//! is only partly appended.

use crate::block::{Block, TokenKind, KIND_COUNT};
use crate::error::ChainError;
use crate::hashing::sha3_hex;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;

/// Default page size for [`ChainStore::range`]
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Value stored under a per-token entry key
#[derive(Debug, Serialize, Deserialize)]
enum StoredEntry {
    /// Block JSON kept directly under the token key
    Inline(Vec<u8>),
    /// Pointer into the reference tree
    Reference(String),
}

/// Persistent per-token block log
pub struct ChainStore {
    db: Db,
    entries: Tree,
    refs: Tree,
    index: Tree,
    heads: Tree,
    write_locks: [Mutex<()>; KIND_COUNT],
}

impl ChainStore {
    /// Open or create a chain store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let db = sled::open(&path)?;
        tracing::info!("Opened chain store at {:?}", path.as_ref());
        Self::with_db(&db)
    }

    /// Chain store backed by a throwaway database
    pub fn temporary() -> Result<Self, ChainError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(&db)
    }

    /// Chain store sharing an already opened database
    pub fn with_db(db: &Db) -> Result<Self, ChainError> {
        Ok(Self {
            db: db.clone(),
            entries: db.open_tree("chain_entries")?,
            refs: db.open_tree("chain_refs")?,
            index: db.open_tree("chain_index")?,
            heads: db.open_tree("chain_heads")?,
            write_locks: std::array::from_fn(|_| Mutex::new(())),
        })
    }

    /// Append a block to the chain of every token it covers
    ///
    /// Nothing is written if any covered token would break its sequence.
    pub fn append(&self, block: &Block) -> Result<(), ChainError> {
        let tokens: Vec<&str> = block.token_ids().collect();
        self.append_tokens(block, &tokens)
    }

    /// Append a shared block to a single token's chain
    pub fn append_token(&self, token: &str, block: &Block) -> Result<(), ChainError> {
        self.append_tokens(block, &[token])
    }

    fn append_tokens(&self, block: &Block, tokens: &[&str]) -> Result<(), ChainError> {
        let mut kinds = tokens
            .iter()
            .map(|t| block.entry(t).map(|e| e.kind))
            .collect::<Result<Vec<_>, _>>()?;
        kinds.sort();
        kinds.dedup();
        let _guards: Vec<_> = kinds
            .iter()
            .map(|k| self.write_locks[k.index()].lock())
            .collect();

        for token in tokens {
            let kind = block.entry(token)?.kind;
            let previous = self.latest(kind, token)?;
            block.check_successor(previous.as_ref(), token)?;
        }

        let payload = serde_json::to_vec(block)?;
        let reference = (block.tokens().len() > 1).then(|| reference_key(&payload, block.hash()));
        let stored = match &reference {
            Some(key) => StoredEntry::Reference(key.clone()),
            None => StoredEntry::Inline(payload.clone()),
        };
        let encoded = bincode::serialize(&stored)?;

        let mut writes = Vec::with_capacity(tokens.len());
        for token in tokens {
            let entry = block.entry(token)?;
            let id = block.block_id(token)?;
            writes.push((
                entry_key(entry.kind, token, &id),
                index_key(entry.kind, token, entry.block_number),
                head_key(entry.kind, token),
                id,
            ));
        }

        (&self.refs, &self.entries, &self.index, &self.heads)
            .transaction(|(refs, entries, index, heads)| {
                if let Some(key) = &reference {
                    refs.insert(key.as_bytes(), payload.as_slice())?;
                }
                for (entry_key, index_key, head_key, id) in &writes {
                    entries.insert(entry_key.as_slice(), encoded.as_slice())?;
                    index.insert(index_key.as_slice(), id.as_bytes())?;
                    heads.insert(head_key.as_slice(), id.as_bytes())?;
                }
                Ok::<(), ConflictableTransactionError<ChainError>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => ChainError::Storage(e),
            })?;

        tracing::debug!(
            "Appended block {} ({:?}) for {} token(s)",
            block.hash(),
            block.transaction_type(),
            tokens.len()
        );
        Ok(())
    }

    /// Latest block of a token chain
    pub fn latest(&self, kind: TokenKind, token: &str) -> Result<Option<Block>, ChainError> {
        match self.heads.get(head_key(kind, token))? {
            Some(id) => {
                let id = ivec_to_string(&id)?;
                self.get(kind, token, &id)
            }
            None => Ok(None),
        }
    }

    /// Genesis block of a token chain
    pub fn first(&self, kind: TokenKind, token: &str) -> Result<Option<Block>, ChainError> {
        match self.index.scan_prefix(index_prefix(kind, token)).next() {
            Some(item) => {
                let (_, id) = item?;
                let id = ivec_to_string(&id)?;
                self.get(kind, token, &id)
            }
            None => Ok(None),
        }
    }

    /// Block by ID
    pub fn get(
        &self,
        kind: TokenKind,
        token: &str,
        block_id: &str,
    ) -> Result<Option<Block>, ChainError> {
        match self.entries.get(entry_key(kind, token, block_id))? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Forward page of a token chain
    ///
    /// Starts at `from_block_id` (inclusive, empty for genesis) and returns at
    /// most `limit` blocks plus the ID of the next block, empty when the page
    /// reaches the end of the chain.
    pub fn range(
        &self,
        kind: TokenKind,
        token: &str,
        from_block_id: &str,
        limit: usize,
    ) -> Result<(Vec<Block>, String), ChainError> {
        let prefix = index_prefix(kind, token);
        let start = if from_block_id.is_empty() {
            prefix.clone()
        } else {
            let number = parse_block_number(from_block_id)
                .ok_or_else(|| ChainError::ChainNotFound(from_block_id.to_string()))?;
            let key = index_key(kind, token, number);
            match self.index.get(&key)? {
                Some(id) if id.as_ref() == from_block_id.as_bytes() => key,
                _ => return Err(ChainError::ChainNotFound(from_block_id.to_string())),
            }
        };

        let limit = limit.max(1);
        let mut blocks = Vec::new();
        let mut next = String::new();
        for item in self.index.range(start..) {
            let (key, id) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = ivec_to_string(&id)?;
            if blocks.len() == limit {
                next = id;
                break;
            }
            let block = self
                .get(kind, token, &id)?
                .ok_or_else(|| ChainError::Corrupt(format!("index points at missing block {id}")))?;
            blocks.push(block);
        }
        Ok((blocks, next))
    }

    /// Whole chain of a token, genesis first
    pub fn blocks(&self, kind: TokenKind, token: &str) -> Result<Vec<Block>, ChainError> {
        let mut all = Vec::new();
        let mut cursor = String::new();
        loop {
            let (page, next) = self.range(kind, token, &cursor, DEFAULT_PAGE_SIZE)?;
            all.extend(page);
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        Ok(all)
    }

    /// Every token that has a chain of the given kind
    pub fn all_keys(&self, kind: TokenKind) -> Result<Vec<String>, ChainError> {
        let prefix = format!("{}-", kind.prefix());
        let mut keys = Vec::new();
        for item in self.heads.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key = ivec_to_string(&key)?;
            keys.push(key[prefix.len()..].to_string());
        }
        Ok(keys)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), ChainError> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Block, ChainError> {
        match bincode::deserialize::<StoredEntry>(bytes)? {
            StoredEntry::Inline(payload) => Ok(serde_json::from_slice(&payload)?),
            StoredEntry::Reference(key) => {
                let payload = self
                    .refs
                    .get(key.as_bytes())?
                    .ok_or_else(|| ChainError::Corrupt(format!("dangling reference {key}")))?;
                Ok(serde_json::from_slice(&payload)?)
            }
        }
    }
}

fn entry_key(kind: TokenKind, token: &str, block_id: &str) -> Vec<u8> {
    format!("{}-{}-{}", kind.prefix(), token, block_id).into_bytes()
}

fn head_key(kind: TokenKind, token: &str) -> Vec<u8> {
    format!("{}-{}", kind.prefix(), token).into_bytes()
}

/// Length prefixed so that one token's prefix never covers another token
fn index_prefix(kind: TokenKind, token: &str) -> Vec<u8> {
    format!("{}-{}:{}-", kind.prefix(), token.len(), token).into_bytes()
}

fn index_key(kind: TokenKind, token: &str, number: u64) -> Vec<u8> {
    let mut key = index_prefix(kind, token);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

fn reference_key(payload: &[u8], block_hash: &str) -> String {
    format!("rf-{}-{}", sha3_hex(payload), block_hash)
}

fn parse_block_number(block_id: &str) -> Option<u64> {
    block_id.split_once('-')?.0.parse().ok()
}

fn ivec_to_string(bytes: &[u8]) -> Result<String, ChainError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ChainError::Corrupt(e.to_string()))
}
