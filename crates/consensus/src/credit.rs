//! Quorum credit bookkeeping
//!
//! Each settled transfer hands its quorum signatures to the members that
//! signed; a member's score is the number of credits it has received.

use dashmap::DashMap;
use std::sync::Arc;
use token_chain::CreditSignature;

#[derive(Clone, Default)]
pub struct CreditStore {
    credits: Arc<DashMap<String, Vec<CreditSignature>>>,
}

impl CreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record credits for a hosted DID, ignoring duplicates
    pub fn store(&self, did: &str, credits: Vec<CreditSignature>) -> usize {
        let mut entry = self.credits.entry(did.to_string()).or_default();
        let mut added = 0;
        for credit in credits {
            if !entry.contains(&credit) {
                entry.push(credit);
                added += 1;
            }
        }
        added
    }

    pub fn score(&self, did: &str) -> usize {
        self.credits.get(did).map(|c| c.len()).unwrap_or(0)
    }
}
