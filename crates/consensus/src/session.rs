//! Per-request consensus sessions
//!
//! A [`ConsensusSession`] lives from the moment a transfer is dispatched until
//! it resolves. The store map sits behind one coarse lock; each session has
//! its own counters and a separate async pledge lock so pledge negotiation for
//! one request never blocks another.

use crate::error::ConsensusError;
use crate::pledge::PledgeState;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use token_chain::CreditSignature;

/// Progress of the per-peer tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

pub struct ConsensusSession {
    req_id: String,
    counters: Mutex<SessionCounters>,
    credits: Mutex<Vec<CreditSignature>>,
    /// DIDs that returned a valid signature
    signers: Mutex<BTreeSet<String>>,
    pub(crate) pledge: tokio::sync::Mutex<PledgeState>,
}

impl ConsensusSession {
    fn new(req_id: &str, required_pledge: usize) -> Self {
        Self {
            req_id: req_id.to_string(),
            counters: Mutex::new(SessionCounters::default()),
            credits: Mutex::new(Vec::new()),
            signers: Mutex::new(BTreeSet::new()),
            pledge: tokio::sync::Mutex::new(PledgeState::new(required_pledge)),
        }
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    /// A peer task was dispatched
    pub fn start_peer(&self) {
        self.counters.lock().running += 1;
    }

    /// A peer task resolved, with its credit on success
    pub fn finish_peer(&self, did: &str, credit: Option<CreditSignature>) -> SessionCounters {
        let mut counters = self.counters.lock();
        counters.running = counters.running.saturating_sub(1);
        match credit {
            Some(credit) => {
                if self.signers.lock().insert(did.to_string()) {
                    counters.success += 1;
                    self.credits.lock().push(credit);
                } else {
                    tracing::warn!("Duplicate signature from {} ignored", did);
                }
            }
            None => counters.failed += 1,
        }
        *counters
    }

    pub fn counters(&self) -> SessionCounters {
        *self.counters.lock()
    }

    /// Credits for the transfer block, one per signer
    pub fn credits(&self) -> Vec<CreditSignature> {
        self.credits.lock().clone()
    }

    pub fn signers(&self) -> Vec<String> {
        self.signers.lock().iter().cloned().collect()
    }
}

/// Live sessions keyed by request ID
#[derive(Default)]
pub struct ConsensusSessionStore {
    sessions: Mutex<HashMap<String, Arc<ConsensusSession>>>,
}

impl ConsensusSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        req_id: &str,
        required_pledge: usize,
    ) -> Result<Arc<ConsensusSession>, ConsensusError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(req_id) {
            return Err(ConsensusError::Configuration(format!(
                "request {req_id} is already in progress"
            )));
        }
        let session = Arc::new(ConsensusSession::new(req_id, required_pledge));
        sessions.insert(req_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, req_id: &str) -> Option<Arc<ConsensusSession>> {
        self.sessions.lock().get(req_id).cloned()
    }

    pub fn delete(&self, req_id: &str) {
        self.sessions.lock().remove(req_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
