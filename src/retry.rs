//! Retryable-write de-duplication ledger.
//!
//! Consulted by the command path before annotation: a resent request that is
//! recognized as a duplicate re-returns the original execution record and
//! never produces a second log entry, a second key, or a second pre-image.

use crate::record::{LogTimestamp, PreImageKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct RetryLedgerConfig {
    pub max_entries: usize,
}

impl Default for RetryLedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: 262_144,
        }
    }
}

/// Identity of one logical client operation, stable across resends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub session_id: u64,
    pub txn_number: u64,
}

/// What the original execution produced. Enough to answer a retry without
/// re-executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub ts: LogTimestamp,
    pub preimage_key: Option<PreImageKey>,
    pub before: Option<Value>,
}

#[derive(Debug)]
pub struct RetryLedger {
    config: RetryLedgerConfig,
    entries: HashMap<OperationId, ExecutionRecord>,
    order: VecDeque<OperationId>,
}

impl RetryLedger {
    pub fn new(config: RetryLedgerConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn is_duplicate_retry(&self, id: &OperationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn lookup(&self, id: &OperationId) -> Option<&ExecutionRecord> {
        self.entries.get(id)
    }

    /// Records the original execution. Returns false if the id was already
    /// present, in which case the existing record is kept unchanged.
    pub fn record(&mut self, id: OperationId, record: ExecutionRecord) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, record);
        self.order.push_back(id);
        self.evict();
        true
    }

    /// Drops records for executions at or below the pruned log position.
    pub fn prune_below(&mut self, ts: LogTimestamp) {
        let mut retained = VecDeque::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            let keep = self
                .entries
                .get(&id)
                .map(|record| record.ts > ts)
                .unwrap_or(false);
            if keep {
                retained.push_back(id);
            } else {
                self.entries.remove(&id);
            }
        }
        self.order = retained;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.config.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}
