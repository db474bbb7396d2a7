//! Scoped atomic unit.
//!
//! The data mutation, its log append, and its pre-image insert are staged
//! into one unit and become durable together at commit or vanish together at
//! abort. Components receive the unit as a parameter; none opens its own,
//! which makes the commit-together requirement structural rather than a
//! convention.

use crate::catalog::{CatalogError, CollectionCatalog, Document};
use crate::oplog::{DurableOplog, OplogEntry, WalError};
use crate::record::{CollectionId, DocumentId, LogTimestamp, PreImageRecord};
use crate::store::{InsertOutcome, PreImageStore};
use crate::telemetry::{
    MetricsRegistry, COUNTER_PREIMAGES_DUPLICATE, COUNTER_PREIMAGES_WRITTEN,
};
use log::debug;
use thiserror::Error;

#[derive(Debug)]
enum StagedOp {
    LogAppend(OplogEntry),
    Upsert {
        collection: CollectionId,
        document: Document,
    },
    Remove {
        collection: CollectionId,
        document_id: DocumentId,
    },
    PreImage(PreImageRecord),
}

#[derive(Debug, Default)]
pub struct AtomicUnit {
    staged: Vec<StagedOp>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitSummary {
    pub appended: Option<LogTimestamp>,
    pub preimages_written: u32,
    pub preimages_duplicate: u32,
}

impl AtomicUnit {
    pub fn begin() -> Self {
        Self::default()
    }

    pub fn stage_log_append(&mut self, entry: OplogEntry) {
        self.staged.push(StagedOp::LogAppend(entry));
    }

    pub fn stage_upsert(&mut self, collection: CollectionId, document: Document) {
        self.staged.push(StagedOp::Upsert {
            collection,
            document,
        });
    }

    pub fn stage_remove(&mut self, collection: CollectionId, document_id: DocumentId) {
        self.staged.push(StagedOp::Remove {
            collection,
            document_id,
        });
    }

    pub fn stage_preimage(&mut self, record: PreImageRecord) {
        self.staged.push(StagedOp::PreImage(record));
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn staged_preimages(&self) -> usize {
        self.staged
            .iter()
            .filter(|op| matches!(op, StagedOp::PreImage(_)))
            .count()
    }

    /// Commits the unit. The log append is the durability point: it happens
    /// first, and the remaining in-memory applications are infallible apart
    /// from the benign duplicate pre-image, so a crash after the append is
    /// repaired by log replay. Collection identities must be validated by
    /// the caller before staging.
    pub fn commit(
        self,
        catalog: &mut CollectionCatalog,
        store: &mut PreImageStore,
        oplog: &mut DurableOplog,
        metrics: &mut MetricsRegistry,
    ) -> Result<CommitSummary, CommitError> {
        let mut summary = CommitSummary::default();
        for op in &self.staged {
            if let StagedOp::LogAppend(entry) = op {
                oplog.append(entry)?;
                summary.appended = Some(entry.ts);
            }
        }
        for op in self.staged {
            match op {
                StagedOp::LogAppend(_) => {}
                StagedOp::Upsert {
                    collection,
                    document,
                } => {
                    catalog.get_mut(collection)?.upsert(document);
                }
                StagedOp::Remove {
                    collection,
                    document_id,
                } => {
                    catalog.get_mut(collection)?.remove(&document_id);
                }
                StagedOp::PreImage(record) => match store.insert(record) {
                    InsertOutcome::Inserted => {
                        summary.preimages_written += 1;
                        metrics.increment_counter(COUNTER_PREIMAGES_WRITTEN);
                    }
                    InsertOutcome::DuplicateKey => {
                        summary.preimages_duplicate += 1;
                        metrics.increment_counter(COUNTER_PREIMAGES_DUPLICATE);
                    }
                },
            }
        }
        Ok(summary)
    }

    /// Drops every staged operation with no observable effect.
    pub fn abort(self) {
        debug!("event=unit_aborted staged_ops={}", self.staged.len());
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
