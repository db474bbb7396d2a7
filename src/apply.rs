//! Replay applier: consumes the log stream on any node and applies each
//! entry as one atomic local unit.
//!
//! The same applier runs on a primary applying its own writes, on a
//! secondary applying received entries, and on a recovering node replaying
//! the durable log. For annotated entries it invokes the pre-image writer
//! with data decoded from the entry itself, never from current collection
//! state, which is what makes the resulting records byte-identical across
//! nodes.

use crate::catalog::{CatalogError, CollectionCatalog, Document};
use crate::oplog::{DurableOplog, OplogEntry, WriteOp};
use crate::record::LogTimestamp;
use crate::store::PreImageStore;
use crate::telemetry::{MetricsRegistry, COUNTER_OPLOG_ANNOTATED, GAUGE_LAST_APPLIED_TS};
use crate::unit::{AtomicUnit, CommitError};
use crate::writer::{CaptureOutcome, PreImageWriter};
use log::error;
use thiserror::Error;

/// Mutable node surfaces one apply step needs. Borrowed per call so the
/// applier itself holds no references into node state.
pub struct ApplyContext<'a> {
    pub catalog: &'a mut CollectionCatalog,
    pub store: &'a mut PreImageStore,
    pub oplog: &'a mut DurableOplog,
    pub writer: &'a PreImageWriter,
    pub metrics: &'a mut MetricsRegistry,
}

/// Whether the entry still needs to be appended to the local durable log.
/// Entries arriving over replication do; entries read back from the local
/// log during recovery are durable already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDurability {
    NeedsAppend,
    AlreadyDurable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReceipt {
    pub ts: LogTimestamp,
    pub preimages_written: u32,
    pub preimages_skipped: u32,
    pub preimages_duplicate: u32,
}

#[derive(Debug, Default)]
pub struct ReplayApplier {
    last_applied: Option<LogTimestamp>,
}

impl ReplayApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applier that considers everything at or below `position` already
    /// applied, as after a data copy that reflects the source up to there.
    pub fn with_position(position: LogTimestamp) -> Self {
        Self {
            last_applied: Some(position),
        }
    }

    pub fn last_applied(&self) -> Option<LogTimestamp> {
        self.last_applied
    }

    /// Applies one entry: data mutation, then pre-image capture for each
    /// annotation, all staged into a single unit and committed once. Errors
    /// are fatal to replay; the caller must not continue past one.
    pub fn apply_entry(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        entry: &OplogEntry,
        durability: EntryDurability,
    ) -> Result<ApplyReceipt, ReplayError> {
        if let Some(last) = self.last_applied {
            if entry.ts <= last {
                return Err(ReplayError::OutOfOrder {
                    last: last.0,
                    got: entry.ts.0,
                });
            }
        }
        validate_annotations(entry)?;
        for op in entry.op.ops() {
            // Unknown identity means the node missed a catalog event, which
            // is as fatal as a missed pre-image.
            ctx.catalog.get(op.collection())?;
        }

        let mut unit = AtomicUnit::begin();
        if durability == EntryDurability::NeedsAppend {
            unit.stage_log_append(entry.clone());
        }
        for op in entry.op.ops() {
            stage_mutation(&mut unit, op);
        }
        let mut skipped = 0u32;
        for annotation in &entry.annotations {
            if ctx.writer.capture(&mut unit, annotation, ctx.metrics) == CaptureOutcome::Skipped {
                skipped += 1;
            }
        }
        let summary = unit.commit(ctx.catalog, ctx.store, ctx.oplog, ctx.metrics)?;

        self.last_applied = Some(entry.ts);
        ctx.metrics.set_gauge(GAUGE_LAST_APPLIED_TS, entry.ts.0);
        if entry.is_annotated() {
            ctx.metrics.increment_counter(COUNTER_OPLOG_ANNOTATED);
        }
        Ok(ApplyReceipt {
            ts: entry.ts,
            preimages_written: summary.preimages_written,
            preimages_skipped: skipped,
            preimages_duplicate: summary.preimages_duplicate,
        })
    }

    /// Applies a batch of entries in order, halting at the first error.
    pub fn apply_stream(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        entries: &[OplogEntry],
        durability: EntryDurability,
    ) -> Result<Vec<ApplyReceipt>, ReplayError> {
        let mut receipts = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.apply_entry(ctx, entry, durability) {
                Ok(receipt) => receipts.push(receipt),
                Err(err) => {
                    error!(
                        "event=replay_halted ts={} applied={} error={}",
                        entry.ts.0,
                        receipts.len(),
                        err
                    );
                    return Err(err);
                }
            }
        }
        Ok(receipts)
    }
}

fn stage_mutation(unit: &mut AtomicUnit, op: &WriteOp) {
    match op {
        WriteOp::Insert {
            collection,
            document,
        } => unit.stage_upsert(*collection, document.clone()),
        WriteOp::Update {
            collection,
            document_id,
            post,
        } => unit.stage_upsert(
            *collection,
            Document {
                id: document_id.clone(),
                body: post.clone(),
            },
        ),
        WriteOp::Delete {
            collection,
            document_id,
        } => unit.stage_remove(*collection, document_id.clone()),
    }
}

/// Structural checks on annotated entries. A violation means the entry was
/// malformed at the source or corrupted in flight, and a node must never
/// silently drop a pre-image it was supposed to produce.
fn validate_annotations(entry: &OplogEntry) -> Result<(), ReplayError> {
    let op_count = entry.op.ops().len() as u32;
    let mut previous_index: Option<u32> = None;
    for annotation in &entry.annotations {
        if annotation.key.ts != entry.ts {
            return Err(ReplayError::AnnotationKeyMismatch {
                entry_ts: entry.ts.0,
                key_ts: annotation.key.ts.0,
            });
        }
        if annotation.key.batch_index >= op_count {
            return Err(ReplayError::AnnotationIndexRange {
                ts: entry.ts.0,
                batch_index: annotation.key.batch_index,
                ops: op_count,
            });
        }
        if let Some(previous) = previous_index {
            if annotation.key.batch_index <= previous {
                return Err(ReplayError::AnnotationIndexOrder { ts: entry.ts.0 });
            }
        }
        previous_index = Some(annotation.key.batch_index);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("log entry ts {got} not after last applied ts {last}")]
    OutOfOrder { last: u64, got: u64 },
    #[error("annotation key ts {key_ts} does not match entry ts {entry_ts}")]
    AnnotationKeyMismatch { entry_ts: u64, key_ts: u64 },
    #[error("annotation batch_index {batch_index} out of range for {ops} ops at ts {ts}")]
    AnnotationIndexRange { ts: u64, batch_index: u32, ops: u32 },
    #[error("annotation batch indices out of order at ts {ts}")]
    AnnotationIndexOrder { ts: u64 },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}
