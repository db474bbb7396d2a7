//! Node integration: the primary write path, the secondary replication
//! path, crash recovery, and the resynchronization hand-off.
//!
//! A primary routes its own writes through the same [`ReplayApplier`] that
//! secondaries use, so the pre-image records it produces are derived from
//! the log entry exactly as they will be on every other node.

use crate::apply::{ApplyContext, ApplyReceipt, EntryDurability, ReplayApplier, ReplayError};
use crate::catalog::{CatalogError, CollectionCatalog, Document};
use crate::oplog::{DurableOplog, LogEntryAnnotator, OplogEntry, WalError, WriteOp};
use crate::record::{CollectionId, DocumentId, LogTimestamp, PreImageKey, PreImageRecord};
use crate::resync::{NodeMode, ReplicationStateMachine, TransitionError, TransitionObserver};
use crate::retry::{ExecutionRecord, OperationId, RetryLedger, RetryLedgerConfig};
use crate::store::{PreImageStore, StoreError};
use crate::telemetry::{
    MetricsRegistry, COUNTER_RETRY_SUPPRESSED, GAUGE_RECOVERY_REPLAYED, GAUGE_STORE_RECORDS,
};
use crate::writer::PreImageWriter;
use log::info;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub oplog_path: PathBuf,
    pub retry: RetryLedgerConfig,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, oplog_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            oplog_path: oplog_path.into(),
            retry: RetryLedgerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub ts: LogTimestamp,
    pub preimage_key: Option<PreImageKey>,
    pub before: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindAndModifyOutcome {
    pub ts: LogTimestamp,
    pub before: Option<Value>,
    /// False when the call was recognized as a retry and answered from the
    /// ledger without re-execution.
    pub first_execution: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverySummary {
    pub replayed_entries: u64,
    pub preimages_written: u64,
    pub preimages_duplicate: u64,
    pub truncated_bytes: u64,
}

#[derive(Debug)]
pub struct Node {
    name: String,
    catalog: CollectionCatalog,
    store: PreImageStore,
    oplog: DurableOplog,
    machine: ReplicationStateMachine,
    writer: PreImageWriter,
    applier: ReplayApplier,
    retry: RetryLedger,
    metrics: MetricsRegistry,
    /// Log position the data copy reflects; set by `import_data_copy`,
    /// consumed by `finish_data_copy`.
    copy_reflects: Option<LogTimestamp>,
}

impl Node {
    fn open(config: NodeConfig, initial_mode: NodeMode) -> Result<Self, NodeError> {
        let oplog = DurableOplog::open(&config.oplog_path)?;
        let machine = ReplicationStateMachine::new(initial_mode);
        let writer = PreImageWriter::new(machine.gate());
        info!(
            "event=node_opened name={} mode={} last_appended={:?}",
            config.name,
            initial_mode,
            oplog.last_appended().map(|ts| ts.0)
        );
        Ok(Self {
            name: config.name.clone(),
            catalog: CollectionCatalog::new(),
            store: PreImageStore::new(),
            oplog,
            machine,
            writer,
            applier: ReplayApplier::new(),
            retry: RetryLedger::new(config.retry),
            metrics: MetricsRegistry::new(format!("retrolog.{}", config.name)),
            copy_reflects: None,
        })
    }

    /// A node born as primary, immediately in steady-state.
    pub fn primary(config: NodeConfig) -> Result<Self, NodeError> {
        Self::open(config, NodeMode::SteadyReplay)
    }

    /// A node joining the cluster via full-data resynchronization.
    pub fn joining(config: NodeConfig) -> Result<Self, NodeError> {
        Self::open(config, NodeMode::CopyingData)
    }

    /// A node restarting after a crash. Call [`Self::recover_from`] before
    /// serving.
    pub fn restart(config: NodeConfig) -> Result<Self, NodeError> {
        Self::open(config, NodeMode::Recovering)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> NodeMode {
        self.machine.mode()
    }

    pub fn store(&self) -> &PreImageStore {
        &self.store
    }

    pub fn catalog(&self) -> &CollectionCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn last_applied(&self) -> Option<LogTimestamp> {
        self.applier.last_applied()
    }

    pub fn last_appended(&self) -> Option<LogTimestamp> {
        self.oplog.last_appended()
    }

    /// Durable entries with ts strictly greater than `from`, in commit
    /// order. This is the stream the replication transport ships to peers.
    pub fn entries_after(&mut self, from: LogTimestamp) -> Result<Vec<OplogEntry>, NodeError> {
        Ok(self.oplog.replay_from(from)?.entries)
    }

    pub fn subscribe_transitions(&mut self, observer: TransitionObserver) {
        self.machine.subscribe(observer);
    }

    // ---- catalog administration -------------------------------------------

    pub fn create_collection(
        &mut self,
        name: impl Into<String>,
        preimages_enabled: bool,
    ) -> CollectionId {
        self.catalog.create(name, preimages_enabled)
    }

    pub fn register_collection(
        &mut self,
        id: CollectionId,
        name: impl Into<String>,
        preimages_enabled: bool,
    ) -> Result<(), NodeError> {
        self.catalog.register(id, name, preimages_enabled)?;
        Ok(())
    }

    pub fn set_preimages_enabled(
        &mut self,
        id: CollectionId,
        enabled: bool,
    ) -> Result<(), NodeError> {
        self.catalog.set_preimages_enabled(id, enabled)?;
        Ok(())
    }

    pub fn rename_collection(
        &mut self,
        id: CollectionId,
        name: impl Into<String>,
    ) -> Result<(), NodeError> {
        self.catalog.rename(id, name)?;
        Ok(())
    }

    /// Drops a collection and every pre-image recorded for it.
    pub fn drop_collection(&mut self, id: CollectionId) -> Result<usize, NodeError> {
        self.catalog.drop(id)?;
        let removed = self.store.drop_collection(id);
        self.metrics
            .set_gauge(GAUGE_STORE_RECORDS, self.store.len() as u64);
        Ok(removed)
    }

    // ---- change-stream read surface ---------------------------------------

    pub fn query_preimages<R>(&self, collection: CollectionId, range: R) -> Vec<PreImageRecord>
    where
        R: RangeBounds<PreImageKey>,
    {
        self.store.query(collection, range)
    }

    pub fn preimage_digest(&self) -> Result<[u8; 32], NodeError> {
        Ok(self.store.digest()?)
    }

    // ---- primary write path -----------------------------------------------

    pub fn insert(
        &mut self,
        collection: CollectionId,
        document: Document,
    ) -> Result<WriteReceipt, NodeError> {
        self.execute_write(WriteOp::Insert {
            collection,
            document,
        })
    }

    pub fn update(
        &mut self,
        collection: CollectionId,
        document_id: DocumentId,
        post: Value,
    ) -> Result<WriteReceipt, NodeError> {
        self.execute_write(WriteOp::Update {
            collection,
            document_id,
            post,
        })
    }

    pub fn delete(
        &mut self,
        collection: CollectionId,
        document_id: DocumentId,
    ) -> Result<WriteReceipt, NodeError> {
        self.execute_write(WriteOp::Delete {
            collection,
            document_id,
        })
    }

    /// Retry-safe update returning the before-state. A resent attempt that
    /// is recognized as a duplicate re-returns the original execution's
    /// outcome and produces no new log entry and no new pre-image, even if
    /// collection state has changed between attempts.
    pub fn find_and_modify(
        &mut self,
        op_id: OperationId,
        collection: CollectionId,
        document_id: DocumentId,
        post: Value,
    ) -> Result<FindAndModifyOutcome, NodeError> {
        if let Some(original) = self.retry.lookup(&op_id).cloned() {
            self.metrics.increment_counter(COUNTER_RETRY_SUPPRESSED);
            info!(
                "event=retryable_write_deduplicated name={} session_id={} txn_number={} ts={}",
                self.name, op_id.session_id, op_id.txn_number, original.ts.0
            );
            return Ok(FindAndModifyOutcome {
                ts: original.ts,
                before: original.before,
                first_execution: false,
            });
        }
        let receipt = self.execute_write(WriteOp::Update {
            collection,
            document_id,
            post,
        })?;
        self.retry.record(
            op_id,
            ExecutionRecord {
                ts: receipt.ts,
                preimage_key: receipt.preimage_key,
                before: receipt.before.clone(),
            },
        );
        Ok(FindAndModifyOutcome {
            ts: receipt.ts,
            before: receipt.before,
            first_execution: true,
        })
    }

    /// Executes a multi-statement batch atomically under one log timestamp.
    /// Annotation batch indices follow the exact apply order within the
    /// batch.
    pub fn apply_ops(&mut self, ops: Vec<WriteOp>) -> Result<WriteReceipt, NodeError> {
        self.ensure_writable()?;
        // Before-states are computed against an overlay so that an earlier
        // op in the batch is observed by a later op on the same document.
        let mut overlay: HashMap<(CollectionId, DocumentId), Option<Value>> = HashMap::new();
        let mut annotated_ops = Vec::with_capacity(ops.len());
        for op in ops {
            let before = self.before_state_with_overlay(&op, &overlay)?;
            let effect = match &op {
                WriteOp::Insert { document, .. } => Some(document.body.clone()),
                WriteOp::Update { post, .. } => Some(post.clone()),
                WriteOp::Delete { .. } => None,
            };
            overlay.insert((op.collection(), op.document_id().clone()), effect);
            annotated_ops.push((op, before));
        }
        let ts = self.oplog.reserve_slots(1)[0];
        let entry = LogEntryAnnotator::annotate_batch(ts, current_time_ms(), annotated_ops);
        let preimage_key = entry.annotations.first().map(|annotation| annotation.key);
        self.apply_locally(&entry, EntryDurability::NeedsAppend)?;
        Ok(WriteReceipt {
            ts,
            preimage_key,
            before: None,
        })
    }

    fn execute_write(&mut self, op: WriteOp) -> Result<WriteReceipt, NodeError> {
        self.ensure_writable()?;
        // The before-state is read and the mutation applied under the same
        // `&mut self` exclusivity scope, so no concurrent writer can slip
        // between the read and the mutation.
        let before = self.before_state_with_overlay(&op, &HashMap::new())?;
        let ts = self.oplog.reserve_slots(1)[0];
        let entry = LogEntryAnnotator::annotate_write(ts, current_time_ms(), op, before.clone());
        let preimage_key = entry.annotations.first().map(|annotation| annotation.key);
        self.apply_locally(&entry, EntryDurability::NeedsAppend)?;
        Ok(WriteReceipt {
            ts,
            preimage_key,
            before,
        })
    }

    fn ensure_writable(&self) -> Result<(), NodeError> {
        let mode = self.machine.mode();
        if mode != NodeMode::SteadyReplay {
            return Err(NodeError::NotWritable { mode });
        }
        Ok(())
    }

    /// Before-state for a qualifying write, or `None` when the op does not
    /// qualify or the collection does not record pre-images. A missing
    /// target document is an error on the primary path.
    fn before_state_with_overlay(
        &self,
        op: &WriteOp,
        overlay: &HashMap<(CollectionId, DocumentId), Option<Value>>,
    ) -> Result<Option<Value>, NodeError> {
        let collection = self.catalog.get(op.collection())?;
        if !op.qualifies_for_preimage() {
            return Ok(None);
        }
        let key = (op.collection(), op.document_id().clone());
        let current = match overlay.get(&key) {
            Some(effect) => effect.clone(),
            None => collection.get(op.document_id()).map(|doc| doc.body.clone()),
        };
        let current = current.ok_or_else(|| NodeError::DocumentNotFound {
            collection: op.collection(),
            document_id: op.document_id().clone(),
        })?;
        if collection.preimages_enabled() {
            Ok(Some(current))
        } else {
            Ok(None)
        }
    }

    fn apply_locally(
        &mut self,
        entry: &OplogEntry,
        durability: EntryDurability,
    ) -> Result<ApplyReceipt, NodeError> {
        let Self {
            catalog,
            store,
            oplog,
            writer,
            metrics,
            applier,
            ..
        } = self;
        let mut ctx = ApplyContext {
            catalog,
            store,
            oplog,
            writer,
            metrics,
        };
        let receipt = applier.apply_entry(&mut ctx, entry, durability)?;
        self.metrics
            .set_gauge(GAUGE_STORE_RECORDS, self.store.len() as u64);
        Ok(receipt)
    }

    // ---- secondary replication path ---------------------------------------

    /// Applies entries received from the log stream, in order. Accepted
    /// while catching up (gate closed, pre-images suppressed) and in steady
    /// replay (gate open).
    pub fn replicate(&mut self, entries: &[OplogEntry]) -> Result<Vec<ApplyReceipt>, NodeError> {
        let mode = self.machine.mode();
        if !matches!(mode, NodeMode::CatchingUpOnLog | NodeMode::SteadyReplay) {
            return Err(NodeError::ReplicationForbidden { mode });
        }
        let mut receipts = Vec::with_capacity(entries.len());
        for entry in entries {
            receipts.push(self.apply_locally(entry, EntryDurability::NeedsAppend)?);
        }
        Ok(receipts)
    }

    // ---- resynchronization ------------------------------------------------

    /// Re-enters full-data resynchronization, discarding local collection
    /// state and pre-images. Historical records are not re-derived; the node
    /// restarts with what the data copy provides.
    pub fn begin_resync(&mut self) -> Result<(), NodeError> {
        self.machine.transition(NodeMode::CopyingData)?;
        self.catalog = CollectionCatalog::new();
        self.store = PreImageStore::new();
        self.applier = ReplayApplier::new();
        self.copy_reflects = None;
        self.metrics.set_gauge(GAUGE_STORE_RECORDS, 0);
        Ok(())
    }

    /// The data-copy hand-off: clones the source's current collection state
    /// (never its pre-image store) and records the log position the copy
    /// reflects. Historical pre-images are deliberately not invented for
    /// writes this node did not replay.
    pub fn import_data_copy(&mut self, source: &Node) -> Result<(), NodeError> {
        if self.machine.mode() != NodeMode::CopyingData {
            return Err(NodeError::NotCopyingData {
                mode: self.machine.mode(),
            });
        }
        for id in source.catalog.ids() {
            let collection = source.catalog.get(id)?;
            self.catalog
                .register(id, collection.name(), collection.preimages_enabled())?;
            for document in collection.documents() {
                self.catalog.get_mut(id)?.upsert(document.clone());
            }
        }
        self.copy_reflects = source.oplog.last_appended();
        info!(
            "event=data_copy_imported name={} source={} reflects_ts={:?}",
            self.name,
            source.name,
            self.copy_reflects.map(|ts| ts.0)
        );
        Ok(())
    }

    /// Data copy complete: start replaying the log from the position the
    /// copy reflects. The gate stays closed through catch-up.
    pub fn finish_data_copy(&mut self) -> Result<(), NodeError> {
        self.machine.transition(NodeMode::CatchingUpOnLog)?;
        self.applier = ReplayApplier::with_position(self.copy_reflects.unwrap_or_default());
        Ok(())
    }

    /// Catch-up complete: the gate opens and every annotated entry from here
    /// on produces a pre-image.
    pub fn finish_catch_up(&mut self) -> Result<(), NodeError> {
        self.machine.transition(NodeMode::SteadyReplay)?;
        Ok(())
    }

    // ---- crash recovery ---------------------------------------------------

    /// Replays the durable log from `checkpoint` forward, regenerating any
    /// pre-image records lost since the last checkpoint, then enters steady
    /// replay. Re-presented keys resolve as no-ops.
    pub fn recover_from(&mut self, checkpoint: LogTimestamp) -> Result<RecoverySummary, NodeError> {
        if self.machine.mode() != NodeMode::Recovering {
            return Err(NodeError::NotRecovering {
                mode: self.machine.mode(),
            });
        }
        let replay = self.oplog.replay_from(checkpoint)?;
        let mut summary = RecoverySummary::default();
        if let Some(truncation) = &replay.truncation {
            summary.truncated_bytes = truncation.truncated_bytes;
            self.oplog.enforce_truncation(truncation)?;
        }
        self.applier = ReplayApplier::with_position(checkpoint);
        for entry in &replay.entries {
            let receipt = self.apply_locally(entry, EntryDurability::AlreadyDurable)?;
            summary.replayed_entries += 1;
            summary.preimages_written += u64::from(receipt.preimages_written);
            summary.preimages_duplicate += u64::from(receipt.preimages_duplicate);
        }
        self.metrics
            .set_gauge(GAUGE_RECOVERY_REPLAYED, summary.replayed_entries);
        info!(
            "event=recovery_complete name={} replayed={} preimages_written={} truncated_bytes={}",
            self.name, summary.replayed_entries, summary.preimages_written, summary.truncated_bytes
        );
        self.machine.transition(NodeMode::SteadyReplay)?;
        Ok(summary)
    }

    pub fn recover(&mut self) -> Result<RecoverySummary, NodeError> {
        self.recover_from(LogTimestamp(0))
    }
}

fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is not writable in mode {mode}")]
    NotWritable { mode: NodeMode },
    #[error("replication not accepted in mode {mode}")]
    ReplicationForbidden { mode: NodeMode },
    #[error("recovery requires recovering mode, node is in {mode}")]
    NotRecovering { mode: NodeMode },
    #[error("data copy requires copying_data mode, node is in {mode}")]
    NotCopyingData { mode: NodeMode },
    #[error("document {document_id:?} not found in collection {}", collection.0)]
    DocumentNotFound {
        collection: CollectionId,
        document_id: DocumentId,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
