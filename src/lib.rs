//! Change-stream pre-image store.
//!
//! Captures, persists, replicates, and recovers the before-state of
//! documents affected by updates and deletes, so change-stream consumers can
//! reconstruct full before/after history without re-reading the primary
//! collection. Pre-image identity is always derived from the log entry that
//! carried the write, which makes the store's contents deterministic across
//! every node that replays the same log prefix.

pub mod apply;
pub mod catalog;
pub mod node;
pub mod oplog;
pub mod record;
pub mod resync;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod unit;
pub mod writer;

pub use apply::{ApplyContext, ApplyReceipt, EntryDurability, ReplayApplier, ReplayError};
pub use catalog::{CatalogError, Collection, CollectionCatalog, Document};
pub use node::{
    FindAndModifyOutcome, Node, NodeConfig, NodeError, RecoverySummary, WriteReceipt,
};
pub use oplog::{
    DurableOplog, EntryDecodeError, FrameError, LogEntryAnnotator, LogFrame, OpPayload,
    OplogEntry, PreImageAnnotation, TailTruncation, WalError, WalReplay, WriteOp,
};
pub use record::{CollectionId, DocumentId, LogTimestamp, PreImageKey, PreImageRecord};
pub use resync::{
    NodeMode, ReplicationStateMachine, ResyncGate, TransitionError, TransitionObserver,
};
pub use retry::{ExecutionRecord, OperationId, RetryLedger, RetryLedgerConfig};
pub use store::{InsertOutcome, PreImageStore, StoreError};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
pub use unit::{AtomicUnit, CommitError, CommitSummary};
pub use writer::{CaptureOutcome, PreImageWriter};
