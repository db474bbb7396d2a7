//! Marks log entries as pre-image-bearing and embeds the identity and
//! before-payload a replaying node needs to reconstruct the same record.

use crate::oplog::entry::{OpPayload, OplogEntry, WriteOp};
use crate::record::{CollectionId, DocumentId, LogTimestamp, PreImageKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation payload embedded in a log entry. Self-sufficient: replay uses
/// the embedded before-payload, never current collection state, which may
/// have diverged by replay time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreImageAnnotation {
    pub key: PreImageKey,
    pub collection: CollectionId,
    pub document_id: DocumentId,
    pub before: Value,
    pub op_wall_time_ms: u64,
}

/// Builds log entries for qualifying writes. The caller supplies the
/// before-state read under the same exclusivity scope as the mutation; a
/// `None` before-state (insert, non-qualifying op, capture disabled) yields
/// an unannotated entry.
#[derive(Debug, Default)]
pub struct LogEntryAnnotator;

impl LogEntryAnnotator {
    pub fn annotate_write(
        ts: LogTimestamp,
        wall_time_ms: u64,
        op: WriteOp,
        before: Option<Value>,
    ) -> OplogEntry {
        let annotations = match before {
            Some(before) if op.qualifies_for_preimage() => vec![PreImageAnnotation {
                key: PreImageKey::new(ts, 0),
                collection: op.collection(),
                document_id: op.document_id().clone(),
                before,
                op_wall_time_ms: wall_time_ms,
            }],
            _ => Vec::new(),
        };
        OplogEntry {
            ts,
            wall_time_ms,
            op: OpPayload::Write(op),
            annotations,
        }
    }

    /// Batched writes committed atomically under one timestamp. Each
    /// qualifying operation with a before-state receives a `batch_index`
    /// equal to its position in the batch, so annotation order always
    /// reflects the exact apply order within the batch.
    pub fn annotate_batch(
        ts: LogTimestamp,
        wall_time_ms: u64,
        ops: Vec<(WriteOp, Option<Value>)>,
    ) -> OplogEntry {
        let mut batch = Vec::with_capacity(ops.len());
        let mut annotations = Vec::new();
        for (index, (op, before)) in ops.into_iter().enumerate() {
            if let Some(before) = before {
                if op.qualifies_for_preimage() {
                    annotations.push(PreImageAnnotation {
                        key: PreImageKey::new(ts, index as u32),
                        collection: op.collection(),
                        document_id: op.document_id().clone(),
                        before,
                        op_wall_time_ms: wall_time_ms,
                    });
                }
            }
            batch.push(op);
        }
        OplogEntry {
            ts,
            wall_time_ms,
            op: OpPayload::ApplyOps(batch),
            annotations,
        }
    }
}
