use crate::catalog::Document;
use crate::oplog::annotation::PreImageAnnotation;
use crate::record::{CollectionId, DocumentId, LogTimestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One logical document write carried by a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Insert {
        collection: CollectionId,
        document: Document,
    },
    /// Carries the full post-state so replay is deterministic without
    /// re-reading local state.
    Update {
        collection: CollectionId,
        document_id: DocumentId,
        post: Value,
    },
    Delete {
        collection: CollectionId,
        document_id: DocumentId,
    },
}

impl WriteOp {
    pub fn collection(&self) -> CollectionId {
        match self {
            WriteOp::Insert { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => *collection,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        match self {
            WriteOp::Insert { document, .. } => &document.id,
            WriteOp::Update { document_id, .. } | WriteOp::Delete { document_id, .. } => {
                document_id
            }
        }
    }

    /// Updates and deletes qualify for pre-image capture; inserts have no
    /// before-state by definition.
    pub fn qualifies_for_preimage(&self) -> bool {
        matches!(self, WriteOp::Update { .. } | WriteOp::Delete { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    Write(WriteOp),
    /// Multi-statement batch committed atomically under a single timestamp.
    ApplyOps(Vec<WriteOp>),
}

impl OpPayload {
    pub fn ops(&self) -> &[WriteOp] {
        match self {
            OpPayload::Write(op) => std::slice::from_ref(op),
            OpPayload::ApplyOps(ops) => ops,
        }
    }
}

/// One committed log entry, replicated verbatim and replayed on every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: LogTimestamp,
    pub wall_time_ms: u64,
    pub op: OpPayload,
    /// Pre-image annotations in batch order. Empty for non-qualifying writes
    /// and for entries produced while capture was disabled at the source.
    pub annotations: Vec<PreImageAnnotation>,
}

impl OplogEntry {
    pub fn is_annotated(&self) -> bool {
        !self.annotations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_ops_flattens_single_and_batch() {
        let op = WriteOp::Delete {
            collection: CollectionId(1),
            document_id: DocumentId::new("a"),
        };
        assert_eq!(OpPayload::Write(op.clone()).ops().len(), 1);
        assert_eq!(OpPayload::ApplyOps(vec![op.clone(), op]).ops().len(), 2);
    }

    #[test]
    fn only_updates_and_deletes_qualify() {
        let insert = WriteOp::Insert {
            collection: CollectionId(1),
            document: Document {
                id: DocumentId::new("a"),
                body: json!({"_id": "a"}),
            },
        };
        assert!(!insert.qualifies_for_preimage());
        let delete = WriteOp::Delete {
            collection: CollectionId(1),
            document_id: DocumentId::new("a"),
        };
        assert!(delete.qualifies_for_preimage());
    }
}
