//! Identity and payload model for stored pre-images.
//!
//! A pre-image key is derived from the log position of the write that
//! triggered capture, never from wall-clock time or a local counter, so every
//! node that replays the same log entry reconstructs the same key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Log sequence position of a committed write. Monotone in commit order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogTimestamp(pub u64);

impl LogTimestamp {
    pub fn next(self) -> Self {
        LogTimestamp(self.0 + 1)
    }
}

/// Stable identifier of a source collection. Survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub u64);

/// Primary-key value of a source document, rendered canonically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }
}

/// Composite pre-image identity, totally ordered by `(ts, batch_index)`.
///
/// `batch_index` disambiguates writes committed atomically within one log
/// entry and follows the order the operations were applied in that batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PreImageKey {
    pub ts: LogTimestamp,
    pub batch_index: u32,
}

impl PreImageKey {
    pub fn new(ts: LogTimestamp, batch_index: u32) -> Self {
        Self { ts, batch_index }
    }
}

/// One stored pre-image. Created exactly once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImageRecord {
    pub key: PreImageKey,
    pub collection: CollectionId,
    pub document_id: DocumentId,
    /// Full document state immediately before the triggering mutation.
    pub payload: Value,
    /// Logical operation time, consumed by the external retention policy.
    pub op_wall_time_ms: u64,
}
