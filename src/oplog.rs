//! Log-entry model, pre-image annotation, and the durable log surface.
//!
//! The log entry is self-sufficient: an annotated entry carries the
//! before-payload itself, so a replaying node never re-reads current
//! collection state to reconstruct a pre-image.

pub mod annotation;
pub mod entry;
pub mod frame;
pub mod wal;

pub use annotation::{LogEntryAnnotator, PreImageAnnotation};
pub use entry::{OpPayload, OplogEntry, WriteOp};
pub use frame::{EntryDecodeError, FrameError, LogFrame};
pub use wal::{DurableOplog, TailTruncation, WalError, WalReplay};
