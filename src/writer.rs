//! Pre-image writer: stages one store insert into the caller's atomic unit.

use crate::oplog::PreImageAnnotation;
use crate::record::PreImageRecord;
use crate::resync::ResyncGate;
use crate::telemetry::{MetricsRegistry, COUNTER_PREIMAGES_SKIPPED_GATE};
use log::debug;

/// Outcome of a capture attempt. `Skipped` is a normal, expected result
/// while the owning node is resynchronizing, never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The record was staged; it becomes durable when the unit commits.
    Committed,
    /// The resync gate is closed; nothing was staged.
    Skipped,
}

#[derive(Debug)]
pub struct PreImageWriter {
    gate: ResyncGate,
}

impl PreImageWriter {
    pub fn new(gate: ResyncGate) -> Self {
        Self { gate }
    }

    /// Stages the pre-image described by `annotation` into `unit`. Must be
    /// called from within the unit that also carries the data mutation and
    /// the log append; the annotation's before-payload was read under that
    /// unit's exclusivity scope. Idempotence for re-presented keys is
    /// resolved at commit by the store.
    pub fn capture(
        &self,
        unit: &mut crate::unit::AtomicUnit,
        annotation: &PreImageAnnotation,
        metrics: &mut MetricsRegistry,
    ) -> CaptureOutcome {
        if !self.gate.is_open() {
            debug!(
                "event=preimage_capture_skipped ts={} batch_index={} collection={}",
                annotation.key.ts.0, annotation.key.batch_index, annotation.collection.0
            );
            metrics.increment_counter(COUNTER_PREIMAGES_SKIPPED_GATE);
            return CaptureOutcome::Skipped;
        }
        unit.stage_preimage(PreImageRecord {
            key: annotation.key,
            collection: annotation.collection,
            document_id: annotation.document_id.clone(),
            payload: annotation.before.clone(),
            op_wall_time_ms: annotation.op_wall_time_ms,
        });
        CaptureOutcome::Committed
    }
}
