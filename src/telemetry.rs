//! In-process metrics registry for the capture and replay paths.

use serde::Serialize;
use std::collections::HashMap;

pub const COUNTER_PREIMAGES_WRITTEN: &str = "preimages.written";
pub const COUNTER_PREIMAGES_SKIPPED_GATE: &str = "preimages.skipped_gate";
pub const COUNTER_PREIMAGES_DUPLICATE: &str = "preimages.duplicate_inserts";
pub const COUNTER_OPLOG_ANNOTATED: &str = "oplog.annotated_entries";
pub const COUNTER_RETRY_SUPPRESSED: &str = "retry.duplicates_suppressed";
pub const GAUGE_STORE_RECORDS: &str = "store.records";
pub const GAUGE_LAST_APPLIED_TS: &str = "apply.last_applied_ts";
pub const GAUGE_RECOVERY_REPLAYED: &str = "recovery.replayed_entries";

#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }

    pub fn increment_counter(&mut self, name: &str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&mut self, name: &str, delta: u64) {
        let key = self.qualified(name);
        let entry = self.counters.entry(key).or_insert(0);
        *entry = entry.saturating_add(delta);
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.qualified(name);
        self.gauges.insert(key, value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(&self.qualified(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> u64 {
        self.gauges
            .get(&self.qualified(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }
}
