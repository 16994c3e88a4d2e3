//! Metrics capability.
//!
//! Components never touch a process-wide registry; they receive an
//! `Arc<dyn Metrics>` at construction time.  [`LogMetrics`] turns events into
//! `tracing` records under the `ccm::metrics` target, [`CounterMetrics`] keeps
//! them in memory.

use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

/// Failure and anomaly labels attached to error counters.
pub mod reason {
    pub const MISSING_NAME: &str = "missing volume context name field";
    pub const MISSING_VOLUME_ID: &str = "missing volume id";
    pub const INVALID_VOLUME_ID: &str = "invalid volume id";
    pub const MISSING_TARGET_PATH: &str = "missing target path";
    pub const MISSING_CAPABILITY: &str = "missing volume capabilities";
    pub const BLOCK_CAPABILITY: &str = "unsupported block capability";
    pub const INVALID_MODE: &str = "invalid volume mode";
    pub const POPULATE_FAILED: &str = "failed to populate volume contents";
    pub const MOUNT_FAILED: &str = "failed to mount volume contents";
    pub const METADATA_OUT_OF_SYNC: &str = "metadata out of sync";
    pub const UNMOUNT_FAILED: &str = "failed to unmount volume";
    pub const ALREADY_UNMOUNTED: &str = "volume was already unmounted";
    pub const CANCELLED: &str = "cancelled";
    pub const UNEXPECTED_DATA_FILE: &str = "unexpected file in data dir";
    pub const UNEXPECTED_METADATA_FILE: &str = "unexpected file in metadata dir";
    pub const MOUNT_REFS_FAILED: &str = "error listing mount refs";
    pub const REMOVE_DATA_FAILED: &str = "removing data dir failed";
    pub const REMOVE_METADATA_FAILED: &str = "removing metadata dir failed";
    pub const STAT_DATA_FAILED: &str = "unexpected error stating data dir";
}

/// Sink for lifecycle and cleanup measurements.
pub trait Metrics: Send + Sync {
    /// A publish request finished successfully.
    fn publish_succeeded(&self, name: &str, elapsed: Duration);
    /// A publish request failed or hit an anomaly.
    fn publish_failed(&self, name: &str, reason: &str);
    /// An unpublish request finished successfully.
    fn unpublish_succeeded(&self, name: &str, elapsed: Duration);
    /// An unpublish request failed or hit an anomaly.
    fn unpublish_failed(&self, name: &str, reason: &str);
    /// A data or metadata directory of `volume_id` was reclaimed.
    fn cleanup_succeeded(&self, volume_id: &str);
    /// Reclaiming an entry failed or the entry was anomalous.
    fn cleanup_failed(&self, volume_id: &str, reason: &str);
    /// A full sweep finished.
    fn cleanup_finished(&self, elapsed: Duration);
}

/// Emits every event as a `debug` record on the `ccm::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl Metrics for LogMetrics {
    fn publish_succeeded(&self, name: &str, elapsed: Duration) {
        debug!(target: "ccm::metrics", metric = "publish_volume_success", name, elapsed_secs = elapsed.as_secs_f64());
    }

    fn publish_failed(&self, name: &str, reason: &str) {
        debug!(target: "ccm::metrics", metric = "publish_volume_error", name, reason);
    }

    fn unpublish_succeeded(&self, name: &str, elapsed: Duration) {
        debug!(target: "ccm::metrics", metric = "unpublish_volume_success", name, elapsed_secs = elapsed.as_secs_f64());
    }

    fn unpublish_failed(&self, name: &str, reason: &str) {
        debug!(target: "ccm::metrics", metric = "unpublish_volume_error", name, reason);
    }

    fn cleanup_succeeded(&self, volume_id: &str) {
        debug!(target: "ccm::metrics", metric = "cleanup_volume_success", volume_id);
    }

    fn cleanup_failed(&self, volume_id: &str, reason: &str) {
        debug!(target: "ccm::metrics", metric = "cleanup_volume_error", volume_id, reason);
    }

    fn cleanup_finished(&self, elapsed: Duration) {
        debug!(target: "ccm::metrics", metric = "cleanup_volume_duration", elapsed_secs = elapsed.as_secs_f64());
    }
}

/// In-memory counters keyed by metric name and labels.
///
/// Keys look like `publish_volume_error{name,reason}`; durations are not
/// recorded, only the number of observations.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: DashMap<String, u64>,
}

impl CounterMetrics {
    /// Create an empty counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `metric` for the given label values.
    pub fn get(&self, metric: &str, labels: &[&str]) -> u64 {
        self.counters
            .get(&Self::key(metric, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sum of `metric` across all label values.
    pub fn total(&self, metric: &str) -> u64 {
        let prefix = format!("{metric}{{");
        self.counters
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| *e.value())
            .sum()
    }

    fn key(metric: &str, labels: &[&str]) -> String {
        format!("{metric}{{{}}}", labels.join(","))
    }

    fn inc(&self, metric: &str, labels: &[&str]) {
        *self.counters.entry(Self::key(metric, labels)).or_insert(0) += 1;
    }
}

impl Metrics for CounterMetrics {
    fn publish_succeeded(&self, name: &str, _elapsed: Duration) {
        self.inc("publish_volume_success", &[name]);
    }

    fn publish_failed(&self, name: &str, reason: &str) {
        self.inc("publish_volume_error", &[name, reason]);
    }

    fn unpublish_succeeded(&self, name: &str, _elapsed: Duration) {
        self.inc("unpublish_volume_success", &[name]);
    }

    fn unpublish_failed(&self, name: &str, reason: &str) {
        self.inc("unpublish_volume_error", &[name, reason]);
    }

    fn cleanup_succeeded(&self, volume_id: &str) {
        self.inc("cleanup_volume_success", &[volume_id]);
    }

    fn cleanup_failed(&self, volume_id: &str, reason: &str) {
        self.inc("cleanup_volume_error", &[volume_id, reason]);
    }

    fn cleanup_finished(&self, _elapsed: Duration) {
        self.inc("cleanup_volume_duration", &[]);
    }
}
