//! Orphan reclamation.
//!
//! A sweep runs in two strictly ordered phases:
//!
//! 1. every data directory with no mount references is deleted;
//! 2. every metadata directory whose data directory is gone is deleted.
//!
//! Phase 2 observes the deletions of phase 1, so a fully unmounted volume is
//! purged in a single sweep.  The sweep fails open: anomalies are logged,
//! counted, and skipped.  Volumes whose lock is held by an in-flight handler
//! are left for a later sweep.  An interrupted sweep stops between entries,
//! never inside a deletion.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::lock::VolumeLocks;
use crate::metrics::{Metrics, reason};
use crate::mount::{MountManager, MountSubsystem};
use crate::types::VolumeId;

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Data directories deleted in phase 1.
    pub data_removed: usize,
    /// Metadata directories deleted in phase 2.
    pub metadata_removed: usize,
    /// Entries skipped because they were unexpected or could not be handled.
    pub anomalies: usize,
    /// Entries skipped because a handler held the volume lock.
    pub busy_skipped: usize,
}

/// Deletes data and metadata directories no longer backing a mount.
pub struct OrphanReconciler<M> {
    data_root: PathBuf,
    metadata_root: PathBuf,
    mounts: Arc<MountManager<M>>,
    locks: Arc<VolumeLocks>,
    metrics: Arc<dyn Metrics>,
}

/// A directory entry of the data or metadata root.
struct Candidate {
    volume_id: VolumeId,
    path: PathBuf,
    is_dir: bool,
}

impl<M: MountSubsystem> OrphanReconciler<M> {
    pub fn new(
        data_root: impl Into<PathBuf>,
        metadata_root: impl Into<PathBuf>,
        mounts: Arc<MountManager<M>>,
        locks: Arc<VolumeLocks>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            metadata_root: metadata_root.into(),
            mounts,
            locks,
            metrics,
        }
    }

    /// Run both phases once.  Safe to call concurrently with handlers and
    /// with other sweeps.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_until(&CancellationToken::new()).await
    }

    /// Like [`sweep`](Self::sweep), but stop before the next entry once
    /// `cancel` fires.
    #[instrument(skip_all)]
    pub async fn sweep_until(&self, cancel: &CancellationToken) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        self.reclaim_data(&mut report, cancel).await;
        self.reclaim_metadata(&mut report, cancel).await;
        if cancel.is_cancelled() {
            debug!("cleanup sweep interrupted by cancellation");
        }

        self.metrics.cleanup_finished(started.elapsed());
        info!(
            data_removed = report.data_removed,
            metadata_removed = report.metadata_removed,
            anomalies = report.anomalies,
            busy_skipped = report.busy_skipped,
            "cleanup sweep finished"
        );
        report
    }

    fn anomaly(&self, report: &mut SweepReport, volume_id: &str, why: &str) {
        report.anomalies += 1;
        self.metrics.cleanup_failed(volume_id, why);
    }

    async fn reclaim_data(&self, report: &mut SweepReport, cancel: &CancellationToken) {
        let Some(candidates) = self.list(&self.data_root, report).await else {
            return;
        };
        for c in candidates {
            if cancel.is_cancelled() {
                return;
            }
            if !c.is_dir {
                warn!(path = %c.path.display(), "unexpected file in data dir, skipping");
                self.anomaly(report, c.volume_id.as_str(), reason::UNEXPECTED_DATA_FILE);
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(&c.volume_id) else {
                debug!(volume_id = %c.volume_id, "volume busy, skipping data dir");
                report.busy_skipped += 1;
                continue;
            };

            // Always re-query: mounts may have changed since the listing.
            let refs = match self.mounts.mount_refs(&c.path).await {
                Ok(refs) => refs,
                Err(e) => {
                    warn!(path = %c.path.display(), error = %e, "error listing mount refs, skipping");
                    self.anomaly(report, c.volume_id.as_str(), reason::MOUNT_REFS_FAILED);
                    continue;
                }
            };
            if !refs.is_empty() {
                debug!(volume_id = %c.volume_id, refs = refs.len(), "data dir still mounted");
                continue;
            }

            match tokio::fs::remove_dir_all(&c.path).await {
                Ok(()) => {
                    debug!(path = %c.path.display(), "removed data dir");
                    report.data_removed += 1;
                    self.metrics.cleanup_succeeded(c.volume_id.as_str());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %c.path.display(), error = %e, "removing data dir failed");
                    self.anomaly(report, c.volume_id.as_str(), reason::REMOVE_DATA_FAILED);
                }
            }
        }
    }

    async fn reclaim_metadata(&self, report: &mut SweepReport, cancel: &CancellationToken) {
        let Some(candidates) = self.list(&self.metadata_root, report).await else {
            return;
        };
        for c in candidates {
            if cancel.is_cancelled() {
                return;
            }
            if !c.is_dir {
                warn!(path = %c.path.display(), "unexpected file in metadata dir, skipping");
                self.anomaly(report, c.volume_id.as_str(), reason::UNEXPECTED_METADATA_FILE);
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(&c.volume_id) else {
                debug!(volume_id = %c.volume_id, "volume busy, skipping metadata dir");
                report.busy_skipped += 1;
                continue;
            };

            let data_dir = self.data_root.join(c.volume_id.as_str());
            match tokio::fs::symlink_metadata(&data_dir).await {
                Ok(_) => {
                    debug!(volume_id = %c.volume_id, "data dir present, keeping metadata");
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %data_dir.display(), error = %e, "unexpected error stating data dir");
                    self.anomaly(report, c.volume_id.as_str(), reason::STAT_DATA_FAILED);
                    continue;
                }
            }

            match tokio::fs::remove_dir_all(&c.path).await {
                Ok(()) => {
                    debug!(path = %c.path.display(), "removed metadata dir");
                    report.metadata_removed += 1;
                    self.metrics.cleanup_succeeded(c.volume_id.as_str());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %c.path.display(), error = %e, "removing metadata dir failed");
                    self.anomaly(report, c.volume_id.as_str(), reason::REMOVE_METADATA_FAILED);
                }
            }
        }
    }

    /// Entries of `root`.  A missing root yields `None` without an anomaly.
    async fn list(&self, root: &Path, report: &mut SweepReport) -> Option<Vec<Candidate>> {
        let mut dir = match tokio::fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "cannot list directory");
                report.anomalies += 1;
                return None;
            }
        };

        let mut out = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "error reading directory");
                    report.anomalies += 1;
                    break;
                }
            };
            let path = entry.path();
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %path.display(), "non UTF-8 entry name, skipping");
                report.anomalies += 1;
                continue;
            };
            // Entries can vanish between listing and inspection.
            let is_dir = match entry.file_type().await {
                Ok(t) => t.is_dir(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat entry");
                    report.anomalies += 1;
                    continue;
                }
            };
            out.push(Candidate {
                volume_id: VolumeId::from(name),
                path,
                is_dir,
            });
        }
        Some(out)
    }
}
