//! Volume lifecycle coordination.
//!
//! [`Coordinator`] is the request-facing half of the engine.  Publish
//! validates the request, builds a [`VolumeRecord`], populates content and
//! bind-mounts it.  Unpublish unmounts and then sweeps orphans.  Both hold the
//! volume's lock from the first side effect to the last.  Cancellation is
//! checked between steps: a step that touches the filesystem or the mount
//! table always runs to completion before the lock is released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{CcmError, Status};
use crate::identity::CsiIdentity;
use crate::lock::{VolumeGuard, VolumeLocks};
use crate::metadata::MetadataStore;
use crate::metrics::{Metrics, reason};
use crate::mount::{MountManager, MountSubsystem, UnmountOutcome};
use crate::node::CsiNode;
use crate::populate::ContentPopulator;
use crate::reconcile::{OrphanReconciler, SweepReport};
use crate::source::ConfigSource;
use crate::types::{
    CONTEXT_MODE, CONTEXT_NAME, DirectoryRecord, NodeInfo, NodePublishVolumeRequest,
    VolumeCapability, VolumeId, VolumeRecord, is_path_component,
};

/// Label used for metrics and logs when a volume's bundle name is unknown.
const UNKNOWN_NAME: &str = "unknown";

/// Orchestrates publish and unpublish for one node.
pub struct Coordinator<S, M> {
    config: Config,
    populator: ContentPopulator<S>,
    mounts: Arc<MountManager<M>>,
    metadata: MetadataStore,
    locks: Arc<VolumeLocks>,
    reconciler: OrphanReconciler<M>,
    metrics: Arc<dyn Metrics>,
}

impl<S: ConfigSource, M: MountSubsystem> Coordinator<S, M> {
    /// Wire up the engine below `config.storage_dir`.
    pub fn new(config: Config, source: Arc<S>, mounter: Arc<M>, metrics: Arc<dyn Metrics>) -> Self {
        let metadata = MetadataStore::new(config.metadata_dir());
        let mounts = Arc::new(MountManager::new(mounter));
        let locks = Arc::new(VolumeLocks::new());
        let populator = ContentPopulator::new(
            source,
            config.data_dir(),
            metadata.clone(),
            config.default_mode,
        );
        let reconciler = OrphanReconciler::new(
            config.data_dir(),
            config.metadata_dir(),
            Arc::clone(&mounts),
            Arc::clone(&locks),
            Arc::clone(&metrics),
        );
        Self {
            config,
            populator,
            mounts,
            metadata,
            locks,
            reconciler,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The per-volume lock table shared by handlers and the sweep.
    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    /// Run one orphan sweep over all volumes.
    pub async fn reconcile(&self) -> SweepReport {
        self.reconciler.sweep().await
    }

    /// Materialize and mount a volume.
    #[instrument(skip_all, fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    pub async fn publish(
        &self,
        req: NodePublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<(), CcmError> {
        let started = Instant::now();
        debug!("node publish volume called");

        let record = self.build_record(&req)?;
        let name = record.name.clone();
        let volume_id = record.volume_id.clone();

        let op = async {
            let _guard = self.lock_or_cancel(&volume_id, "publish", cancel).await?;
            self.publish_locked(record, cancel).await
        };
        match op.await {
            Ok(()) => {
                self.metrics.publish_succeeded(&name, started.elapsed());
                info!(name = %name, "volume published");
                Ok(())
            }
            Err(e) => {
                if matches!(e, CcmError::Cancelled(_)) {
                    self.metrics.publish_failed(&name, reason::CANCELLED);
                }
                Err(e)
            }
        }
    }

    async fn publish_locked(
        &self,
        record: VolumeRecord,
        cancel: &CancellationToken,
    ) -> Result<(), CcmError> {
        let volume_id = record.volume_id.clone();
        let name = record.name.clone();

        let record = match self.populator.populate(record, cancel).await {
            Ok(record) => record,
            Err(e @ CcmError::Cancelled(_)) => return Err(e),
            Err(e) => {
                error!(error = %e, "failed to populate volume");
                self.metrics.publish_failed(&name, reason::POPULATE_FAILED);
                return Err(CcmError::Internal(format!(
                    "failed to populate volume {volume_id:?}: {e}"
                )));
            }
        };

        checkpoint(cancel, &volume_id, "publish")?;
        self.mounts.mount(&record).await.map_err(|e| {
            error!(error = %e, "failed to mount volume");
            self.metrics.publish_failed(&name, reason::MOUNT_FAILED);
            CcmError::Internal(format!("failed to mount volume {volume_id:?}: {e}"))
        })?;
        Ok(())
    }

    /// Validate a publish request and turn it into a fresh record.
    fn build_record(&self, req: &NodePublishVolumeRequest) -> Result<VolumeRecord, CcmError> {
        let name = req
            .volume_context
            .get(CONTEXT_NAME)
            .map(String::as_str)
            .unwrap_or_default();
        let invalid = |label: &str, why: &str, msg: &str| {
            self.metrics.publish_failed(label, why);
            CcmError::InvalidArgument(msg.to_owned())
        };

        if name.is_empty() {
            return Err(invalid(
                "",
                reason::MISSING_NAME,
                "NodePublishVolume volume context name field should be set",
            ));
        }
        if req.volume_id.is_empty() {
            return Err(invalid(
                name,
                reason::MISSING_VOLUME_ID,
                "NodePublishVolume volume id must be provided",
            ));
        }
        if !is_path_component(req.volume_id.as_str()) {
            return Err(invalid(
                name,
                reason::INVALID_VOLUME_ID,
                "NodePublishVolume volume id must be a single path component",
            ));
        }
        if req.target_path.is_empty() {
            return Err(invalid(
                name,
                reason::MISSING_TARGET_PATH,
                "NodePublishVolume target path must be provided",
            ));
        }
        let mount = match &req.volume_capability {
            None => {
                return Err(invalid(
                    name,
                    reason::MISSING_CAPABILITY,
                    "NodePublishVolume volume capability must be provided",
                ));
            }
            Some(VolumeCapability::Block) => {
                return Err(invalid(
                    name,
                    reason::BLOCK_CAPABILITY,
                    "NodePublishVolume block access is not supported",
                ));
            }
            Some(VolumeCapability::Mount(mount)) => mount,
        };

        let mut bind_opts = mount.mount_flags.clone();
        bind_opts.push("bind".to_owned());
        if req.read_only {
            bind_opts.push("ro".to_owned());
        }
        let fs_type = if mount.fs_type.is_empty() {
            self.config.default_fs_type.clone()
        } else {
            mount.fs_type.clone()
        };

        let mut record = VolumeRecord {
            name: name.to_owned(),
            created: Utc::now(),
            mode: req
                .volume_context
                .get(CONTEXT_MODE)
                .cloned()
                .unwrap_or_default(),
            volume_id: req.volume_id.clone(),
            target_path: PathBuf::from(&req.target_path),
            fs_type,
            bind_opts,
            directory: DirectoryRecord::default(),
        };
        if let Err(e) = record.file_mode(self.config.default_mode) {
            warn!(error = %e, mode = %record.mode, "discarding invalid mode");
            self.metrics.publish_failed(name, reason::INVALID_MODE);
            record.mode.clear();
        }
        Ok(record)
    }

    /// Unmount a volume and reclaim whatever no longer backs a mount.
    #[instrument(skip_all, fields(volume_id = %volume_id, target_path = %target_path))]
    pub async fn unpublish(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CcmError> {
        let started = Instant::now();
        let invalid = |why: &str, msg: &str| {
            self.metrics.unpublish_failed("", why);
            CcmError::InvalidArgument(msg.to_owned())
        };
        if volume_id.is_empty() {
            return Err(invalid(
                reason::MISSING_VOLUME_ID,
                "NodeUnpublishVolume volume id must be provided",
            ));
        }
        if !is_path_component(volume_id.as_str()) {
            return Err(invalid(
                reason::INVALID_VOLUME_ID,
                "NodeUnpublishVolume volume id must be a single path component",
            ));
        }
        if target_path.is_empty() {
            return Err(invalid(
                reason::MISSING_TARGET_PATH,
                "NodeUnpublishVolume target path must be provided",
            ));
        }
        debug!("node unpublish volume called");

        let target = Path::new(target_path);
        let op = async {
            let _guard = self.lock_or_cancel(volume_id, "unpublish", cancel).await?;
            self.unpublish_locked(volume_id, target, cancel).await
        };
        let name = match op.await {
            Ok(name) => name,
            Err(e) => {
                if matches!(e, CcmError::Cancelled(_)) {
                    self.metrics.unpublish_failed(UNKNOWN_NAME, reason::CANCELLED);
                }
                return Err(e);
            }
        };

        // The lock is released: the sweep takes it per volume.
        self.reconciler.sweep_until(cancel).await;

        self.metrics.unpublish_succeeded(&name, started.elapsed());
        info!(name = %name, "volume unpublished");
        Ok(())
    }

    /// Returns the bundle name used for attribution.
    async fn unpublish_locked(
        &self,
        volume_id: &VolumeId,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, CcmError> {
        let name = match self.metadata.read_record(volume_id).await {
            Ok(record) => {
                if record.target_path != target {
                    self.metrics
                        .unpublish_failed(&record.name, reason::METADATA_OUT_OF_SYNC);
                    warn!(
                        requested = %target.display(),
                        recorded = %record.target_path.display(),
                        name = %record.name,
                        "requested unpublish dir does not match metadata, metadata out of sync"
                    );
                }
                record.name
            }
            Err(e) => {
                info!(error = %e, "missing metadata, attempting to unpublish gracefully");
                UNKNOWN_NAME.to_owned()
            }
        };

        checkpoint(cancel, volume_id, "unpublish")?;
        match self.mounts.unmount(target).await {
            Ok(UnmountOutcome::Unmounted) => {}
            Ok(UnmountOutcome::AlreadyUnmounted) => {
                self.metrics.unpublish_failed(&name, reason::ALREADY_UNMOUNTED);
            }
            Err(e) => {
                self.metrics.unpublish_failed(&name, reason::UNMOUNT_FAILED);
                return Err(e);
            }
        }
        Ok(name)
    }

    /// Wait for the volume lock unless `cancel` fires first.
    async fn lock_or_cancel(
        &self,
        volume_id: &VolumeId,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<VolumeGuard<'_>, CcmError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(volume_id, what)),
            guard = self.locks.acquire(volume_id) => Ok(guard),
        }
    }
}

/// Stop before the next step once `cancel` has fired.
fn checkpoint(cancel: &CancellationToken, volume_id: &VolumeId, what: &str) -> Result<(), CcmError> {
    if cancel.is_cancelled() {
        return Err(cancelled(volume_id, what));
    }
    Ok(())
}

fn cancelled(volume_id: &VolumeId, what: &str) -> CcmError {
    warn!(%volume_id, "{what} cancelled, abandoning");
    CcmError::Cancelled(format!("{what} of volume {volume_id:?} abandoned"))
}

#[async_trait]
impl<S: ConfigSource, M: MountSubsystem> CsiNode for Coordinator<S, M> {
    async fn publish_volume(
        &self,
        req: NodePublishVolumeRequest,
        cancel: CancellationToken,
    ) -> Result<(), Status> {
        self.publish(req, &cancel).await.map_err(Status::from)
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
        cancel: CancellationToken,
    ) -> Result<(), Status> {
        self.unpublish(volume_id, target_path, &cancel)
            .await
            .map_err(Status::from)
    }

    async fn get_info(&self) -> Result<NodeInfo, Status> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
        })
    }
}

#[async_trait]
impl<S: ConfigSource, M: MountSubsystem> CsiIdentity for Coordinator<S, M> {
    async fn probe(&self) -> Result<bool, Status> {
        Ok(tokio::fs::metadata(&self.config.storage_dir)
            .await
            .is_ok_and(|m| m.is_dir()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::identity::PLUGIN_NAME;
    use crate::metrics::CounterMetrics;
    use crate::mount::{FakeMounter, MountPoint};
    use crate::source::MemorySource;
    use crate::types::{MountVolume, NodeCapability};
    use sha2::{Digest, Sha512};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        source: Arc<MemorySource>,
        fake: Arc<FakeMounter>,
        metrics: Arc<CounterMetrics>,
        coord: Coordinator<MemorySource, FakeMounter>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let source = Arc::new(
                MemorySource::new().with_bundle("cm", [("a.txt", "hello"), ("b.txt", "world")]),
            );
            let fake = Arc::new(FakeMounter::new());
            let metrics = Arc::new(CounterMetrics::new());
            let coord = Coordinator::new(
                Config::new(root.join("storage"), "node-1"),
                Arc::clone(&source),
                Arc::clone(&fake),
                Arc::clone(&metrics) as Arc<dyn Metrics>,
            );
            Self {
                _tmp: tmp,
                root,
                source,
                fake,
                metrics,
                coord,
            }
        }

        fn target(&self, pod: &str) -> PathBuf {
            self.root.join("pods").join(pod).join("volumes/cm/mount")
        }

        fn data(&self, id: &str) -> PathBuf {
            self.root.join("storage/data").join(id)
        }

        fn meta(&self, id: &str) -> PathBuf {
            self.root.join("storage/metadata").join(id)
        }

        fn request(&self, id: &str, pod: &str) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: VolumeId::from(id),
                target_path: self.target(pod).display().to_string(),
                volume_capability: Some(VolumeCapability::Mount(MountVolume::default())),
                read_only: true,
                volume_context: HashMap::from([(CONTEXT_NAME.to_owned(), "cm".to_owned())]),
            }
        }

        async fn publish(&self, req: NodePublishVolumeRequest) -> Result<(), CcmError> {
            self.coord.publish(req, &CancellationToken::new()).await
        }

        async fn unpublish(&self, id: &str, pod: &str) -> Result<(), CcmError> {
            let target = self.target(pod).display().to_string();
            self.coord
                .unpublish(&VolumeId::from(id), &target, &CancellationToken::new())
                .await
        }
    }

    #[tokio::test]
    async fn publish_populates_and_mounts() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();

        let data = fx.data("vol-1");
        assert_eq!(std::fs::read_to_string(data.join("a.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(data.join("b.txt")).unwrap(), "world");

        let record = MetadataStore::new(fx.root.join("storage/metadata"))
            .read_record(&VolumeId::from("vol-1"))
            .await
            .unwrap();
        assert_eq!(record.name, "cm");
        assert_eq!(record.fs_type, "ext4");
        assert_eq!(record.bind_opts, vec!["bind", "ro"]);
        assert_eq!(record.target_path, fx.target("p1"));
        assert_eq!(record.directory.path, data);
        assert_eq!(
            record.directory.contents[0].sha512,
            hex::encode(Sha512::digest(b"hello"))
        );

        assert!(fx.fake.is_mounted(&fx.target("p1")));
        assert_eq!(fx.metrics.get("publish_volume_success", &["cm"]), 1);
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();

        assert_eq!(fx.fake.mount_calls(), 1);
        assert_eq!(fx.metrics.get("publish_volume_success", &["cm"]), 2);
    }

    #[tokio::test]
    async fn publish_keeps_caller_flags_and_fs_type() {
        let fx = Fixture::new();
        let mut req = fx.request("vol-1", "p1");
        req.read_only = false;
        req.volume_capability = Some(VolumeCapability::Mount(MountVolume {
            fs_type: "xfs".into(),
            mount_flags: vec!["noexec".into()],
        }));
        fx.publish(req).await.unwrap();

        let mounts = fx.fake.list_mounts().unwrap();
        assert_eq!(mounts[0].fs_type, "xfs");
        assert_eq!(mounts[0].options, vec!["noexec", "bind"]);
    }

    #[tokio::test]
    async fn publish_validation_errors_are_distinct() {
        let fx = Fixture::new();

        let mut no_name = fx.request("vol-1", "p1");
        no_name.volume_context.clear();
        let mut no_id = fx.request("", "p1");
        no_id.volume_id = VolumeId::default();
        let mut bad_id = fx.request("vol-1", "p1");
        bad_id.volume_id = VolumeId::from("../etc");
        let mut no_target = fx.request("vol-1", "p1");
        no_target.target_path.clear();
        let mut no_cap = fx.request("vol-1", "p1");
        no_cap.volume_capability = None;
        let mut block = fx.request("vol-1", "p1");
        block.volume_capability = Some(VolumeCapability::Block);

        let mut messages = Vec::new();
        for req in [no_name, no_id, bad_id, no_target, no_cap, block] {
            let err = fx.publish(req).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument, "{err}");
            messages.push(err.to_string());
        }
        assert!(messages[0].contains("name"));
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), 6);

        assert_eq!(
            fx.metrics
                .get("publish_volume_error", &["", reason::MISSING_NAME]),
            1
        );
        assert_eq!(
            fx.metrics
                .get("publish_volume_error", &["cm", reason::MISSING_CAPABILITY]),
            1
        );
        assert_eq!(fx.source.fetch_count(), 0);
        assert_eq!(fx.fake.mount_calls(), 0);
        assert!(fx.coord.locks().is_empty());
    }

    #[tokio::test]
    async fn invalid_mode_falls_back_to_default() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let mut req = fx.request("vol-1", "p1");
        req.volume_context
            .insert(CONTEXT_MODE.to_owned(), "not-octal".to_owned());
        fx.publish(req).await.unwrap();

        let meta = std::fs::metadata(fx.data("vol-1").join("a.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
        assert_eq!(
            fx.metrics
                .get("publish_volume_error", &["cm", reason::INVALID_MODE]),
            1
        );
        let record = MetadataStore::new(fx.root.join("storage/metadata"))
            .read_record(&VolumeId::from("vol-1"))
            .await
            .unwrap();
        assert_eq!(record.mode, "");
    }

    #[tokio::test]
    async fn populate_failure_is_internal() {
        let fx = Fixture::new();
        let mut req = fx.request("vol-1", "p1");
        req.volume_context
            .insert(CONTEXT_NAME.to_owned(), "missing".to_owned());

        let err = fx.publish(req).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("failed to populate volume \"vol-1\""));
        assert_eq!(
            fx.metrics
                .get("publish_volume_error", &["missing", reason::POPULATE_FAILED]),
            1
        );
        assert_eq!(fx.fake.mount_calls(), 0);
    }

    #[tokio::test]
    async fn mount_failure_is_internal_and_retry_succeeds() {
        let fx = Fixture::new();
        fx.fake.set_fail_mount(true);

        let err = fx.publish(fx.request("vol-1", "p1")).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("failed to mount volume \"vol-1\""));
        // Content and commit marker stay for the retry.
        assert!(fx.meta("vol-1").join("metadata.json").exists());

        fx.fake.set_fail_mount(false);
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();
        assert!(fx.fake.is_mounted(&fx.target("p1")));
    }

    #[tokio::test]
    async fn unpublish_unmounts_and_purges() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();

        fx.unpublish("vol-1", "p1").await.unwrap();
        assert!(!fx.fake.is_mounted(&fx.target("p1")));
        assert!(!fx.data("vol-1").exists());
        assert!(!fx.meta("vol-1").exists());
        assert_eq!(fx.metrics.get("unpublish_volume_success", &["cm"]), 1);
        assert!(fx.coord.locks().is_empty());
    }

    #[tokio::test]
    async fn unpublish_is_idempotent() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();

        fx.unpublish("vol-1", "p1").await.unwrap();
        fx.unpublish("vol-1", "p1").await.unwrap();
        assert_eq!(fx.fake.unmount_calls(), 2);
        assert_eq!(
            fx.metrics
                .get("unpublish_volume_error", &[UNKNOWN_NAME, reason::ALREADY_UNMOUNTED]),
            1
        );
        assert_eq!(fx.metrics.get("unpublish_volume_success", &[UNKNOWN_NAME]), 1);
    }

    #[tokio::test]
    async fn unpublish_succeeds_when_unmount_fails_on_absent_mount() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();
        // The mount vanished behind our back and unmount now errors.
        fx.fake.remove_mount(&fx.target("p1"));
        fx.fake.set_fail_unmount(true);

        fx.unpublish("vol-1", "p1").await.unwrap();
        assert_eq!(
            fx.metrics
                .get("unpublish_volume_error", &["cm", reason::ALREADY_UNMOUNTED]),
            1
        );
        assert!(!fx.data("vol-1").exists());
    }

    #[tokio::test]
    async fn unpublish_reports_live_mount_failure() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();
        fx.fake.set_fail_unmount(true);

        let err = fx.unpublish("vol-1", "p1").await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(fx.data("vol-1").exists());
        assert_eq!(
            fx.metrics
                .get("unpublish_volume_error", &["cm", reason::UNMOUNT_FAILED]),
            1
        );
    }

    #[tokio::test]
    async fn unpublish_with_mismatched_target_still_unmounts() {
        let fx = Fixture::new();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();
        // A second mount of the same data at another path, unknown to metadata.
        std::fs::create_dir_all(fx.target("p2")).unwrap();
        fx.fake.add_mount(fx.data("vol-1"), fx.target("p2"));

        fx.unpublish("vol-1", "p2").await.unwrap();
        assert!(!fx.fake.is_mounted(&fx.target("p2")));
        assert!(fx.fake.is_mounted(&fx.target("p1")));
        // Still referenced through p1.
        assert!(fx.data("vol-1").exists());
        assert_eq!(
            fx.metrics
                .get("unpublish_volume_error", &["cm", reason::METADATA_OUT_OF_SYNC]),
            1
        );
    }

    #[tokio::test]
    async fn unpublish_without_metadata_is_graceful() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.target("p1")).unwrap();
        fx.fake.add_mount(fx.data("vol-1"), fx.target("p1"));

        fx.unpublish("vol-1", "p1").await.unwrap();
        assert_eq!(fx.metrics.get("unpublish_volume_success", &[UNKNOWN_NAME]), 1);
    }

    #[tokio::test]
    async fn unpublish_validation() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        let no_id = fx
            .coord
            .unpublish(&VolumeId::default(), "/target", &cancel)
            .await
            .unwrap_err();
        let no_target = fx
            .coord
            .unpublish(&VolumeId::from("vol-1"), "", &cancel)
            .await
            .unwrap_err();
        assert_eq!(no_id.code(), Code::InvalidArgument);
        assert_eq!(no_target.code(), Code::InvalidArgument);
        assert_ne!(no_id, no_target);
    }

    #[tokio::test]
    async fn same_volume_waits_for_lock_and_honours_cancel() {
        let fx = Fixture::new();
        let held = fx.coord.locks().acquire(&VolumeId::from("vol-1")).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = fx
            .coord
            .publish(fx.request("vol-1", "p1"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(fx.source.fetch_count(), 0);
        assert_eq!(
            fx.metrics.get("publish_volume_error", &["cm", reason::CANCELLED]),
            1
        );

        // Another volume is not blocked by the held lock.
        fx.publish(fx.request("vol-2", "p2")).await.unwrap();

        drop(held);
        assert!(fx.coord.locks().is_empty());
    }

    /// Wraps a [`FakeMounter`]; binding fires `on_bind` and then stalls.
    struct SlowMounter {
        inner: Arc<FakeMounter>,
        on_bind: CancellationToken,
        delay: Duration,
    }

    impl MountSubsystem for SlowMounter {
        fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
            self.inner.is_mount_point(path)
        }

        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            fs_type: &str,
            options: &[String],
        ) -> std::io::Result<()> {
            self.on_bind.cancel();
            std::thread::sleep(self.delay);
            self.inner.bind_mount(source, target, fs_type, options)
        }

        fn unmount(&self, target: &Path) -> std::io::Result<()> {
            self.inner.unmount(target)
        }

        fn list_mounts(&self) -> std::io::Result<Vec<MountPoint>> {
            self.inner.list_mounts()
        }

        fn mount_refs(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
            self.inner.mount_refs(path)
        }
    }

    #[tokio::test]
    async fn cancel_during_mount_holds_lock_until_mount_settles() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeMounter::new());
        let cancel = CancellationToken::new();
        let coord = Coordinator::new(
            Config::new(tmp.path().join("storage"), "node-1"),
            Arc::new(MemorySource::new().with_bundle("cm", [("a.txt", "hello")])),
            Arc::new(SlowMounter {
                inner: Arc::clone(&fake),
                on_bind: cancel.clone(),
                delay: Duration::from_millis(300),
            }),
            Arc::new(CounterMetrics::new()) as Arc<dyn Metrics>,
        );
        let target = tmp.path().join("pods/p1/volumes/cm/mount");
        let target_str = target.display().to_string();
        let req = NodePublishVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            target_path: target_str.clone(),
            volume_capability: Some(VolumeCapability::Mount(MountVolume::default())),
            read_only: true,
            volume_context: HashMap::from([(CONTEXT_NAME.to_owned(), "cm".to_owned())]),
        };

        // The token fires once the bind has started; the bind still finishes
        // before publish returns and releases the lock.
        coord.publish(req, &cancel).await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(fake.is_mounted(&target));
        assert!(coord.locks().is_empty());

        coord
            .unpublish(&VolumeId::from("vol-1"), &target_str, &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!fake.is_mounted(&target));
        assert_eq!(fake.mount_calls(), 1);
        assert!(!tmp.path().join("storage/data/vol-1").exists());
        assert!(!tmp.path().join("storage/metadata/vol-1").exists());
    }

    #[tokio::test]
    async fn startup_reconcile_reclaims_leftovers() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.data("stale")).unwrap();
        std::fs::create_dir_all(fx.meta("stale")).unwrap();
        fx.publish(fx.request("vol-1", "p1")).await.unwrap();

        let report = fx.coord.reconcile().await;
        assert_eq!(report.data_removed, 1);
        assert_eq!(report.metadata_removed, 1);
        assert!(fx.data("vol-1").exists());
    }

    #[tokio::test]
    async fn service_traits() {
        let fx = Fixture::new();
        assert!(!fx.coord.probe().await.unwrap());
        std::fs::create_dir_all(fx.root.join("storage")).unwrap();
        assert!(fx.coord.probe().await.unwrap());

        assert_eq!(fx.coord.get_plugin_info().await.unwrap().name, PLUGIN_NAME);
        assert_eq!(fx.coord.get_info().await.unwrap().node_id, "node-1");
        assert_eq!(
            fx.coord.get_capabilities().await.unwrap(),
            vec![NodeCapability::Unknown]
        );
        let err = fx
            .coord
            .stage_volume(&VolumeId::from("vol-1"), "/staging")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let status = fx
            .coord
            .publish_volume(NodePublishVolumeRequest::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
