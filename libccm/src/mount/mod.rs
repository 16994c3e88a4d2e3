//! Mount handling.
//!
//! [`MountSubsystem`] is the narrow OS interface the engine needs: probe,
//! bind, unmount, list, and reference lookup.  [`LinuxMounter`] implements it
//! with `mount(2)`/`umount(2)` and procfs mountinfo; [`FakeMounter`]
//! keeps an in-memory table for tests.
//!
//! [`MountManager`] layers the idempotency rules on top.  Subsystem calls
//! block, so the manager runs them on Tokio's blocking pool.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::CcmError;
use crate::types::VolumeRecord;

pub mod fake;
pub mod linux;
pub mod mountinfo;

pub use fake::FakeMounter;
pub use linux::LinuxMounter;

/// Permission bits for target directories created on publish.
const TARGET_DIR_MODE: u32 = 0o750;

/// One active mount as reported by [`MountSubsystem::list_mounts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Where the mount is attached.
    pub path: PathBuf,
    /// Mount source (device or pseudo name).
    pub device: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Per-mount options.
    pub options: Vec<String>,
}

/// OS mount table operations.
///
/// All methods block and are called from the blocking pool.
pub trait MountSubsystem: Send + Sync + 'static {
    /// Whether `path` is currently a mount point.
    ///
    /// Fails with [`ErrorKind::NotFound`] when `path` does not exist.
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool>;

    /// Mount `source` onto `target`.  `options` holds mount option strings
    /// and always contains `bind`.
    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> std::io::Result<()>;

    /// Detach the mount at `target`.
    fn unmount(&self, target: &Path) -> std::io::Result<()>;

    /// All mounts currently visible to the process.
    fn list_mounts(&self) -> std::io::Result<Vec<MountPoint>>;

    /// Mount points exposing the same directory as `path`, excluding `path`
    /// itself.  A missing `path` has no references.
    fn mount_refs(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
}

/// Result of [`MountManager::mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// A new bind mount was created.
    Mounted,
    /// The target was already a mount point; nothing was done.
    AlreadyMounted,
}

/// Result of [`MountManager::unmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// The mount was detached by this call.
    Unmounted,
    /// Unmount failed but nothing is mounted under the target any more,
    /// typically a retried request whose earlier response was lost.
    AlreadyUnmounted,
}

/// Idempotent mount / unmount on top of a [`MountSubsystem`].
pub struct MountManager<M> {
    mounter: Arc<M>,
}

impl<M: MountSubsystem> MountManager<M> {
    /// Wrap a shared mount subsystem.
    pub fn new(mounter: Arc<M>) -> Self {
        Self { mounter }
    }

    /// The underlying subsystem.
    pub fn subsystem(&self) -> &Arc<M> {
        &self.mounter
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CcmError>
    where
        F: FnOnce(&M) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mounter = Arc::clone(&self.mounter);
        tokio::task::spawn_blocking(move || f(&mounter))
            .await
            .map_err(CcmError::internal)
    }

    /// Bind-mount the record's data directory at its target path unless the
    /// target is already a mount point.  A missing target is created first.
    #[instrument(skip_all, fields(volume_id = %record.volume_id, target_path = %record.target_path.display()))]
    pub async fn mount(&self, record: &VolumeRecord) -> Result<MountOutcome, CcmError> {
        let target = record.target_path.clone();
        let mount_failed = |reason: String| CcmError::MountFailed {
            path: target.display().to_string(),
            reason,
        };

        let probe = {
            let target = target.clone();
            self.blocking(move |m| m.is_mount_point(&target)).await?
        };
        let mounted = match probe {
            Ok(mounted) => mounted,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(TARGET_DIR_MODE)
                    .create(&target)
                    .await
                    .map_err(|e| mount_failed(format!("failed to create mount target: {e}")))?;
                false
            }
            Err(e) => {
                return Err(mount_failed(format!(
                    "mount target exists, is not mountable: {e}"
                )));
            }
        };
        if mounted {
            if record.bind_opts.iter().any(|o| o == "ro") {
                self.ensure_read_only(&target).await.map_err(mount_failed)?;
            }
            debug!("target already mounted, assuming idempotent retry");
            return Ok(MountOutcome::AlreadyMounted);
        }

        let source = record.directory.path.clone();
        if source.as_os_str().is_empty() {
            return Err(mount_failed("volume has no data directory".into()));
        }
        let fs_type = record.fs_type.clone();
        let options = record.bind_opts.clone();
        let (src, dst, fs) = (source.clone(), target.clone(), fs_type.clone());
        self.blocking(move |m| m.bind_mount(&src, &dst, &fs, &options))
            .await?
            .map_err(|e| {
                mount_failed(format!(
                    "failed to bind mount {} with fs {fs_type}: {e}",
                    source.display()
                ))
            })?;

        info!(source = %source.display(), "volume bind-mounted");
        Ok(MountOutcome::Mounted)
    }

    /// Check that the top-most mount at `target` is read-only.
    async fn ensure_read_only(&self, target: &Path) -> Result<(), String> {
        let mounts = self
            .blocking(|m| m.list_mounts())
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| format!("failed to list mounts: {e}"))?;
        match mounts.iter().rev().find(|m| m.path == target) {
            Some(m) if m.options.iter().any(|o| o == "ro") => Ok(()),
            Some(_) => {
                warn!("existing mount is writable but read-only was requested");
                Err("mount target is mounted read-write, read-only requested".into())
            }
            None => Err("mount target is not listed in the mount table".into()),
        }
    }

    /// Unmount `target`.
    ///
    /// When the unmount call fails the active mounts are listed; if none lies
    /// under `target` the mount is considered gone and the call succeeds with
    /// [`UnmountOutcome::AlreadyUnmounted`].  Otherwise the original error is
    /// returned.
    #[instrument(skip(self), fields(target_path = %target.display()))]
    pub async fn unmount(&self, target: &Path) -> Result<UnmountOutcome, CcmError> {
        let owned = target.to_path_buf();
        let Err(err) = self.blocking(move |m| m.unmount(&owned)).await? else {
            info!("volume unmounted");
            return Ok(UnmountOutcome::Unmounted);
        };
        let unmount_failed = || CcmError::UnmountFailed {
            path: target.display().to_string(),
            reason: err.to_string(),
        };

        let mounts = match self.blocking(|m| m.list_mounts()).await? {
            Ok(mounts) => mounts,
            Err(list_err) => {
                warn!(error = %list_err, "failed to list mounts while unmounting");
                return Err(unmount_failed());
            }
        };
        if let Some(still) = mounts.iter().find(|m| m.path.starts_with(target)) {
            warn!(error = %err, mount = %still.path.display(), "failed to unmount volume, mount still exists");
            return Err(unmount_failed());
        }

        debug!(error = %err, "unmount failed but target is absent from system mounts, assuming already unmounted");
        Ok(UnmountOutcome::AlreadyUnmounted)
    }

    /// Mount points referencing `path` (see [`MountSubsystem::mount_refs`]).
    pub async fn mount_refs(&self, path: &Path) -> Result<Vec<PathBuf>, CcmError> {
        let owned = path.to_path_buf();
        self.blocking(move |m| m.mount_refs(&owned))
            .await?
            .map_err(|e| CcmError::Internal(format!("mount refs of {}: {e}", path.display())))
    }
}
