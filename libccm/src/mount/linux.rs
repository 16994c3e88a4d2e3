//! Linux implementation of [`MountSubsystem`].

use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount, umount};
use procfs::FromRead;
use procfs::process::{MountInfo, MountInfos, Process};
use tracing::{debug, error};

use super::mountinfo;
use super::{MountPoint, MountSubsystem};

/// Mounts through `mount(2)` and reads state from procfs mountinfo.
#[derive(Debug, Clone, Default)]
pub struct LinuxMounter {
    /// `None` reads the calling process's own mount namespace.
    mountinfo_path: Option<PathBuf>,
}

impl LinuxMounter {
    /// Use the calling process's mount namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mount state from another mountinfo file (e.g. a different pid).
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo_path: Some(path.into()),
        }
    }

    fn read_mountinfo(&self) -> io::Result<Vec<MountInfo>> {
        let infos = match &self.mountinfo_path {
            Some(path) => MountInfos::from_file(path),
            None => Process::myself().and_then(|p| p.mountinfo()),
        };
        infos
            .map(|infos| infos.0)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Split mount option strings into kernel flags and filesystem data.
///
/// Returns the flags for the initial bind, the flags that only take effect
/// on a bind remount, and the leftover options joined as mount data.
fn parse_options(options: &[String]) -> (MsFlags, MsFlags, Option<String>) {
    let mut bind = MsFlags::empty();
    let mut remount = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "bind" => bind |= MsFlags::MS_BIND,
            "rbind" => bind |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => remount |= MsFlags::MS_RDONLY,
            "nosuid" => remount |= MsFlags::MS_NOSUID,
            "nodev" => remount |= MsFlags::MS_NODEV,
            "noexec" => remount |= MsFlags::MS_NOEXEC,
            "noatime" => remount |= MsFlags::MS_NOATIME,
            "nodiratime" => remount |= MsFlags::MS_NODIRATIME,
            "relatime" => remount |= MsFlags::MS_RELATIME,
            "sync" => remount |= MsFlags::MS_SYNCHRONOUS,
            "rw" | "defaults" | "" => {}
            other => data.push(other),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (bind, remount, data)
}

impl MountSubsystem for LinuxMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        std::fs::metadata(path)?;
        let canonical = std::fs::canonicalize(path)?;
        Ok(self
            .read_mountinfo()?
            .iter()
            .any(|m| m.mount_point == canonical))
    }

    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        let (bind, remount, data) = parse_options(options);
        let fs_type = (!fs_type.is_empty()).then_some(fs_type);

        mount(Some(source), target, fs_type, bind, data.as_deref())?;

        // The kernel ignores restricting flags on the initial bind; they only
        // apply through a remount of the bind.
        if !remount.is_empty() {
            if let Err(e) = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | remount,
                None::<&str>,
            ) {
                // Do not leave a writable mount behind a read-only request.
                if let Err(rollback) = umount(target) {
                    error!(
                        path = %target.display(),
                        remount_error = %e,
                        error = %rollback,
                        "failed to roll back bind mount, target left with initial flags"
                    );
                    return Err(io::Error::new(
                        io::Error::from(e).kind(),
                        format!("remount with {remount:?} failed: {e}; rollback unmount failed: {rollback}"),
                    ));
                }
                return Err(e.into());
            }
        }
        debug!(source = %source.display(), target = %target.display(), ?bind, ?remount, "bind mount established");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        umount(target).map_err(io::Error::from)
    }

    fn list_mounts(&self) -> io::Result<Vec<MountPoint>> {
        Ok(self
            .read_mountinfo()?
            .into_iter()
            .map(|m| MountPoint {
                path: m.mount_point,
                device: m.mount_source.unwrap_or_default(),
                fs_type: m.fs_type,
                options: m
                    .mount_options
                    .into_iter()
                    .map(|(key, value)| match value {
                        Some(value) => format!("{key}={value}"),
                        None => key,
                    })
                    .collect(),
            })
            .collect())
    }

    fn mount_refs(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(mountinfo::references_to(&self.read_mountinfo()?, &canonical))
    }
}
