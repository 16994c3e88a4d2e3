//! In-memory [`MountSubsystem`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{MountPoint, MountSubsystem};

#[derive(Debug, Clone)]
struct FakeMount {
    source: PathBuf,
    target: PathBuf,
    fs_type: String,
    options: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    mounts: Vec<FakeMount>,
    mount_calls: usize,
    unmount_calls: usize,
    fail_mount: bool,
    fail_unmount: bool,
}

/// Mount table kept in memory.
///
/// Target existence is still checked against the real filesystem so the
/// "create missing target" path behaves as on a host.  Failures can be
/// injected for mount and unmount independently.
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<FakeState>,
}

impl FakeMounter {
    /// Create an empty mount table.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an external bind of `source` at `target`.
    pub fn add_mount(&self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state().mounts.push(FakeMount {
            source: source.into(),
            target: target.into(),
            fs_type: "ext4".into(),
            options: vec!["bind".into()],
        });
    }

    /// Drop every mount at `target` without going through `unmount`.
    pub fn remove_mount(&self, target: &Path) {
        self.state().mounts.retain(|m| m.target != target);
    }

    /// Make `bind_mount` fail with `EPERM`.
    pub fn set_fail_mount(&self, fail: bool) {
        self.state().fail_mount = fail;
    }

    /// Make `unmount` fail with `EBUSY` while leaving the table untouched.
    pub fn set_fail_unmount(&self, fail: bool) {
        self.state().fail_unmount = fail;
    }

    /// Number of successful `bind_mount` calls.
    pub fn mount_calls(&self) -> usize {
        self.state().mount_calls
    }

    /// Number of `unmount` calls, successful or not.
    pub fn unmount_calls(&self) -> usize {
        self.state().unmount_calls
    }

    /// Whether anything is mounted at `target`.
    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state().mounts.iter().any(|m| m.target == target)
    }
}

impl MountSubsystem for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        std::fs::metadata(path)?;
        Ok(self.is_mounted(path))
    }

    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_mount {
            return Err(io::Error::from_raw_os_error(nix::libc::EPERM));
        }
        state.mount_calls += 1;
        state.mounts.push(FakeMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_owned(),
            options: options.to_vec(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let mut state = self.state();
        state.unmount_calls += 1;
        if state.fail_unmount {
            return Err(io::Error::from_raw_os_error(nix::libc::EBUSY));
        }
        // Unmount detaches only the top-most mount at the target.
        match state.mounts.iter().rposition(|m| m.target == target) {
            Some(idx) => {
                state.mounts.remove(idx);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(nix::libc::EINVAL)),
        }
    }

    fn list_mounts(&self) -> io::Result<Vec<MountPoint>> {
        Ok(self
            .state()
            .mounts
            .iter()
            .map(|m| MountPoint {
                path: m.target.clone(),
                device: m.source.display().to_string(),
                fs_type: m.fs_type.clone(),
                options: m.options.clone(),
            })
            .collect())
    }

    fn mount_refs(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .state()
            .mounts
            .iter()
            .filter(|m| m.source == path && m.target != path)
            .map(|m| m.target.clone())
            .collect())
    }
}
