//! Bind reference lookup over procfs mountinfo entries.
//!
//! The mountinfo `root` field is the root of the mount *within* its
//! filesystem, which is what makes bind mounts distinguishable: a bind of
//! `/data/vol-1` shows the same device as its source and root `/data/vol-1`
//! (relative to that device).

use std::path::{Path, PathBuf};

use procfs::process::MountInfo;

/// Find every mount point that exposes the same directory as `path`.
///
/// `path` must already be canonical.  The mount containing `path` is the one
/// with the longest mount point prefix; combined with the remaining relative
/// path it yields the directory's root within its device.  Every other mount
/// of that device with the same root is a reference.
pub fn references_to(mounts: &[MountInfo], path: &Path) -> Vec<PathBuf> {
    let Some(containing) = mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
    else {
        return Vec::new();
    };

    let Ok(relative) = path.strip_prefix(&containing.mount_point) else {
        return Vec::new();
    };
    let bind_root = Path::new(&containing.root).join(relative);

    mounts
        .iter()
        .filter(|m| {
            m.majmin == containing.majmin
                && Path::new(&m.root) == bind_root
                && m.mount_point != path
        })
        .map(|m| m.mount_point.clone())
        .collect()
}
