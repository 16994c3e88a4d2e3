//! Engine configuration.
//!
//! The plugin keeps all persisted state under one storage directory:
//!
//! ```text
//! <storage_dir>/
//!   data/<volume-id>/<filename>...       # materialized bundle, bind-mount source
//!   metadata/<volume-id>/metadata.json   # VolumeRecord, written last
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Default root for data and metadata directories.
pub const DEFAULT_STORAGE_DIR: &str = "/csi-ccm-data";

/// Permission bits for content files when the volume context sets none.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Filesystem type recorded when the capability leaves it empty.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// How long one request may run before its cancellation token fires.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by every engine component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the `data/` and `metadata/` trees.
    pub storage_dir: PathBuf,
    /// Fallback permission bits for content files.
    pub default_mode: u32,
    /// Fallback filesystem type for the bind mount.
    pub default_fs_type: String,
    /// Identifier reported by `NodeGetInfo`.
    pub node_id: String,
    /// Per-request deadline enforced by the transport.
    pub request_timeout: Duration,
}

impl Config {
    /// Create a configuration rooted at `storage_dir` with default settings.
    pub fn new(storage_dir: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            default_mode: DEFAULT_FILE_MODE,
            default_fs_type: DEFAULT_FS_TYPE.to_owned(),
            node_id: node_id.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Directory holding one sub-directory of content per volume.
    pub fn data_dir(&self) -> PathBuf {
        self.storage_dir.join("data")
    }

    /// Directory holding one sub-directory of metadata per volume.
    pub fn metadata_dir(&self) -> PathBuf {
        self.storage_dir.join("metadata")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_DIR, String::new())
    }
}
