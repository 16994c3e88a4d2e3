//! Core types: volume identity, requests, and the persisted volume record.
//!
//! Everything here is [`Serialize`]/[`Deserialize`]; requests travel over the
//! local socket as JSON and [`VolumeRecord`] is the on-disk `metadata.json`
//! document.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CcmError;

/// Volume context key carrying the config bundle name.
pub const CONTEXT_NAME: &str = "name";

/// Volume context key carrying the optional octal file mode.
pub const CONTEXT_MODE: &str = "mode";

/// Largest permission value accepted for materialized files.
const MAX_FILE_MODE: u32 = 0o7777;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// The ID names the volume's data and metadata directories, so it must be a
/// single path component (see [`is_path_component`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the caller left the ID empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Return `true` when `name` can be used verbatim as one directory entry:
/// non-empty, not `.` or `..`, and free of `/` and NUL.
pub fn is_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// How the workload wants the volume presented.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeCapability {
    /// A mounted filesystem.
    Mount(MountVolume),
    /// A raw block device; not supported by this plugin.
    Block,
}

/// Parameters of a filesystem-mode volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountVolume {
    /// Filesystem type; empty selects the configured default.
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noexec"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to materialize a config bundle and bind-mount it at `target_path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Path where the workload expects the volume.
    pub target_path: String,
    /// Requested capability; must be present and mount-typed.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context; carries [`CONTEXT_NAME`] and optionally [`CONTEXT_MODE`].
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Durable record of one published volume, stored as `metadata.json`.
///
/// Written only after every content file is on disk, so its presence marks a
/// completed populate.  Later requests (notably unpublish) lack most of the
/// publish-time details and read them back from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Name of the source config bundle.
    pub name: String,
    /// When the publish request arrived.
    pub created: DateTime<Utc>,
    /// Octal permission string for materialized files; empty means default.
    #[serde(default)]
    pub mode: String,
    /// Correlation key across data dir, metadata dir, and mount table.
    pub volume_id: VolumeId,
    /// Where the volume is bind-mounted for the consumer.
    pub target_path: PathBuf,
    /// Filesystem type passed to the mount call.
    pub fs_type: String,
    /// Mount options; always contains `bind`.
    #[serde(default)]
    pub bind_opts: Vec<String>,
    /// Materialized content.
    #[serde(default)]
    pub directory: DirectoryRecord,
}

impl VolumeRecord {
    /// Resolve the permission bits for content files.
    ///
    /// An empty mode yields `default`.  An unparsable or out-of-range mode
    /// returns an error; callers decide whether to fall back.
    pub fn file_mode(&self, default: u32) -> Result<u32, CcmError> {
        if self.mode.is_empty() {
            return Ok(default);
        }
        match u32::from_str_radix(&self.mode, 8) {
            Ok(mode) if mode <= MAX_FILE_MODE => Ok(mode),
            Ok(_) => Err(CcmError::InvalidArgument(format!(
                "mode {:?} for bundle {:?} exceeds {MAX_FILE_MODE:o}",
                self.mode, self.name
            ))),
            Err(e) => Err(CcmError::InvalidArgument(format!(
                "failed to parse mode {:?} for bundle {:?}: {e}",
                self.mode, self.name
            ))),
        }
    }
}

/// The data directory of a volume and the files written into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// Absolute data directory path (source of the bind mount).
    pub path: PathBuf,
    /// One entry per materialized file.
    #[serde(rename = "files", default)]
    pub contents: Vec<ContentRecord>,
}

/// One materialized file and the hex SHA-512 of its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRecord {
    /// File name, equal to the bundle key.
    pub filename: String,
    /// Lower-case hex SHA-512 digest.
    pub sha512: String,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"ccm.csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the plugin's identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// No optional service is offered.
    Unknown,
}

/// Capabilities advertised by the node service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// No optional node RPC is offered (no staging, stats, or expansion).
    Unknown,
}

/// Information about the node on which the plugin runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
}

/// Usage figures of a published volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub bytes_total: u64,
    pub bytes_used: u64,
    pub bytes_available: u64,
}
