//! Durable per-volume metadata.
//!
//! Each volume owns `<metadata_root>/<volume-id>/metadata.json`, a single
//! [`VolumeRecord`] document.  Writes go to a temporary sibling, are synced,
//! and then renamed into place, so a reader sees either the previous record or
//! the complete new one.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::config::DEFAULT_FILE_MODE;
use crate::error::CcmError;
use crate::types::{VolumeId, VolumeRecord};

/// Name of the record file inside a volume's metadata directory.
pub const METADATA_FILE: &str = "metadata.json";

const METADATA_TMP_FILE: &str = "metadata.json.tmp";

/// Reads and writes [`VolumeRecord`]s under a metadata root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Create a store rooted at `root` (usually `<storage_dir>/metadata`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of all metadata directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata directory of one volume.
    pub fn volume_dir(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(volume_id.as_str())
    }

    /// Persist `record` as the sole document of its metadata directory,
    /// creating the directory if absent.
    #[instrument(skip_all, fields(volume_id = %record.volume_id))]
    pub async fn write_record(&self, record: &VolumeRecord) -> Result<(), CcmError> {
        let dir = self.volume_dir(&record.volume_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CcmError::write(dir.display(), e))?;

        let json = serde_json::to_vec_pretty(record).map_err(CcmError::internal)?;

        let tmp = dir.join(METADATA_TMP_FILE);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CcmError::write(tmp.display(), e))?;
        file.write_all(&json)
            .await
            .map_err(|e| CcmError::write(tmp.display(), e))?;
        file.set_permissions(std::fs::Permissions::from_mode(DEFAULT_FILE_MODE))
            .await
            .map_err(|e| CcmError::write(tmp.display(), e))?;
        file.sync_all()
            .await
            .map_err(|e| CcmError::write(tmp.display(), e))?;
        drop(file);

        let target = dir.join(METADATA_FILE);
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| CcmError::write(target.display(), e))?;
        sync_dir(&dir).await?;

        debug!(path = %target.display(), "metadata written");
        Ok(())
    }

    /// Load the record of `volume_id`.
    ///
    /// A missing file is [`CcmError::MetadataNotFound`]; undecodable content
    /// is [`CcmError::MetadataCorrupt`].
    pub async fn read_record(&self, volume_id: &VolumeId) -> Result<VolumeRecord, CcmError> {
        let path = self.volume_dir(volume_id).join(METADATA_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CcmError::MetadataNotFound(volume_id.to_string()));
            }
            Err(e) => {
                return Err(CcmError::Internal(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| CcmError::MetadataCorrupt {
            volume_id: volume_id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Flush directory entries (creations, renames) of `dir` to disk.
pub(crate) async fn sync_dir(dir: &Path) -> Result<(), CcmError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| CcmError::write(dir.display(), e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| CcmError::write(dir.display(), e))
}
