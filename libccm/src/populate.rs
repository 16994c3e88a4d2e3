//! Bundle materialization.
//!
//! [`ContentPopulator::populate`] turns a named bundle into files under
//! `<data_root>/<volume-id>/`, records a SHA-512 digest per file, and only
//! then writes the volume's metadata record.  The metadata record is the
//! commit marker: if anything fails before it, the data directory is left for
//! the reconciler to reclaim.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::CcmError;
use crate::metadata::{MetadataStore, sync_dir};
use crate::source::ConfigSource;
use crate::types::{ContentRecord, DirectoryRecord, VolumeId, VolumeRecord, is_path_component};

/// Permission bits of per-volume data directories.
const DATA_DIR_MODE: u32 = 0o755;

/// Fetches bundles and writes them into per-volume data directories.
pub struct ContentPopulator<S> {
    source: Arc<S>,
    data_root: PathBuf,
    metadata: MetadataStore,
    default_mode: u32,
}

impl<S: ConfigSource> ContentPopulator<S> {
    /// Create a populator writing below `data_root`.
    pub fn new(
        source: Arc<S>,
        data_root: impl Into<PathBuf>,
        metadata: MetadataStore,
        default_mode: u32,
    ) -> Self {
        Self {
            source,
            data_root: data_root.into(),
            metadata,
            default_mode,
        }
    }

    /// Data directory of one volume.
    pub fn data_dir(&self, volume_id: &VolumeId) -> PathBuf {
        self.data_root.join(volume_id.as_str())
    }

    /// Materialize the bundle named by `record.name` and persist the record.
    ///
    /// The returned record carries the data directory and one
    /// [`ContentRecord`] per bundle key, sorted by file name.
    ///
    /// Once `cancel` fires the fetch is abandoned, or the current file write
    /// finishes and no further files or metadata are written.
    #[instrument(skip_all, fields(volume_id = %record.volume_id, name = %record.name))]
    pub async fn populate(
        &self,
        mut record: VolumeRecord,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord, CcmError> {
        let mode = record.file_mode(self.default_mode)?;
        let bundle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(stopped(&record.volume_id)),
            bundle = self.source.fetch_by_name(&record.name) => bundle?,
        };

        let dir = self.data_dir(&record.volume_id);
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(DATA_DIR_MODE)
            .create(&dir)
            .await
            .map_err(|e| CcmError::write(dir.display(), e))?;

        let mut contents = Vec::with_capacity(bundle.len());
        for (filename, content) in &bundle {
            if cancel.is_cancelled() {
                return Err(stopped(&record.volume_id));
            }
            if !is_path_component(filename) {
                return Err(CcmError::WriteFailed {
                    path: dir.join(filename).display().to_string(),
                    reason: "bundle key is not a valid file name".into(),
                });
            }
            let path = dir.join(filename);
            write_file(&path, content.as_bytes(), mode).await?;
            contents.push(ContentRecord {
                filename: filename.clone(),
                sha512: hex::encode(Sha512::digest(content.as_bytes())),
            });
            debug!(path = %path.display(), "file written");
        }

        let keys: HashSet<&str> = bundle.keys().map(String::as_str).collect();
        remove_stale_files(&dir, &keys).await?;
        sync_dir(&dir).await?;
        if cancel.is_cancelled() {
            return Err(stopped(&record.volume_id));
        }

        record.directory = DirectoryRecord {
            path: dir,
            contents,
        };
        self.metadata.write_record(&record).await?;

        info!(files = record.directory.contents.len(), "volume populated");
        Ok(record)
    }
}

fn stopped(volume_id: &VolumeId) -> CcmError {
    CcmError::Cancelled(format!("population of volume {volume_id:?} stopped"))
}

async fn write_file(path: &std::path::Path, content: &[u8], mode: u32) -> Result<(), CcmError> {
    let err = |e: std::io::Error| CcmError::write(path.display(), e);

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .map_err(err)?;
    file.write_all(content).await.map_err(err)?;
    // The open mode is filtered by the umask and ignored for existing files.
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await
        .map_err(err)?;
    file.sync_all().await.map_err(err)
}

/// Remove regular files of `dir` that are not in `keep`.
async fn remove_stale_files(dir: &std::path::Path, keep: &HashSet<&str>) -> Result<(), CcmError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CcmError::write(dir.display(), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CcmError::write(dir.display(), e))?
    {
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| keep.contains(n)) {
            continue;
        }
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| CcmError::write(entry.path().display(), e))?;
        if !file_type.is_file() {
            continue;
        }
        tokio::fs::remove_file(entry.path())
            .await
            .map_err(|e| CcmError::write(entry.path().display(), e))?;
        debug!(path = %entry.path().display(), "stale file removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use chrono::Utc;
    use std::path::Path;

    fn record(name: &str, mode: &str) -> VolumeRecord {
        VolumeRecord {
            name: name.into(),
            created: Utc::now(),
            mode: mode.into(),
            volume_id: VolumeId::from("vol-1"),
            target_path: PathBuf::from("/target"),
            fs_type: "ext4".into(),
            bind_opts: vec!["bind".into(), "ro".into()],
            directory: DirectoryRecord::default(),
        }
    }

    fn populator(root: &Path, source: MemorySource) -> ContentPopulator<MemorySource> {
        ContentPopulator::new(
            Arc::new(source),
            root.join("data"),
            MetadataStore::new(root.join("metadata")),
            0o644,
        )
    }

    fn sha512_hex(s: &str) -> String {
        hex::encode(Sha512::digest(s.as_bytes()))
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn writes_every_key_with_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello"), ("b.txt", "world")]);
        let pop = populator(tmp.path(), source);

        let rec = pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap();
        let dir = tmp.path().join("data/vol-1");
        assert_eq!(rec.directory.path, dir);
        assert_eq!(file_names(&dir), vec!["a.txt", "b.txt"]);
        assert_eq!(std::fs::read_to_string(dir.join("a.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(dir.join("b.txt")).unwrap(), "world");

        assert_eq!(
            rec.directory.contents,
            vec![
                ContentRecord {
                    filename: "a.txt".into(),
                    sha512: sha512_hex("hello"),
                },
                ContentRecord {
                    filename: "b.txt".into(),
                    sha512: sha512_hex("world"),
                },
            ]
        );

        let stored = MetadataStore::new(tmp.path().join("metadata"))
            .read_record(&rec.volume_id)
            .await
            .unwrap();
        assert_eq!(stored, rec);
    }

    #[tokio::test]
    async fn empty_bundle_creates_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("empty", Vec::<(String, String)>::new());
        let pop = populator(tmp.path(), source);

        let rec = pop.populate(record("empty", ""), &CancellationToken::new()).await.unwrap();
        assert!(rec.directory.contents.is_empty());
        assert!(file_names(&rec.directory.path).is_empty());
        assert!(tmp.path().join("metadata/vol-1/metadata.json").exists());
    }

    #[tokio::test]
    async fn applies_file_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello")]);
        let pop = populator(tmp.path(), source);

        pop.populate(record("cm", "0600"), &CancellationToken::new()).await.unwrap();
        let meta = std::fs::metadata(tmp.path().join("data/vol-1/a.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);

        pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap();
        let meta = std::fs::metadata(tmp.path().join("data/vol-1/a.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
    }

    #[tokio::test]
    async fn missing_bundle_fails_without_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let pop = populator(tmp.path(), MemorySource::new());

        let err = pop.populate(record("absent", ""), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, CcmError::SourceNotFound("absent".into()));
        assert!(!tmp.path().join("data/vol-1").exists());
        assert!(!tmp.path().join("metadata/vol-1").exists());
    }

    #[tokio::test]
    async fn unavailable_source_is_fetch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello")]);
        source.set_unavailable(Some("connection refused"));
        let pop = populator(tmp.path(), source);

        assert!(matches!(
            pop.populate(record("cm", ""), &CancellationToken::new()).await,
            Err(CcmError::SourceFetch { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_key_aborts_before_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello"), ("../escape", "x")]);
        let pop = populator(tmp.path(), source);

        let err = pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CcmError::WriteFailed { .. }));
        assert!(!tmp.path().join("data/escape").exists());
        assert!(!tmp.path().join("metadata/vol-1").exists());
    }

    #[tokio::test]
    async fn write_failure_leaves_partial_data_without_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello"), ("b.txt", "world")]);
        let pop = populator(tmp.path(), source);

        // A directory squatting on a key's file name makes that write fail.
        std::fs::create_dir_all(tmp.path().join("data/vol-1/b.txt")).unwrap();

        let err = pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CcmError::WriteFailed { .. }));
        assert!(tmp.path().join("data/vol-1/a.txt").exists());
        assert!(!tmp.path().join("metadata/vol-1").exists());
    }

    #[tokio::test]
    async fn republish_drops_removed_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(
            MemorySource::new().with_bundle("cm", [("a.txt", "hello"), ("b.txt", "world")]),
        );
        let pop = ContentPopulator::new(
            Arc::clone(&source),
            tmp.path().join("data"),
            MetadataStore::new(tmp.path().join("metadata")),
            0o644,
        );
        pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap();

        source.insert("cm", [("a.txt", "hello again")]);
        let rec = pop.populate(record("cm", ""), &CancellationToken::new()).await.unwrap();

        assert_eq!(file_names(&rec.directory.path), vec!["a.txt"]);
        assert_eq!(rec.directory.contents.len(), 1);
        assert_eq!(rec.directory.contents[0].sha512, sha512_hex("hello again"));
    }

    #[tokio::test]
    async fn invalid_mode_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_bundle("cm", [("a.txt", "hello")]);
        let pop = populator(tmp.path(), source);

        assert!(matches!(
            pop.populate(record("cm", "rw-r--r--"), &CancellationToken::new()).await,
            Err(CcmError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_populate_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::new().with_bundle("cm", [("a.txt", "hello")]));
        let pop = ContentPopulator::new(
            Arc::clone(&source),
            tmp.path().join("data"),
            MetadataStore::new(tmp.path().join("metadata")),
            0o644,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pop.populate(record("cm", ""), &cancel).await.unwrap_err();
        assert!(matches!(err, CcmError::Cancelled(_)));
        assert_eq!(source.fetch_count(), 0);
        assert!(!tmp.path().join("data/vol-1").exists());
        assert!(!tmp.path().join("metadata/vol-1").exists());
    }
}
