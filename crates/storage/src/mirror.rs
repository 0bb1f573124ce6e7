//! Local mirror directory.

use crate::error::{StorageError, StorageResult};
use lockmirror_core::Spec;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// A flat directory of mirror entries, one file per spec.
#[derive(Clone, Debug)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    /// Open the mirror directory, creating it if absent.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Path of the entry for a spec.
    pub fn entry_path(&self, spec: &Spec) -> PathBuf {
        spec.mirror_path(&self.root)
    }

    /// List every regular file in the mirror directory.
    ///
    /// Paths are returned joined onto the mirror root, in the same form as
    /// [`MirrorStore::entry_path`]. Subdirectories and symlinks are ignored.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn list(&self) -> StorageResult<BTreeSet<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut files = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.insert(self.root.join(entry.file_name()));
            }
        }
        Ok(files)
    }

    /// Delete an entry.
    #[instrument(skip(self))]
    pub async fn delete(&self, path: &Path) -> StorageResult<()> {
        self.check_entry(path)?;
        fs::remove_file(path).await?;
        Ok(())
    }

    /// Start writing an entry.
    ///
    /// Data goes to a uniquely named temporary file next to the entry; the
    /// entry itself only changes when the upload is finished.
    #[instrument(skip(self))]
    pub async fn begin_write(&self, path: &Path) -> StorageResult<MirrorUpload> {
        self.check_entry(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        let file = fs::File::create(&temp_path).await?;

        Ok(MirrorUpload {
            file,
            temp_path,
            final_path: path.to_path_buf(),
            bytes_written: 0,
        })
    }

    /// Entries must sit directly inside the mirror directory.
    fn check_entry(&self, path: &Path) -> StorageResult<()> {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(_)) if parent == self.root => Ok(()),
            _ => Err(StorageError::InvalidPath(path.to_path_buf())),
        }
    }
}

/// An in-progress entry write.
pub struct MirrorUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

impl MirrorUpload {
    /// Append data.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and move the temporary file over the entry.
    pub async fn finish(self) -> StorageResult<u64> {
        let Self {
            mut file,
            temp_path,
            final_path,
            bytes_written,
        } = self;

        // Ensure all data is on disk before the rename makes it visible
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        let result = match synced {
            Ok(()) => fs::rename(&temp_path, &final_path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(bytes_written)
    }

    /// Discard the temporary file, leaving any existing entry untouched.
    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}
