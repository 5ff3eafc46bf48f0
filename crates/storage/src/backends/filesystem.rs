//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ListedObject, ObjectMeta, ObjectStream, StorageBackend, StreamingUpload,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Marker separating a final file name from its temporary suffix.
pub const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`, creating it if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Runs the checks on the blocking pool since `canonicalize` and
    /// `symlink_metadata` are synchronous.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Returns an error if the key would escape the storage root, including
    /// through symlinks.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Walk up from the path itself to the nearest existing entry and make
        // sure it resolves inside the root.
        let mut candidate = Some(path.as_path());
        while let Some(current) = candidate {
            match std::fs::symlink_metadata(current) {
                Ok(meta) => {
                    let canonical = current.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
            candidate = current.parent();
        }

        Ok(path)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// A unique sibling path for writing `path` before it is renamed into place.
    fn temp_path_for(path: &Path) -> PathBuf {
        let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), suffix))
                .unwrap_or_else(|| suffix.clone()),
        )
    }
}

fn not_found_or_io(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(not_found_or_io(key))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(not_found_or_io(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path).await.map_err(not_found_or_io(key))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        // Write to a uniquely named temp file, fsync, then rename so readers
        // never observe a partial object.
        let temp_path = Self::temp_path_for(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = Self::temp_path_for(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            temp_path,
            final_path: path,
            bytes_written: 0,
            completed: false,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(not_found_or_io(key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<ObjectStream> {
        let base_path = self.key_path(prefix.trim_end_matches('/')).await?;
        let root = self.root.clone();

        let base_path_exists = match fs::try_exists(&base_path).await {
            Ok(exists) => exists,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::Io(e)),
        };

        let stream = async_stream::try_stream! {
            if !base_path_exists {
                return;
            }

            let mut stack = vec![base_path];
            while let Some(dir) = stack.pop() {
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    // file_type() does not follow symlinks, which are skipped.
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        stack.push(path);
                    } else if file_type.is_file()
                        && let Ok(rel) = path.strip_prefix(&root)
                    {
                        let metadata = entry.metadata().await?;
                        let key = rel
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        yield ListedObject {
                            key,
                            meta: ObjectMeta {
                                size: metadata.len(),
                                last_modified: metadata.modified().ok().map(|t| t.into()),
                            },
                        };
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        // Probe writability with a throwaway file.
        let probe = Self::temp_path_for(&self.root.join(".larder-health-check"));
        fs::write(&probe, b"health-check").await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not writable: {e}"),
            ))
        })?;
        let _ = fs::remove_file(&probe).await;

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    completed: bool,
}

impl FilesystemUpload {
    fn file(&mut self) -> StorageResult<&mut fs::File> {
        self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("streaming upload already closed"))
        })
    }
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file()?.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let file = self.file()?;
        file.sync_all().await?;
        self.file = None;
        fs::rename(&self.temp_path, &self.final_path).await?;
        self.completed = true;
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file = None;
        self.completed = true;
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

impl Drop for FilesystemUpload {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.temp_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.temp_path.display(),
                error = %e,
                "Failed to remove temp file of dropped upload"
            );
        }
    }
}
