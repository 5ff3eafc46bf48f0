//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of listed objects.
pub type ObjectStream = Pin<Box<dyn Stream<Item = StorageResult<ListedObject>> + Send>>;

/// Raw keyed object storage.
///
/// Keys are `/`-separated relative paths. Implementations must make objects
/// visible atomically: a reader sees either nothing or the complete object.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream starting at `offset`.
    ///
    /// Dropping the stream releases the underlying file handle or connection.
    async fn get_stream(&self, key: &str, offset: u64) -> StorageResult<ByteStream>;

    /// Put an object atomically, replacing any previous value.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload. The object becomes visible only after
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects under a prefix, lazily.
    async fn list_stream(&self, prefix: &str) -> StorageResult<ObjectStream>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called once at startup; the server refuses to start when it fails.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// An object returned by a listing.
#[derive(Clone, Debug)]
pub struct ListedObject {
    pub key: String,
    pub meta: ObjectMeta,
}

/// Trait for streaming uploads.
///
/// Dropping an upload that was neither finished nor aborted releases its
/// temporary state without making the object visible.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
