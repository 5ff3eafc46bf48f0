//! Digest-level storage built on top of [`StorageBackend`].
//!
//! Every backend gets these operations through a blanket implementation, so
//! the content-addressing rules are enforced in one place regardless of what
//! is plugged in underneath.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, StorageBackend, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use larder_core::{Digest, DigestHasher};
use std::pin::Pin;
use tracing::{debug, warn};

/// A boxed stream of digests found by a listing.
pub type DigestStream = Pin<Box<dyn Stream<Item = StorageResult<ListedBlob>> + Send>>;

/// Key space a digest is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Content-addressed blobs.
    Cas,
    /// Action Cache entries, keyed by action digest.
    Ac,
}

impl Namespace {
    /// Key prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Cas => "cas",
            Self::Ac => "ac",
        }
    }

    /// Object key for a digest in this namespace.
    pub fn key(&self, digest: &Digest) -> String {
        digest.to_object_key(self.prefix())
    }
}

/// Outcome of a successful create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The blob was written.
    Stored,
    /// The blob was already present; the input was verified and discarded.
    AlreadyPresent,
}

/// A digest found while listing a namespace.
///
/// Action Cache keys carry only the hash, so for [`Namespace::Ac`] the size
/// of `digest` is the stored entry length rather than the action size.
#[derive(Clone, Debug)]
pub struct ListedBlob {
    pub digest: Digest,
    pub meta: ObjectMeta,
}

/// Digest-level operations available on every [`StorageBackend`].
///
/// DO NOT IMPLEMENT THIS TRAIT MANUALLY. It is provided by a blanket
/// implementation.
#[async_trait]
pub trait BlobStore: StorageBackend {
    /// Whether a CAS blob is present with the expected size.
    ///
    /// The empty blob is always present. Objects whose stored size differs
    /// from the digest are reported absent.
    async fn blob_exists(&self, digest: &Digest) -> StorageResult<bool> {
        if digest.is_empty() {
            return Ok(true);
        }
        match self.head(&Namespace::Cas.key(digest)).await {
            Ok(meta) if meta.size == digest.size_bytes() => Ok(true),
            Ok(meta) => {
                warn!(
                    digest = %digest,
                    stored_size = meta.size,
                    "Stored blob size does not match digest, treating as missing"
                );
                Ok(false)
            }
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a CAS blob for reading from `offset`.
    ///
    /// The stream yields exactly `size_bytes - offset` bytes; a backend that
    /// produces fewer or more ends the stream with a length error.
    async fn open_blob(&self, digest: &Digest, offset: u64) -> StorageResult<ByteStream> {
        let size = digest.size_bytes();
        if offset > size {
            return Err(StorageError::InvalidRange(format!(
                "offset {offset} beyond blob size {size}"
            )));
        }
        if digest.is_empty() {
            return Ok(Box::pin(futures::stream::empty()));
        }

        let key = Namespace::Cas.key(digest);
        if offset == size {
            // Nothing to read, but the blob must still exist.
            self.head(&key).await?;
            return Ok(Box::pin(futures::stream::empty()));
        }

        let inner = self.get_stream(&key, offset).await?;
        Ok(exact_length(inner, key, size - offset))
    }

    /// Read a whole CAS blob into memory, verifying its length.
    async fn read_blob(&self, digest: &Digest) -> StorageResult<Bytes> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        let key = Namespace::Cas.key(digest);
        let data = self.get(&key).await?;
        if data.len() as u64 != digest.size_bytes() {
            return Err(StorageError::LengthMismatch {
                key,
                expected: digest.size_bytes(),
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Start a verified upload of a CAS blob.
    ///
    /// When the blob is already stored the upload only checks the bytes it
    /// is given and writes nothing.
    async fn begin_blob(&self, digest: &Digest) -> StorageResult<VerifiedUpload> {
        let key = Namespace::Cas.key(digest);
        let sink = if digest.is_empty() || self.blob_exists(digest).await? {
            None
        } else {
            Some(self.put_stream(&key).await?)
        };
        Ok(VerifiedUpload {
            key,
            digest: *digest,
            hasher: Digest::hasher(),
            sink,
        })
    }

    /// Store a CAS blob from a stream, verifying hash and length.
    ///
    /// The input is always consumed to the end. When the blob already exists
    /// the bytes are verified but not rewritten.
    async fn create_blob(
        &self,
        digest: &Digest,
        mut data: ByteStream,
    ) -> StorageResult<CreateOutcome> {
        let mut upload = self.begin_blob(digest).await?;
        while let Some(chunk) = data.next().await {
            let written = match chunk {
                Ok(chunk) => upload.write(chunk).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                upload.abort().await;
                return Err(e);
            }
        }
        upload.finish().await
    }

    /// Store an in-memory CAS blob, verifying hash and length.
    async fn put_blob(&self, digest: &Digest, data: Bytes) -> StorageResult<CreateOutcome> {
        digest.verify(&Digest::compute(&data))?;
        if digest.is_empty() || self.blob_exists(digest).await? {
            return Ok(CreateOutcome::AlreadyPresent);
        }
        self.put(&Namespace::Cas.key(digest), data).await?;
        Ok(CreateOutcome::Stored)
    }

    /// Delete a stored digest. Used by out-of-band garbage collection.
    async fn delete_blob(&self, namespace: Namespace, digest: &Digest) -> StorageResult<()> {
        self.delete(&namespace.key(digest)).await
    }

    /// List every digest stored under a namespace.
    ///
    /// Objects whose key is not a well-formed digest key (temporary upload
    /// files, foreign objects) are skipped.
    async fn list_blobs(&self, namespace: Namespace) -> StorageResult<DigestStream> {
        let prefix = format!("{}/", namespace.prefix());
        let objects = self.list_stream(&prefix).await?;
        let stream = objects.filter_map(move |item| {
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(object) => parse_listed_key(&prefix, &object.key, object.meta.size)
                        .map(|digest| {
                            Ok(ListedBlob {
                                digest,
                                meta: object.meta,
                            })
                        }),
                    Err(e) => Some(Err(e)),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    /// Load a raw Action Cache entry.
    async fn get_action_entry(&self, action: &Digest) -> StorageResult<Bytes> {
        self.get(&Namespace::Ac.key(action)).await
    }

    /// Store or overwrite a raw Action Cache entry.
    async fn put_action_entry(&self, action: &Digest, entry: Bytes) -> StorageResult<()> {
        self.put(&Namespace::Ac.key(action), entry).await
    }
}

impl<T: StorageBackend + ?Sized> BlobStore for T {}

/// A CAS upload that becomes visible only once its bytes hash to the
/// target digest.
///
/// Dropping it without [`finish`](Self::finish) releases the backend upload.
pub struct VerifiedUpload {
    key: String,
    digest: Digest,
    hasher: DigestHasher,
    /// `None` when the blob is already stored.
    sink: Option<Box<dyn StreamingUpload>>,
}

impl VerifiedUpload {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.hasher.len()
    }

    /// Whether the target was already stored when the upload began.
    pub fn is_draining(&self) -> bool {
        self.sink.is_none()
    }

    /// Hash and forward a chunk. Writing past the digest size fails.
    pub async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let total = self.hasher.len() + data.len() as u64;
        if total > self.digest.size_bytes() {
            return Err(StorageError::LengthMismatch {
                key: self.key.clone(),
                expected: self.digest.size_bytes(),
                actual: total,
            });
        }
        self.hasher.update(&data);
        if let Some(sink) = self.sink.as_mut() {
            sink.write(data).await?;
        }
        Ok(())
    }

    /// Verify everything written and publish the blob.
    ///
    /// On mismatch the backend upload is aborted and nothing becomes visible.
    pub async fn finish(self) -> StorageResult<CreateOutcome> {
        let Self {
            key,
            digest,
            hasher,
            sink,
        } = self;
        let verified = digest.verify(&hasher.finalize()).map_err(StorageError::from);
        match sink {
            None => {
                verified?;
                debug!(digest = %digest, "Blob already present, input verified");
                Ok(CreateOutcome::AlreadyPresent)
            }
            Some(sink) => {
                if let Err(e) = verified {
                    abort_quietly(sink, &key).await;
                    return Err(e);
                }
                sink.finish().await?;
                Ok(CreateOutcome::Stored)
            }
        }
    }

    /// Abandon the upload.
    pub async fn abort(self) {
        if let Some(sink) = self.sink {
            abort_quietly(sink, &self.key).await;
        }
    }
}

impl std::fmt::Debug for VerifiedUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedUpload")
            .field("digest", &self.digest)
            .field("received", &self.received())
            .field("draining", &self.is_draining())
            .finish()
    }
}

async fn abort_quietly(upload: Box<dyn StreamingUpload>, key: &str) {
    if let Err(e) = upload.abort().await {
        warn!(key = %key, error = %e, "Failed to abort streaming upload");
    }
}

/// Wrap a backend stream so it yields exactly `expected` bytes.
fn exact_length(inner: ByteStream, key: String, expected: u64) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut inner = inner;
        let mut seen: u64 = 0;
        while let Some(chunk) = inner.next().await {
            let chunk = chunk?;
            seen += chunk.len() as u64;
            if seen > expected {
                Err::<(), _>(StorageError::LengthMismatch {
                    key: key.clone(),
                    expected,
                    actual: seen,
                })?;
            }
            yield chunk;
        }
        if seen != expected {
            Err::<(), _>(StorageError::LengthMismatch {
                key: key.clone(),
                expected,
                actual: seen,
            })?;
        }
    };
    Box::pin(stream)
}

/// Recover a digest from `<ns>/<hh>/<hash>`.
fn parse_listed_key(prefix: &str, key: &str, size: u64) -> Option<Digest> {
    let rest = key.strip_prefix(prefix)?;
    let (fanout, hash) = rest.split_once('/')?;
    if hash.len() != 64 || !hash.starts_with(fanout) || fanout.len() != 2 {
        return None;
    }
    Digest::parse(hash, i64::try_from(size).ok()?).ok()
}
