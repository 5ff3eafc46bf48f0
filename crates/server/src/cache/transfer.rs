//! ByteStream transfers.
//!
//! A write is driven by a [`TransferSession`] owned by the RPC future:
//!
//! ```text
//! Init -> Receiving -> Committed
//!                   \-> Aborted
//! ```
//!
//! The session keeps a tail window of the most recent bytes so retransmitted
//! chunks can be checked against what was already accepted. Dropping a
//! session that has not committed releases the backend upload.

use super::CacheEx;
use crate::error::{CacheError, CacheResult};
use crate::metrics::{ACTIVE_TRANSFERS, CAS_BYTES_READ, CAS_BYTES_WRITTEN, CAS_DEDUPLICATED_WRITES};
use crate::proto::bytestream::WriteRequest;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use larder_core::{Digest, ReadResource, WriteResource};
use larder_storage::{BlobStore, ByteStream, CreateOutcome, VerifiedUpload};
use std::pin::Pin;
use tracing::{debug, instrument};

/// Stream of chunks produced by a ByteStream read.
pub type ReadStream = Pin<Box<dyn Stream<Item = CacheResult<Bytes>> + Send>>;

/// Lifecycle of a write session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, no bytes accepted yet.
    Init,
    Receiving,
    Committed,
    Aborted,
}

/// Result of QueryWriteStatus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteStatus {
    pub committed_size: i64,
    pub complete: bool,
}

/// State of one in-flight ByteStream write.
pub struct TransferSession {
    resource_name: String,
    target: Digest,
    state: SessionState,
    /// Present until the session commits or aborts.
    upload: Option<VerifiedUpload>,
    tail: BytesMut,
    window: usize,
}

impl TransferSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the target was already stored when the session opened.
    pub fn is_draining(&self) -> bool {
        self.upload.as_ref().is_some_and(VerifiedUpload::is_draining)
    }

    fn received(&self) -> u64 {
        self.upload.as_ref().map_or(0, VerifiedUpload::received)
    }

    /// Accept a chunk written at `offset`.
    ///
    /// Offsets below the accepted count are retransmissions; the overlapping
    /// bytes must match the tail window. Any error aborts the session.
    pub async fn append(&mut self, offset: i64, data: Bytes) -> CacheResult<()> {
        match self.state {
            SessionState::Init | SessionState::Receiving => {}
            state => {
                return Err(CacheError::FailedPrecondition(format!(
                    "write session is {state:?}"
                )));
            }
        }
        self.state = SessionState::Receiving;
        let received = self.received();

        let Ok(offset) = u64::try_from(offset) else {
            return Err(self
                .fail(CacheError::InvalidArgument(format!(
                    "negative write offset {offset}"
                )))
                .await);
        };
        if offset > received {
            return Err(self
                .fail(CacheError::FailedPrecondition(format!(
                    "write offset {offset} is past the {received} bytes received"
                )))
                .await);
        }

        let mut data = data;
        if offset < received {
            if let Err(e) = self.check_retransmission(offset, &data) {
                return Err(self.fail(e).await);
            }
            let overlap = usize::try_from(received - offset)
                .unwrap_or(usize::MAX)
                .min(data.len());
            data.advance(overlap);
        }
        if data.is_empty() {
            return Ok(());
        }

        let total = received + data.len() as u64;
        if total > self.target.size_bytes() {
            return Err(self
                .fail(CacheError::InvalidArgument(format!(
                    "write of {total} bytes exceeds the declared size {}",
                    self.target.size_bytes()
                )))
                .await);
        }

        self.remember(&data);
        let written = match self.upload.as_mut() {
            Some(upload) => upload.write(data).await,
            None => Ok(()),
        };
        if let Err(e) = written {
            return Err(self.fail(e.into()).await);
        }
        Ok(())
    }

    /// Verify the received bytes and make the blob visible.
    pub async fn commit(&mut self) -> CacheResult<u64> {
        let upload = match (self.state, self.upload.take()) {
            (SessionState::Init | SessionState::Receiving, Some(upload)) => upload,
            (state, _) => {
                return Err(CacheError::FailedPrecondition(format!(
                    "write session is {state:?}"
                )));
            }
        };

        let expected = self.target;
        if upload.received() != expected.size_bytes() {
            let received = upload.received();
            upload.abort().await;
            self.state = SessionState::Aborted;
            return Err(CacheError::DataLoss(format!(
                "finished after {received} of {} bytes",
                expected.size_bytes()
            )));
        }

        match upload.finish().await {
            Ok(CreateOutcome::Stored) => CAS_BYTES_WRITTEN.inc_by(expected.size_bytes()),
            Ok(CreateOutcome::AlreadyPresent) => CAS_DEDUPLICATED_WRITES.inc(),
            Err(e) => {
                self.state = SessionState::Aborted;
                debug!(digest = %expected, error = %e, "Write session aborted");
                return Err(e.into());
            }
        }
        self.state = SessionState::Committed;
        debug!(digest = %expected, "Write committed");
        Ok(expected.size_bytes())
    }

    /// Abort the session, releasing the backend upload.
    pub async fn abort(&mut self) {
        if matches!(self.state, SessionState::Committed | SessionState::Aborted) {
            return;
        }
        self.state = SessionState::Aborted;
        if let Some(upload) = self.upload.take() {
            upload.abort().await;
        }
    }

    async fn fail(&mut self, err: CacheError) -> CacheError {
        debug!(digest = %self.target, error = %err, "Write session aborted");
        self.abort().await;
        err
    }

    fn check_retransmission(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        let window_start = self.received() - self.tail.len() as u64;
        if offset < window_start {
            return Err(CacheError::InvalidArgument(format!(
                "retransmission at offset {offset} is older than the retained window"
            )));
        }
        let from = usize::try_from(offset - window_start).unwrap_or(usize::MAX);
        let overlap = (self.tail.len() - from).min(data.len());
        if self.tail[from..from + overlap] != data[..overlap] {
            return Err(CacheError::InvalidArgument(format!(
                "retransmission at offset {offset} does not match received data"
            )));
        }
        Ok(())
    }

    fn remember(&mut self, data: &[u8]) {
        if data.len() >= self.window {
            self.tail.clear();
            self.tail.extend_from_slice(&data[data.len() - self.window..]);
            return;
        }
        self.tail.extend_from_slice(data);
        if self.tail.len() > self.window {
            let excess = self.tail.len() - self.window;
            self.tail.advance(excess);
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        ACTIVE_TRANSFERS.dec();
        if matches!(self.state, SessionState::Init | SessionState::Receiving) {
            debug!(
                digest = %self.target,
                received = self.received(),
                "Write session dropped before completion"
            );
        }
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("resource_name", &self.resource_name)
            .field("state", &self.state)
            .field("upload", &self.upload)
            .finish()
    }
}

impl CacheEx {
    /// Open a write session for a write resource name.
    ///
    /// When the target is already stored the session only verifies the
    /// incoming bytes.
    #[instrument(skip(self))]
    pub async fn begin_write(&self, resource_name: &str) -> CacheResult<TransferSession> {
        let resource = WriteResource::parse(resource_name)?;
        let target = resource.digest;
        let upload = self.backend.begin_blob(&target).await?;

        ACTIVE_TRANSFERS.inc();
        Ok(TransferSession {
            resource_name: resource_name.to_string(),
            target,
            state: SessionState::Init,
            upload: Some(upload),
            tail: BytesMut::new(),
            window: self.limits.max_chunk_size,
        })
    }

    /// Run a complete write from a stream of requests.
    ///
    /// Returns the committed size. The stream must end with `finish_write`;
    /// a stream that ends early aborts the upload.
    pub async fn write<S>(&self, mut requests: S) -> CacheResult<u64>
    where
        S: Stream<Item = CacheResult<WriteRequest>> + Unpin,
    {
        let mut request = match requests.next().await {
            Some(request) => request?,
            None => return Err(CacheError::InvalidArgument("empty write stream".to_string())),
        };
        if request.resource_name.is_empty() {
            return Err(CacheError::InvalidArgument(
                "first write request must carry a resource name".to_string(),
            ));
        }
        let mut session = self.begin_write(&request.resource_name).await?;

        loop {
            if !request.resource_name.is_empty() && request.resource_name != session.resource_name
            {
                return Err(session
                    .fail(CacheError::InvalidArgument(format!(
                        "resource name changed mid-stream to {}",
                        request.resource_name
                    )))
                    .await);
            }
            session.append(request.write_offset, request.data).await?;
            if request.finish_write {
                return session.commit().await;
            }
            request = match requests.next().await {
                Some(Ok(next)) => next,
                Some(Err(e)) => return Err(session.fail(e).await),
                None => {
                    return Err(session
                        .fail(CacheError::InvalidArgument(
                            "write stream ended before finish_write".to_string(),
                        ))
                        .await);
                }
            };
        }
    }

    /// Stream a blob from `offset`, at most `limit` bytes (0 for no limit).
    #[instrument(skip(self))]
    pub async fn read(&self, resource_name: &str, offset: i64, limit: i64) -> CacheResult<ReadStream> {
        let resource = ReadResource::parse(resource_name)?;
        let size = resource.digest.size_bytes();
        let start = u64::try_from(offset)
            .ok()
            .filter(|start| *start <= size)
            .ok_or_else(|| {
                CacheError::OutOfRange(format!("read offset {offset} outside blob of {size} bytes"))
            })?;
        let limit = u64::try_from(limit)
            .map_err(|_| CacheError::InvalidArgument(format!("negative read limit {limit}")))?;

        let available = size - start;
        let wanted = if limit == 0 { available } else { limit.min(available) };
        let inner = self.backend.open_blob(&resource.digest, start).await?;
        Ok(rechunk(inner, wanted, self.limits.max_chunk_size))
    }

    /// Committed state of a write.
    ///
    /// Sessions live only as long as their RPC, so the answer is either the
    /// full size of a stored blob or nothing.
    pub async fn query_write_status(&self, resource_name: &str) -> CacheResult<WriteStatus> {
        let digest = match WriteResource::parse(resource_name) {
            Ok(resource) => resource.digest,
            Err(_) => ReadResource::parse(resource_name)?.digest,
        };
        if self.backend.blob_exists(&digest).await? {
            Ok(WriteStatus {
                committed_size: digest.size_i64(),
                complete: true,
            })
        } else {
            Ok(WriteStatus {
                committed_size: 0,
                complete: false,
            })
        }
    }
}

/// Re-slice a backend stream into chunks of at most `max_chunk` bytes,
/// stopping after `remaining` bytes.
fn rechunk(inner: ByteStream, remaining: u64, max_chunk: usize) -> ReadStream {
    let stream = async_stream::try_stream! {
        let mut inner = inner;
        let mut remaining = remaining;
        while remaining > 0 {
            let Some(chunk) = inner.next().await else {
                break;
            };
            let mut chunk = chunk?;
            if chunk.len() as u64 > remaining {
                chunk.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            remaining -= chunk.len() as u64;
            while !chunk.is_empty() {
                let piece = chunk.split_to(chunk.len().min(max_chunk));
                CAS_BYTES_READ.inc_by(piece.len() as u64);
                yield piece;
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use larder_core::ServerConfig;
    use larder_storage::FilesystemBackend;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn cache_with_chunk(max_chunk_size: u64) -> (tempfile::TempDir, CacheEx) {
        let temp = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        let config = ServerConfig {
            max_chunk_size,
            ..ServerConfig::default()
        };
        (temp, CacheEx::new(Arc::new(backend), &config))
    }

    async fn cache() -> (tempfile::TempDir, CacheEx) {
        cache_with_chunk(larder_core::DEFAULT_MAX_CHUNK_SIZE).await
    }

    fn upload_name(digest: &Digest) -> String {
        format!("uploads/{}/blobs/{digest}", Uuid::new_v4())
    }

    fn req(name: &str, offset: i64, data: &'static [u8], finish: bool) -> CacheResult<WriteRequest> {
        Ok(WriteRequest {
            resource_name: name.to_string(),
            write_offset: offset,
            finish_write: finish,
            data: Bytes::from_static(data),
        })
    }

    async fn write_all(cache: &CacheEx, requests: Vec<CacheResult<WriteRequest>>) -> CacheResult<u64> {
        cache.write(futures::stream::iter(requests)).await
    }

    async fn read_all(cache: &CacheEx, digest: &Digest, offset: i64, limit: i64) -> CacheResult<Vec<u8>> {
        let chunks: Vec<Bytes> = cache
            .read(&format!("blobs/{digest}"), offset, limit)
            .await?
            .try_collect()
            .await?;
        Ok(chunks.concat())
    }

    async fn is_stored(cache: &CacheEx, digest: &Digest) -> bool {
        cache.backend().blob_exists(digest).await.unwrap()
    }

    #[tokio::test]
    async fn test_abcd_in_two_chunks_commits() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let name = upload_name(&digest);

        let size = write_all(
            &cache,
            vec![req(&name, 0, b"AB", false), req("", 2, b"CD", true)],
        )
        .await
        .unwrap();
        assert_eq!(size, 4);
        assert_eq!(read_all(&cache, &digest, 0, 0).await.unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn test_abcd_with_wrong_digest_stores_nothing() {
        let (_temp, cache) = cache().await;
        let claimed = Digest::compute(b"ABCE");
        let name = upload_name(&claimed);

        let err = write_all(
            &cache,
            vec![req(&name, 0, b"AB", false), req(&name, 2, b"CD", true)],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::DataLoss);
        assert!(!is_stored(&cache, &claimed).await);
        assert!(!is_stored(&cache, &Digest::compute(b"ABCD")).await);
    }

    #[tokio::test]
    async fn test_offset_past_received_is_failed_precondition() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCDEFG");
        let name = upload_name(&digest);

        let mut session = cache.begin_write(&name).await.unwrap();
        let err = session.append(5, Bytes::from_static(b"FG")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert_eq!(session.state(), SessionState::Aborted);

        let err = session.append(0, Bytes::from_static(b"A")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert!(!is_stored(&cache, &digest).await);
    }

    #[tokio::test]
    async fn test_matching_retransmission_is_accepted() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let name = upload_name(&digest);

        let size = write_all(
            &cache,
            vec![
                req(&name, 0, b"ABC", false),
                req("", 1, b"BC", false),
                req("", 2, b"CD", false),
                req("", 4, b"", true),
            ],
        )
        .await
        .unwrap();
        assert_eq!(size, 4);
        assert_eq!(read_all(&cache, &digest, 0, 0).await.unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn test_mismatched_retransmission_is_rejected() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let name = upload_name(&digest);

        let err = write_all(
            &cache,
            vec![req(&name, 0, b"AB", false), req("", 1, b"XCD", true)],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(!is_stored(&cache, &digest).await);
    }

    #[tokio::test]
    async fn test_retransmission_outside_window_is_rejected() {
        let (_temp, cache) = cache_with_chunk(2).await;
        let digest = Digest::compute(b"ABCDEF");
        let mut session = cache.begin_write(&upload_name(&digest)).await.unwrap();
        session.append(0, Bytes::from_static(b"ABCD")).await.unwrap();

        // Only "CD" is retained.
        let err = session.append(1, Bytes::from_static(b"BCD")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_oversized_write_is_rejected() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"AB");
        let err = write_all(&cache, vec![req(&upload_name(&digest), 0, b"ABC", true)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stream_without_finish_aborts() {
        let (temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let err = write_all(&cache, vec![req(&upload_name(&digest), 0, b"AB", false)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(!is_stored(&cache, &digest).await);
        assert_eq!(count_files(temp.path()), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_leaves_no_temp_files() {
        let (temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let mut session = cache.begin_write(&upload_name(&digest)).await.unwrap();
        session.append(0, Bytes::from_static(b"AB")).await.unwrap();
        drop(session);
        assert_eq!(count_files(temp.path()), 0);
        assert!(!is_stored(&cache, &digest).await);
    }

    #[tokio::test]
    async fn test_existing_target_drains_and_verifies() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        cache
            .backend()
            .put_blob(&digest, Bytes::from_static(b"ABCD"))
            .await
            .unwrap();

        let session = cache.begin_write(&upload_name(&digest)).await.unwrap();
        assert!(session.is_draining());
        drop(session);

        let size = write_all(&cache, vec![req(&upload_name(&digest), 0, b"ABCD", true)])
            .await
            .unwrap();
        assert_eq!(size, 4);

        let err = write_all(&cache, vec![req(&upload_name(&digest), 0, b"ABCE", true)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::DataLoss);
        assert_eq!(read_all(&cache, &digest, 0, 0).await.unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn test_empty_blob_write_and_read() {
        let (_temp, cache) = cache().await;
        let digest = Digest::empty();
        let size = write_all(&cache, vec![req(&upload_name(&digest), 0, b"", true)])
            .await
            .unwrap();
        assert_eq!(size, 0);
        assert!(read_all(&cache, &digest, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resource_name_change_is_rejected() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let err = write_all(
            &cache,
            vec![
                req(&upload_name(&digest), 0, b"AB", false),
                req(&upload_name(&digest), 2, b"CD", true),
            ],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_of_same_blob_keep_one_copy() {
        let (temp, cache) = cache().await;
        let cache = Arc::new(cache);
        let data = Bytes::from((0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let digest = Digest::compute(&data);

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    let name = upload_name(&digest);
                    let requests: Vec<CacheResult<WriteRequest>> = (0..data.len())
                        .step_by(1000)
                        .map(|offset| {
                            let end = (offset + 1000).min(data.len());
                            Ok(WriteRequest {
                                resource_name: name.clone(),
                                write_offset: offset as i64,
                                finish_write: end == data.len(),
                                data: data.slice(offset..end),
                            })
                        })
                        .collect();
                    cache.write(futures::stream::iter(requests)).await
                })
            })
            .collect();

        for writer in writers {
            assert_eq!(writer.await.unwrap().unwrap(), 10_000);
        }

        let files = list_files(temp.path());
        assert_eq!(files.len(), 1, "{files:?}");
        let stored = files[0].to_string_lossy();
        assert!(stored.contains("cas"));
        assert!(!stored.contains(larder_storage::backends::filesystem::TEMP_MARKER));
        assert_eq!(read_all(&cache, &digest, 0, 0).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_offsets_limits_and_chunking() {
        let (_temp, cache) = cache_with_chunk(3).await;
        let data = b"0123456789";
        let digest = Digest::compute(data);
        cache
            .backend()
            .put_blob(&digest, Bytes::from_static(data))
            .await
            .unwrap();

        let chunks: Vec<Bytes> = cache
            .read(&format!("blobs/{digest}"), 0, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 3));
        assert_eq!(chunks.concat(), data);

        assert_eq!(read_all(&cache, &digest, 4, 0).await.unwrap(), b"456789");
        assert_eq!(read_all(&cache, &digest, 4, 2).await.unwrap(), b"45");
        assert!(read_all(&cache, &digest, 10, 0).await.unwrap().is_empty());

        let err = read_all(&cache, &digest, 11, 0).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
        let err = read_all(&cache, &digest, -1, 0).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
        let err = read_all(&cache, &digest, 0, -1).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_read_missing_and_compressed() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"missing");
        let err = read_all(&cache, &digest, 0, 0).await.unwrap_err();
        assert!(err.is_not_found());

        let err = cache
            .read(&format!("compressed-blobs/zstd/{digest}"), 0, 0)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_query_write_status() {
        let (_temp, cache) = cache().await;
        let digest = Digest::compute(b"ABCD");
        let name = upload_name(&digest);
        assert_eq!(
            cache.query_write_status(&name).await.unwrap(),
            WriteStatus {
                committed_size: 0,
                complete: false
            }
        );

        write_all(&cache, vec![req(&name, 0, b"ABCD", true)])
            .await
            .unwrap();
        assert_eq!(
            cache.query_write_status(&name).await.unwrap(),
            WriteStatus {
                committed_size: 4,
                complete: true
            }
        );
    }

    fn list_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }

    fn count_files(root: &std::path::Path) -> usize {
        list_files(root).len()
    }
}
