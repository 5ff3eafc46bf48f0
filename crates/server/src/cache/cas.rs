//! Content-addressable storage semantics: existence checks, batches and
//! tree walks.

use super::{CacheEx, capabilities};
use crate::error::{CacheError, CacheResult};
use crate::metrics::{CAS_BYTES_READ, CAS_BYTES_WRITTEN, CAS_DEDUPLICATED_WRITES};
use crate::proto::reapi::{self, Directory, GetTreeResponse};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use larder_core::Digest;
use larder_storage::{BlobStore, CreateOutcome, StorageBackend, StorageError};
use prost::Message;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default number of directories per GetTree page.
pub const DEFAULT_TREE_PAGE_SIZE: usize = 1000;

/// Stream of GetTree pages.
pub type TreeStream = Pin<Box<dyn Stream<Item = CacheResult<GetTreeResponse>> + Send>>;

/// Outcome of one entry of a batch read.
#[derive(Debug)]
pub struct BatchReadItem {
    /// The digest as sent by the client.
    pub digest: reapi::Digest,
    pub result: CacheResult<Bytes>,
}

/// One entry of a batch update.
#[derive(Clone, Debug)]
pub struct BatchUpdateItem {
    pub digest: reapi::Digest,
    pub data: Bytes,
    pub compressor: i32,
}

impl From<reapi::batch_update_blobs_request::Request> for BatchUpdateItem {
    fn from(request: reapi::batch_update_blobs_request::Request) -> Self {
        Self {
            digest: request.digest.unwrap_or_default(),
            data: request.data,
            compressor: request.compressor,
        }
    }
}

impl CacheEx {
    /// Report the digests that are not present, in request order.
    ///
    /// Requests above the configured digest count are rejected outright
    /// rather than answered partially.
    #[instrument(skip_all, fields(count = digests.len()))]
    pub async fn find_missing_blobs(&self, digests: &[reapi::Digest]) -> CacheResult<Vec<Digest>> {
        if digests.len() > self.limits.max_find_missing_digests {
            return Err(CacheError::InvalidArgument(format!(
                "{} digests requested, at most {} allowed per call",
                digests.len(),
                self.limits.max_find_missing_digests
            )));
        }
        let parsed = digests
            .iter()
            .map(|d| {
                d.to_digest()
                    .map_err(|e| CacheError::InvalidArgument(e.to_string()))
            })
            .collect::<CacheResult<Vec<_>>>()?;

        let backend = self.backend.clone();
        let checked: Vec<(Digest, bool)> = futures::stream::iter(parsed)
            .map(|digest| {
                let backend = backend.clone();
                async move {
                    let present = backend.blob_exists(&digest).await?;
                    Ok::<_, StorageError>((digest, present))
                }
            })
            .buffered(self.limits.existence_check_concurrency)
            .try_collect()
            .await?;

        let missing: Vec<Digest> = checked
            .into_iter()
            .filter_map(|(digest, present)| (!present).then_some(digest))
            .collect();
        debug!(missing = missing.len(), "FindMissingBlobs complete");
        Ok(missing)
    }

    /// Read several small blobs.
    ///
    /// Blobs larger than the batch limit fail individually; a request whose
    /// remaining blobs exceed the limit together fails as a whole.
    #[instrument(skip_all, fields(count = digests.len()))]
    pub async fn batch_read_blobs(
        &self,
        digests: Vec<reapi::Digest>,
    ) -> CacheResult<Vec<BatchReadItem>> {
        let limit = self.limits.max_batch_total_size;
        let mut total: u64 = 0;
        let mut planned = Vec::with_capacity(digests.len());
        for raw in digests {
            let parsed = raw
                .to_digest()
                .map_err(|e| CacheError::InvalidArgument(e.to_string()))
                .and_then(|digest| {
                    if digest.size_bytes() > limit {
                        Err(CacheError::InvalidArgument(format!(
                            "blob {digest} exceeds the batch limit of {limit} bytes, use ByteStream"
                        )))
                    } else {
                        Ok(digest)
                    }
                });
            if let Ok(digest) = &parsed {
                total += digest.size_bytes();
            }
            planned.push((raw, parsed));
        }
        if total > limit {
            return Err(CacheError::InvalidArgument(format!(
                "batch read of {total} bytes exceeds the limit of {limit} bytes"
            )));
        }

        let backend = self.backend.clone();
        let items = futures::stream::iter(planned)
            .map(|(raw, parsed)| {
                let backend = backend.clone();
                async move {
                    let result = match parsed {
                        Ok(digest) => read_small_blob(backend.as_ref(), &digest).await,
                        Err(e) => Err(e),
                    };
                    BatchReadItem {
                        digest: raw,
                        result,
                    }
                }
            })
            .buffered(self.limits.existence_check_concurrency)
            .collect()
            .await;
        Ok(items)
    }

    /// Verify and store several small blobs.
    ///
    /// Content that does not match its digest fails that item with DATA_LOSS;
    /// the rest of the batch is unaffected.
    #[instrument(skip_all, fields(count = items.len()))]
    pub async fn batch_update_blobs(
        &self,
        items: Vec<BatchUpdateItem>,
    ) -> CacheResult<Vec<(reapi::Digest, CacheResult<()>)>> {
        let limit = self.limits.max_batch_total_size;
        let total: u64 = items.iter().map(|item| item.data.len() as u64).sum();
        if total > limit {
            return Err(CacheError::InvalidArgument(format!(
                "batch update of {total} bytes exceeds the limit of {limit} bytes"
            )));
        }

        let backend = self.backend.clone();
        let results = futures::stream::iter(items)
            .map(|item| {
                let backend = backend.clone();
                async move {
                    let result = store_small_blob(backend.as_ref(), &item).await;
                    (item.digest, result)
                }
            })
            .buffered(self.limits.existence_check_concurrency)
            .collect()
            .await;
        Ok(results)
    }

    /// Walk the directory tree under `root` breadth-first, in pages.
    ///
    /// `page_token` is the `hash/size` of the next directory to emit, as
    /// returned in `next_page_token`. Child directories missing from the CAS
    /// are skipped.
    #[instrument(skip_all, fields(root = %root, page_size = page_size))]
    pub async fn get_tree(
        &self,
        root: &Digest,
        page_size: i32,
        page_token: &str,
    ) -> CacheResult<TreeStream> {
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_TREE_PAGE_SIZE);
        let resume_at = if page_token.is_empty() {
            None
        } else {
            Some(page_token.parse::<Digest>().map_err(|e| {
                CacheError::InvalidArgument(format!("invalid page token: {e}"))
            })?)
        };

        let backend = self.backend.clone();
        let root_dir = match load_directory(backend.as_ref(), root).await? {
            Some(dir) => dir,
            None => return Err(CacheError::NotFound(format!("root directory {root}"))),
        };

        let byte_budget = usize::try_from(self.limits.max_batch_total_size).unwrap_or(usize::MAX);
        Ok(tree_pages(
            backend,
            *root,
            root_dir,
            resume_at,
            page_size,
            byte_budget,
        ))
    }
}

async fn read_small_blob(backend: &dyn StorageBackend, digest: &Digest) -> CacheResult<Bytes> {
    let data = backend.read_blob(digest).await?;
    CAS_BYTES_READ.inc_by(data.len() as u64);
    Ok(data)
}

async fn store_small_blob(backend: &dyn StorageBackend, item: &BatchUpdateItem) -> CacheResult<()> {
    let digest = item
        .digest
        .to_digest()
        .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;
    if !capabilities::is_identity(item.compressor) {
        return Err(CacheError::InvalidArgument(format!(
            "compressor {} is not supported",
            item.compressor
        )));
    }
    if item.data.len() as u64 != digest.size_bytes() {
        return Err(CacheError::DataLoss(format!(
            "blob {digest} sent with {} bytes",
            item.data.len()
        )));
    }
    match backend.put_blob(&digest, item.data.clone()).await {
        Ok(CreateOutcome::Stored) => CAS_BYTES_WRITTEN.inc_by(digest.size_bytes()),
        Ok(CreateOutcome::AlreadyPresent) => CAS_DEDUPLICATED_WRITES.inc(),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Load and decode a Directory, `None` when absent.
async fn load_directory(
    backend: &dyn StorageBackend,
    digest: &Digest,
) -> CacheResult<Option<Directory>> {
    let data = match backend.read_blob(digest).await {
        Ok(data) => data,
        Err(StorageError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Directory::decode(data)
        .map(Some)
        .map_err(|e| CacheError::InvalidArgument(format!("blob {digest} is not a Directory: {e}")))
}

fn tree_pages(
    backend: Arc<dyn StorageBackend>,
    root: Digest,
    root_dir: Directory,
    resume_at: Option<Digest>,
    page_size: usize,
    byte_budget: usize,
) -> TreeStream {
    let stream = async_stream::try_stream! {
        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::from([root]);
        let mut skipping = resume_at.is_some();
        let mut page: Vec<Directory> = Vec::new();
        let mut page_bytes = 0usize;
        let mut root_dir = Some(root_dir);

        while let Some(digest) = queue.pop_front() {
            let dir = match root_dir.take().filter(|_| digest == root) {
                Some(dir) => dir,
                None => match load_directory(backend.as_ref(), &digest).await {
                    Ok(Some(dir)) => dir,
                    Ok(None) => {
                        debug!(digest = %digest, "Skipping missing child directory");
                        continue;
                    }
                    Err(e) if e.code() == tonic::Code::InvalidArgument => {
                        debug!(digest = %digest, error = %e, "Skipping undecodable child directory");
                        continue;
                    }
                    Err(e) => Err::<Directory, _>(e)?,
                },
            };

            for child in &dir.directories {
                if let Some(child) = child.digest.as_ref().and_then(|d| d.to_digest().ok())
                    && seen.insert(child)
                {
                    queue.push_back(child);
                }
            }

            if skipping {
                if Some(digest) != resume_at {
                    continue;
                }
                skipping = false;
            }

            let size = dir.encoded_len();
            if !page.is_empty() && (page.len() >= page_size || page_bytes + size > byte_budget) {
                yield GetTreeResponse {
                    directories: std::mem::take(&mut page),
                    next_page_token: digest.to_string(),
                };
                page_bytes = 0;
            }
            page_bytes += size;
            page.push(dir);
        }

        if skipping {
            Err::<(), _>(CacheError::InvalidArgument(
                "page token does not name a directory in this tree".to_string(),
            ))?;
        }

        yield GetTreeResponse {
            directories: page,
            next_page_token: String::new(),
        };
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::reapi::DirectoryNode;
    use larder_core::ServerConfig;
    use larder_storage::FilesystemBackend;

    async fn cache(config: ServerConfig) -> (tempfile::TempDir, CacheEx) {
        let temp = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        (temp, CacheEx::new(Arc::new(backend), &config))
    }

    fn item(data: &'static [u8]) -> BatchUpdateItem {
        BatchUpdateItem {
            digest: Digest::compute(data).into(),
            data: Bytes::from_static(data),
            compressor: 0,
        }
    }

    async fn put_directory(cache: &CacheEx, dir: &Directory) -> Digest {
        let data = Bytes::from(dir.encode_to_vec());
        let digest = Digest::compute(&data);
        cache.backend().put_blob(&digest, data).await.unwrap();
        digest
    }

    fn node(name: &str, digest: Digest) -> DirectoryNode {
        DirectoryNode {
            name: name.to_string(),
            digest: Some(digest.into()),
        }
    }

    #[tokio::test]
    async fn test_find_missing_is_exact_and_ordered() {
        let (_temp, cache) = cache(ServerConfig::default()).await;
        let stored = cache
            .batch_update_blobs(vec![item(b"one"), item(b"three")])
            .await
            .unwrap();
        assert!(stored.iter().all(|(_, r)| r.is_ok()));

        let query: Vec<reapi::Digest> = [&b"one"[..], b"two", b"three", b"four", b""]
            .iter()
            .map(|d| Digest::compute(d).into())
            .collect();
        let missing = cache.find_missing_blobs(&query).await.unwrap();
        assert_eq!(missing, vec![Digest::compute(b"two"), Digest::compute(b"four")]);
    }

    #[tokio::test]
    async fn test_find_missing_rejects_oversized_and_malformed() {
        let config = ServerConfig {
            max_find_missing_digests: 2,
            ..ServerConfig::default()
        };
        let (_temp, cache) = cache(config).await;
        let query: Vec<reapi::Digest> = (0..3u8).map(|i| Digest::compute(&[i]).into()).collect();
        let err = cache.find_missing_blobs(&query).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let bad = vec![reapi::Digest {
            hash: "abc".to_string(),
            size_bytes: 1,
        }];
        let err = cache.find_missing_blobs(&bad).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_batch_update_mismatch_is_per_item_data_loss() {
        let (_temp, cache) = cache(ServerConfig::default()).await;
        let mut wrong = item(b"good");
        wrong.data = Bytes::from_static(b"evil");
        let mut short = item(b"longer");
        short.data = Bytes::from_static(b"long");
        let mut zstd = item(b"zstd");
        zstd.compressor = 1;

        let results = cache
            .batch_update_blobs(vec![item(b"fine"), wrong, short, zstd])
            .await
            .unwrap();
        let codes: Vec<tonic::Code> = results
            .iter()
            .map(|(_, r)| r.as_ref().err().map_or(tonic::Code::Ok, CacheError::code))
            .collect();
        assert_eq!(
            codes,
            vec![
                tonic::Code::Ok,
                tonic::Code::DataLoss,
                tonic::Code::DataLoss,
                tonic::Code::InvalidArgument
            ]
        );

        let missing = cache
            .find_missing_blobs(&[Digest::compute(b"good").into()])
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_limits() {
        let config = ServerConfig {
            max_chunk_size: 4,
            max_batch_total_size: 8,
            ..ServerConfig::default()
        };
        let (_temp, cache) = cache(config).await;

        let err = cache
            .batch_update_blobs(vec![item(b"12345"), item(b"67890")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        cache.batch_update_blobs(vec![item(b"12345")]).await.unwrap();
        cache
            .backend()
            .put_blob(
                &Digest::compute(b"0123456789"),
                Bytes::from_static(b"0123456789"),
            )
            .await
            .unwrap();

        // The oversized blob fails alone; the rest fits.
        let reads = cache
            .batch_read_blobs(vec![
                Digest::compute(b"12345").into(),
                Digest::compute(b"0123456789").into(),
            ])
            .await
            .unwrap();
        assert_eq!(&reads[0].result.as_ref().unwrap()[..], b"12345");
        assert_eq!(
            reads[1].result.as_ref().unwrap_err().code(),
            tonic::Code::InvalidArgument
        );

        // Individually small, too big together.
        let err = cache
            .batch_read_blobs(vec![
                Digest::compute(b"12345").into(),
                Digest::compute(b"abcde").into(),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_batch_read_not_found_is_per_item() {
        let (_temp, cache) = cache(ServerConfig::default()).await;
        cache.batch_update_blobs(vec![item(b"here")]).await.unwrap();
        let reads = cache
            .batch_read_blobs(vec![
                Digest::compute(b"gone").into(),
                Digest::compute(b"here").into(),
                Digest::empty().into(),
            ])
            .await
            .unwrap();
        assert!(reads[0].result.as_ref().unwrap_err().is_not_found());
        assert_eq!(&reads[1].result.as_ref().unwrap()[..], b"here");
        assert!(reads[2].result.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_tree_pages_breadth_first() {
        let (_temp, cache) = cache(ServerConfig::default()).await;
        let leaf_a = put_directory(&cache, &Directory::default()).await;
        let leaf_b = Directory {
            files: vec![reapi::FileNode {
                name: "f".to_string(),
                digest: Some(Digest::compute(b"f").into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let leaf_b = put_directory(&cache, &leaf_b).await;
        let middle = put_directory(
            &cache,
            &Directory {
                directories: vec![node("b", leaf_b)],
                ..Default::default()
            },
        )
        .await;
        let missing = Digest::compute(b"not a directory we have");
        let root = put_directory(
            &cache,
            &Directory {
                directories: vec![node("a", leaf_a), node("m", middle), node("x", missing)],
                ..Default::default()
            },
        )
        .await;

        let pages: Vec<GetTreeResponse> = cache
            .get_tree(&root, 2, "")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].directories.len(), 2);
        assert_eq!(pages[0].next_page_token, middle.to_string());
        assert_eq!(pages[1].directories.len(), 2);
        assert!(pages[1].next_page_token.is_empty());

        let resumed: Vec<GetTreeResponse> = cache
            .get_tree(&root, 10, &pages[0].next_page_token)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].directories, pages[1].directories);
    }

    #[tokio::test]
    async fn test_get_tree_missing_root() {
        let (_temp, cache) = cache(ServerConfig::default()).await;
        let err = cache
            .get_tree(&Digest::compute(b"nope"), 0, "")
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }
}
