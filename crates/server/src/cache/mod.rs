//! Cache orchestration between the wire protocol and the storage backend.
//!
//! [`CacheEx`] owns the content-addressing rules that are not expressible at
//! the storage layer: Action Cache validation, batch limits, the ByteStream
//! transfer state machine and tree walks.

pub mod action_cache;
pub mod capabilities;
pub mod cas;
pub mod transfer;

use crate::error::{CacheError, CacheResult};
use crate::proto::reapi;
use larder_core::{Digest, ServerConfig};
use larder_storage::StorageBackend;
use std::sync::Arc;

pub use action_cache::InlineOptions;
pub use cas::{BatchReadItem, BatchUpdateItem};
pub use transfer::{ReadStream, SessionState, TransferSession, WriteStatus};

/// Request limits applied by the cache layer.
#[derive(Clone, Debug)]
pub struct CacheLimits {
    /// Upper bound on streamed chunk size and the retransmission window.
    pub max_chunk_size: usize,
    /// Upper bound on the payload of a batch read or update.
    pub max_batch_total_size: u64,
    /// Upper bound on digests per FindMissingBlobs call.
    pub max_find_missing_digests: usize,
    /// Concurrent existence checks per request.
    pub existence_check_concurrency: usize,
    /// Whether clients may write Action Cache entries.
    pub ac_update_enabled: bool,
}

impl From<&ServerConfig> for CacheLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size_usize(),
            max_batch_total_size: config.max_batch_total_size,
            max_find_missing_digests: config.max_find_missing_digests,
            existence_check_concurrency: config.existence_check_concurrency.max(1),
            ac_update_enabled: config.ac_update_enabled,
        }
    }
}

/// The cache engine shared by every RPC.
pub struct CacheEx {
    backend: Arc<dyn StorageBackend>,
    limits: CacheLimits,
    capabilities: reapi::ServerCapabilities,
}

impl CacheEx {
    /// Create a cache over a storage backend.
    pub fn new(backend: Arc<dyn StorageBackend>, config: &ServerConfig) -> Self {
        let limits = CacheLimits::from(config);
        let capabilities = capabilities::server_capabilities(&limits);
        Self {
            backend,
            limits,
            capabilities,
        }
    }

    /// The storage backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Static capabilities advertised to clients.
    pub fn capabilities(&self) -> &reapi::ServerCapabilities {
        &self.capabilities
    }
}

impl std::fmt::Debug for CacheEx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEx")
            .field("backend", &self.backend.backend_name())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Parse a required digest field of a request.
pub fn require_digest(digest: Option<&reapi::Digest>, field: &str) -> CacheResult<Digest> {
    let digest =
        digest.ok_or_else(|| CacheError::InvalidArgument(format!("missing {field}")))?;
    digest
        .to_digest()
        .map_err(|e| CacheError::InvalidArgument(format!("{field}: {e}")))
}
