//! Core domain types shared by the Larder build cache crates.
//!
//! This crate defines:
//! - Content digests (SHA-256 hash plus size) and incremental hashing
//! - Byte Transfer resource names for reads and writes
//! - Configuration values and cache URI parsing

pub mod config;
pub mod digest;
pub mod error;
pub mod resource;

pub use config::{AppConfig, CacheUri, ServerConfig, StorageConfig};
pub use digest::{Digest, DigestHasher, EMPTY_SHA256};
pub use error::{Error, Result};
pub use resource::{ReadResource, WriteResource};

/// Default maximum size of a single streamed chunk: 1 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default limit on the total payload of a batch request: 4 MiB.
///
/// Matches the default gRPC message size used by Bazel clients.
pub const DEFAULT_MAX_BATCH_TOTAL_SIZE: u64 = 4 * 1024 * 1024;

/// Default maximum number of digests in a single FindMissingBlobs request.
pub const DEFAULT_MAX_FIND_MISSING_DIGESTS: usize = 10_000;
