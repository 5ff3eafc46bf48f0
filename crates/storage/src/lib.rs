//! Blob storage abstraction and backends for Larder.
//!
//! This crate provides:
//! - A raw keyed object contract ([`StorageBackend`]) with atomic writes
//! - Digest-level CAS and Action Cache operations ([`BlobStore`])
//! - Backends: local filesystem and S3-compatible (including GCS interop)
//! - A scheme-keyed [`BackendRegistry`] for building backends from cache URIs

pub mod backends;
pub mod blob;
pub mod error;
pub mod registry;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use blob::{BlobStore, CreateOutcome, DigestStream, ListedBlob, Namespace, VerifiedUpload};
pub use error::{StorageError, StorageResult};
pub use registry::BackendRegistry;
pub use traits::{
    ByteStream, ListedObject, ObjectMeta, ObjectStream, StorageBackend, StreamingUpload,
};

use larder_core::config::StorageConfig;
use std::sync::Arc;

/// Create a storage backend from configuration using the built-in backends.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    BackendRegistry::with_defaults().open(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig {
            uri: format!("file://{}", temp.path().join("store").display()),
            ..StorageConfig::default()
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig {
            uri: "s3://bucket".to_string(),
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
