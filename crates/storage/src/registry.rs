//! Scheme-keyed registry of backend constructors.

use crate::backends::filesystem::FilesystemBackend;
use crate::backends::s3::{S3Backend, S3Options};
use crate::error::{StorageError, StorageResult};
use crate::traits::StorageBackend;
use futures::future::BoxFuture;
use larder_core::config::StorageConfig;
use larder_core::CacheUri;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Constructs a backend for a parsed cache URI.
pub type BackendConstructor = Arc<
    dyn Fn(CacheUri, StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>>
        + Send
        + Sync,
>;

/// Maps URI schemes (`file`, `s3`, `gs`, ...) to backend constructors.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `file`, `s3` and `gs` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", |uri, _config| async move {
            let backend = FilesystemBackend::new(uri.filesystem_root()).await?;
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry.register("s3", |uri, config| async move {
            let options = S3Options::from_uri(&uri)?
                .with_credentials(config.access_key_id, config.secret_access_key);
            let backend = S3Backend::new(options).await?;
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry.register("gs", |uri, config| async move {
            let options = S3Options::from_gcs_uri(&uri)?
                .with_credentials(config.access_key_id, config.secret_access_key);
            let backend = S3Backend::with_name(options, "gcs").await?;
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry
    }

    /// Register (or replace) the constructor for a scheme.
    pub fn register<F, Fut>(&mut self, scheme: &str, constructor: F)
    where
        F: Fn(CacheUri, StorageConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StorageResult<Arc<dyn StorageBackend>>> + Send + 'static,
    {
        let constructor: BackendConstructor =
            Arc::new(move |uri, config| Box::pin(constructor(uri, config)));
        self.constructors
            .insert(scheme.to_ascii_lowercase(), constructor);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Build the backend selected by `config.uri`.
    pub async fn open(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        config.validate().map_err(StorageError::Config)?;
        let uri = CacheUri::parse(&config.uri)?;
        let constructor = self
            .constructors
            .get(uri.scheme())
            .ok_or_else(|| StorageError::UnsupportedScheme(uri.scheme().to_string()))?;

        info!(uri = %uri, "Opening storage backend");
        constructor(uri, config.clone()).await
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
