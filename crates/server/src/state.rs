//! Application state shared across handlers.

use crate::cache::CacheEx;
use larder_core::AppConfig;
use larder_storage::StorageBackend;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Cache engine serving every RPC.
    pub cache: Arc<CacheEx>,
}

impl AppState {
    /// Create the application state over an opened backend.
    pub fn new(config: AppConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let cache = Arc::new(CacheEx::new(backend, &config.server));
        Self {
            config: Arc::new(config),
            cache,
        }
    }
}
