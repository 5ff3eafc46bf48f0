//! Server test utilities.

use larder_core::AppConfig;
use larder_server::proto::bytestream::byte_stream_client::ByteStreamClient;
use larder_server::proto::reapi::action_cache_client::ActionCacheClient;
use larder_server::proto::reapi::capabilities_client::CapabilitiesClient;
use larder_server::proto::reapi::content_addressable_storage_client::ContentAddressableStorageClient;
use larder_server::{AppState, create_router};
use larder_storage::{FilesystemBackend, StorageBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub backend: Arc<dyn StorageBackend>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        larder_server::metrics::register_metrics();

        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage_path = temp_dir.path().join("storage");
        let backend: Arc<dyn StorageBackend> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let mut config = AppConfig::for_testing(&storage_path);
        modifier(&mut config);
        config.validate().expect("Invalid test configuration");

        let state = AppState::new(config, backend.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            backend,
            _temp_dir: temp_dir,
        }
    }

    /// Serve the router on an ephemeral loopback port.
    pub async fn spawn(&self) -> RunningServer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local address");
        let router = self.router.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .expect("Invalid endpoint")
            .connect()
            .await
            .expect("Failed to connect to test server");

        RunningServer {
            addr,
            channel,
            handle,
        }
    }
}

/// A listening test server with a connected gRPC channel.
#[allow(dead_code)]
pub struct RunningServer {
    pub addr: SocketAddr,
    pub channel: Channel,
    handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl RunningServer {
    pub fn action_cache(&self) -> ActionCacheClient<Channel> {
        ActionCacheClient::new(self.channel.clone())
    }

    pub fn cas(&self) -> ContentAddressableStorageClient<Channel> {
        ContentAddressableStorageClient::new(self.channel.clone())
    }

    pub fn capabilities(&self) -> CapabilitiesClient<Channel> {
        CapabilitiesClient::new(self.channel.clone())
    }

    pub fn bytestream(&self) -> ByteStreamClient<Channel> {
        ByteStreamClient::new(self.channel.clone())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
