//! Bazel remote cache server for Larder.
//!
//! This crate serves the cache surface of the Remote Execution API:
//! - Action Cache lookups and updates
//! - Content-addressable storage batches and tree walks
//! - ByteStream reads and resumable writes
//! - Static capabilities
//!
//! gRPC and plain HTTP share one listener.

pub mod cache;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod proto;
pub mod routes;
pub mod services;
pub mod state;

pub use cache::CacheEx;
pub use error::{CacheError, CacheResult};
pub use routes::create_router;
pub use state::AppState;
