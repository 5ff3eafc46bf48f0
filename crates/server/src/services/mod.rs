//! gRPC service adapters.
//!
//! Each REAPI service is a thin translation layer over [`CacheEx`]: decode the
//! request, call the cache, encode the response.

mod action_cache;
mod bytestream;
mod capabilities;
mod cas;

use crate::cache::CacheEx;
use crate::proto::FILE_DESCRIPTOR_SET;
use crate::proto::bytestream::byte_stream_server::ByteStreamServer;
use crate::proto::reapi::action_cache_server::ActionCacheServer;
use crate::proto::reapi::capabilities_server::CapabilitiesServer;
use crate::proto::reapi::content_addressable_storage_server::ContentAddressableStorageServer;
use larder_core::ServerConfig;
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tonic::service::Routes;
use tracing::warn;

/// Implements every served REAPI service over one cache.
#[derive(Clone, Debug)]
pub struct CacheService {
    cache: Arc<CacheEx>,
}

impl CacheService {
    pub fn new(cache: Arc<CacheEx>) -> Self {
        Self { cache }
    }
}

/// Largest gRPC message accepted or sent.
///
/// A full batch plus one chunk of headroom for message framing.
pub fn max_message_size(config: &ServerConfig) -> usize {
    let batch = usize::try_from(config.max_batch_total_size).unwrap_or(usize::MAX);
    batch.saturating_add(config.max_chunk_size_usize())
}

/// Build the gRPC routes for all served services.
///
/// Every service accepts gzip-compressed messages and compresses responses
/// for clients that ask for it. Server reflection is added alongside.
pub fn grpc_routes(cache: Arc<CacheEx>, config: &ServerConfig) -> Routes {
    let service = CacheService::new(cache);
    let limit = max_message_size(config);

    let mut routes = Routes::new(
        ActionCacheServer::new(service.clone())
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit),
    )
    .add_service(
        ContentAddressableStorageServer::new(service.clone())
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit),
    )
    .add_service(
        CapabilitiesServer::new(service.clone())
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit),
    )
    .add_service(
        ByteStreamServer::new(service)
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit),
    );

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET);
    match reflection.build_v1() {
        Ok(v1) => routes = routes.add_service(v1),
        Err(e) => warn!(error = %e, "gRPC reflection v1 disabled"),
    }
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET);
    match reflection.build_v1alpha() {
        Ok(v1alpha) => routes = routes.add_service(v1alpha),
        Err(e) => warn!(error = %e, "gRPC reflection v1alpha disabled"),
    }
    routes
}
