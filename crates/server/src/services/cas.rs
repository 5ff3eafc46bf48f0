use super::CacheService;
use crate::cache::capabilities::check_digest_function;
use crate::cache::{BatchUpdateItem, require_digest};
use crate::error::ok_status;
use crate::metrics::record_request;
use crate::proto::reapi::content_addressable_storage_server::ContentAddressableStorage;
use crate::proto::reapi::{
    BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, Digest, FindMissingBlobsRequest, FindMissingBlobsResponse,
    GetTreeRequest, GetTreeResponse, batch_read_blobs_response, batch_update_blobs_response,
    compressor,
};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tonic::{Request, Response, Status};

type TreePageStream = Pin<Box<dyn Stream<Item = Result<GetTreeResponse, Status>> + Send>>;

#[tonic::async_trait]
impl ContentAddressableStorage for CacheService {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        record_request("find_missing_blobs");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;

        let missing = self.cache.find_missing_blobs(&request.blob_digests).await?;
        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing.into_iter().map(Digest::from).collect(),
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        record_request("batch_update_blobs");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;

        let items = request
            .requests
            .into_iter()
            .map(BatchUpdateItem::from)
            .collect();
        let responses = self
            .cache
            .batch_update_blobs(items)
            .await?
            .into_iter()
            .map(|(digest, result)| batch_update_blobs_response::Response {
                digest: Some(digest),
                status: Some(match result {
                    Ok(()) => ok_status(),
                    Err(e) => e.to_rpc_status(),
                }),
            })
            .collect();
        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        record_request("batch_read_blobs");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;

        let responses = self
            .cache
            .batch_read_blobs(request.digests)
            .await?
            .into_iter()
            .map(|item| {
                let (data, status) = match item.result {
                    Ok(data) => (data, ok_status()),
                    Err(e) => (Default::default(), e.to_rpc_status()),
                };
                batch_read_blobs_response::Response {
                    digest: Some(item.digest),
                    data,
                    compressor: compressor::Value::Identity as i32,
                    status: Some(status),
                }
            })
            .collect();
        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream = TreePageStream;

    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        record_request("get_tree");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;
        let root = require_digest(request.root_digest.as_ref(), "root_digest")?;

        let pages = self
            .cache
            .get_tree(&root, request.page_size, &request.page_token)
            .await?;
        let stream = pages.map(|page| page.map_err(Status::from));
        Ok(Response::new(Box::pin(stream) as Self::GetTreeStream))
    }
}
