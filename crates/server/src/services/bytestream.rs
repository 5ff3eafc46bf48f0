use super::CacheService;
use crate::error::CacheError;
use crate::metrics::record_request;
use crate::proto::bytestream::byte_stream_server::ByteStream;
use crate::proto::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tonic::{Request, Response, Status, Streaming};

type ReadResponseStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send>>;

#[tonic::async_trait]
impl ByteStream for CacheService {
    type ReadStream = ReadResponseStream;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        record_request("read");
        let request = request.into_inner();
        let chunks = self
            .cache
            .read(
                &request.resource_name,
                request.read_offset,
                request.read_limit,
            )
            .await?;
        let stream = chunks.map(|chunk| {
            chunk
                .map(|data| ReadResponse { data })
                .map_err(Status::from)
        });
        Ok(Response::new(Box::pin(stream) as Self::ReadStream))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        record_request("write");
        let requests = request
            .into_inner()
            .map(|item| item.map_err(CacheError::from_status));
        let committed = self.cache.write(requests).await?;
        Ok(Response::new(WriteResponse {
            committed_size: i64::try_from(committed).unwrap_or(i64::MAX),
        }))
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        record_request("query_write_status");
        let status = self
            .cache
            .query_write_status(&request.into_inner().resource_name)
            .await?;
        Ok(Response::new(QueryWriteStatusResponse {
            committed_size: status.committed_size,
            complete: status.complete,
        }))
    }
}
