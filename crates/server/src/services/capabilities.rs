use super::CacheService;
use crate::metrics::record_request;
use crate::proto::reapi::capabilities_server::Capabilities;
use crate::proto::reapi::{GetCapabilitiesRequest, ServerCapabilities};
use tonic::{Request, Response, Status};

#[tonic::async_trait]
impl Capabilities for CacheService {
    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        record_request("get_capabilities");
        Ok(Response::new(self.cache.capabilities().clone()))
    }
}
