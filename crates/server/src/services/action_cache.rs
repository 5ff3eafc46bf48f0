use super::CacheService;
use crate::cache::capabilities::check_digest_function;
use crate::cache::{InlineOptions, require_digest};
use crate::error::CacheError;
use crate::metrics::record_request;
use crate::proto::reapi::action_cache_server::ActionCache;
use crate::proto::reapi::{ActionResult, GetActionResultRequest, UpdateActionResultRequest};
use tonic::{Request, Response, Status};

#[tonic::async_trait]
impl ActionCache for CacheService {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        record_request("get_action_result");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;
        let action = require_digest(request.action_digest.as_ref(), "action_digest")?;
        let inline = InlineOptions::from(&request);

        let result = self.cache.get_action_result(&action, &inline).await?;
        Ok(Response::new(result))
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        record_request("update_action_result");
        let request = request.into_inner();
        check_digest_function(request.digest_function)?;
        let action = require_digest(request.action_digest.as_ref(), "action_digest")?;
        let result = request
            .action_result
            .ok_or_else(|| CacheError::InvalidArgument("missing action_result".to_string()))?;

        let stored = self.cache.update_action_result(&action, result).await?;
        Ok(Response::new(stored))
    }
}
