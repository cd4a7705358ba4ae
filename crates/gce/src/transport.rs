use crate::error::ApiError;
use crate::request::ComputeRequest;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub type ApiResult = Result<Value, ApiError>;
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Executes API requests. The REST implementation talks to Google APIs,
/// tests plug in [`crate::testing::FakeTransport`].
pub trait Transport {
    fn execute<'a>(&'a self, request: &'a ComputeRequest) -> ApiFuture<'a, ApiResult>;

    /// Executes a group of independent requests, results are returned in request order.
    fn execute_batch<'a>(
        &'a self,
        requests: Vec<&'a ComputeRequest>,
    ) -> ApiFuture<'a, Vec<ApiResult>> {
        Box::pin(async move {
            futures::future::join_all(requests.into_iter().map(|request| self.execute(request)))
                .await
        })
    }
}
