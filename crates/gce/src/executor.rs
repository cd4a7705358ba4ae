use crate::backoff::Backoff;
use crate::error::ApiError;
use crate::operation::Operation;
use crate::request::ComputeRequest;
use crate::transport::{ApiResult, Transport};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Maximum number of requests in a single batch.
pub const BATCH_LIMIT: usize = 1000;
/// Maximum number of requests submitted in one pass (i.e. in one rate limit window).
pub const API_REQ_LIMIT: usize = 2000;
/// Length of the window used to spread passes after hitting a rate limit.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(100);

pub type Done = BTreeMap<String, Value>;
pub type Failed = BTreeMap<String, (ComputeRequest, ApiError)>;

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub batch_limit: usize,
    pub pass_limit: usize,
    pub window: Duration,
    /// Passes that can end rate limited before pending requests are given up.
    pub max_rate_limited_passes: u32,
    /// Retry policy of single request execution.
    pub retry: Backoff,
    /// Delays between polls of an unfinished operation.
    pub poll: Backoff,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        ExecutorLimits {
            batch_limit: BATCH_LIMIT,
            pass_limit: API_REQ_LIMIT,
            window: RATE_LIMIT_WINDOW,
            max_rate_limited_passes: 30,
            retry: Backoff::default(),
            poll: Backoff::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX),
        }
    }
}

/// Submits API requests in batches and waits for the operations they start.
#[derive(Clone)]
pub struct BatchExecutor {
    transport: Rc<dyn Transport>,
    project: String,
    limits: ExecutorLimits,
}

impl BatchExecutor {
    pub fn new(transport: Rc<dyn Transport>, project: impl Into<String>) -> Self {
        Self::with_limits(transport, project, ExecutorLimits::default())
    }

    pub fn with_limits(
        transport: Rc<dyn Transport>,
        project: impl Into<String>,
        limits: ExecutorLimits,
    ) -> Self {
        BatchExecutor {
            transport,
            project: project.into(),
            limits,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Executes all requests, errors of individual requests are logged.
    pub async fn batch_execute(
        &self,
        requests: impl IntoIterator<Item = (String, ComputeRequest)>,
    ) -> (Done, Failed) {
        self.batch_execute_inner(requests, log::Level::Error).await
    }

    /// Same as [`BatchExecutor::batch_execute`], but failures are only logged at debug level.
    /// Used when the caller filters expected errors itself.
    pub async fn batch_execute_quiet(
        &self,
        requests: impl IntoIterator<Item = (String, ComputeRequest)>,
    ) -> (Done, Failed) {
        self.batch_execute_inner(requests, log::Level::Debug).await
    }

    async fn batch_execute_inner(
        &self,
        requests: impl IntoIterator<Item = (String, ComputeRequest)>,
        error_level: log::Level,
    ) -> (Done, Failed) {
        let mut pending: BTreeMap<String, ComputeRequest> = requests.into_iter().collect();
        let mut done = Done::new();
        let mut failed = Failed::new();
        let mut windows: VecDeque<Instant> = VecDeque::new();
        let mut rate_limited = false;
        let mut rate_limited_passes = 0;

        while !pending.is_empty() {
            let now = Instant::now();
            while windows.front().is_some_and(|stamp| *stamp <= now) {
                windows.pop_front();
            }
            if rate_limited {
                if let Some(stamp) = windows.front() {
                    let delay = stamp.saturating_duration_since(now);
                    log::info!(
                        "Rate limit hit, waiting {:.1}s before submitting {} requests",
                        delay.as_secs_f64(),
                        pending.len()
                    );
                    tokio::time::sleep(delay).await;
                }
                rate_limited = false;
            }

            let ids: Vec<String> = pending
                .keys()
                .take(self.limits.pass_limit.max(1))
                .cloned()
                .collect();
            windows.push_back(Instant::now() + self.limits.window);

            let chunks: Vec<&[String]> = ids.chunks(self.limits.batch_limit.max(1)).collect();
            let results: Vec<Vec<ApiResult>> = join_all(chunks.iter().map(|chunk| {
                let batch: Vec<&ComputeRequest> = chunk.iter().map(|id| &pending[id]).collect();
                self.transport.execute_batch(batch)
            }))
            .await;

            let mut last_rate_errors = BTreeMap::new();
            for (chunk, chunk_results) in chunks.iter().zip(results) {
                for (id, result) in chunk.iter().zip(chunk_results) {
                    match result {
                        Ok(value) => {
                            pending.remove(id);
                            done.insert(id.clone(), value);
                        }
                        Err(error) if error.is_rate_limit() => {
                            log::debug!("Compute request {id} rate limited: {error}");
                            rate_limited = true;
                            last_rate_errors.insert(id.clone(), error);
                        }
                        Err(error) => {
                            log::log!(error_level, "Compute request exception {id}: {error}");
                            if let Some(request) = pending.remove(id) {
                                failed.insert(id.clone(), (request, error));
                            }
                        }
                    }
                }
            }

            if rate_limited {
                rate_limited_passes += 1;
                if rate_limited_passes >= self.limits.max_rate_limited_passes {
                    log::error!(
                        "Giving up {} requests after {} rate limited passes",
                        last_rate_errors.len(),
                        rate_limited_passes
                    );
                    for (id, error) in last_rate_errors {
                        if let Some(request) = pending.remove(&id) {
                            failed.insert(id, (request, error));
                        }
                    }
                }
            }
        }
        (done, failed)
    }

    /// Executes a single request, retrying rate limit errors and timeouts.
    pub async fn ensure_execute(&self, request: &ComputeRequest) -> ApiResult {
        self.limits
            .retry
            .retry(
                |attempt| async move {
                    let result = self.transport.execute(request).await;
                    if let Err(error) = &result {
                        if error.is_retryable() {
                            log::warn!("retry:{attempt} {} '{error}'", request.method_id);
                        }
                    }
                    result
                },
                ApiError::is_retryable,
            )
            .await
    }

    /// Executes a list request and follows `nextPageToken` until exhausted.
    pub async fn list_pages(&self, request: ComputeRequest) -> Result<Vec<Value>, ApiError> {
        let mut pages = Vec::new();
        let mut request = request;
        loop {
            let page = self.ensure_execute(&request).await?;
            let token = page
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string());
            pages.push(page);
            match token {
                Some(token) => request = request.with_page_token(token),
                None => return Ok(pages),
            }
        }
    }

    /// Polls an operation until it is `DONE`. The returned operation may still carry an error.
    pub async fn wait_for_operation(&self, operation: &Operation) -> Result<Operation, ApiError> {
        let request = operation.wait_request(&self.project);
        let mut attempt = 0;
        loop {
            let result = Operation::from_value(self.ensure_execute(&request).await?)?;
            if result.is_done() {
                log::debug!(
                    "operation complete{}: type={}, name={}",
                    if result.has_error() { " with errors" } else { "" },
                    result.operation_type.as_deref().unwrap_or("?"),
                    result.name
                );
                return Ok(result);
            }
            tokio::time::sleep(self.limits.poll.delay(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn wait_for_operations<'a>(
        &self,
        operations: impl IntoIterator<Item = &'a Operation>,
    ) -> Vec<Result<Operation, ApiError>> {
        join_all(
            operations
                .into_iter()
                .map(|operation| self.wait_for_operation(operation)),
        )
        .await
    }
}
