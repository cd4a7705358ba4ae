//! In-memory transport for tests of code built on top of the API layer.

use crate::request::ComputeRequest;
use crate::transport::{ApiFuture, ApiResult, Transport};
use serde_json::{Value, json};
use std::cell::RefCell;

type Handler = Box<dyn Fn(&ComputeRequest) -> ApiResult>;

/// Answers requests with a closure and records everything it receives.
pub struct FakeTransport {
    handler: Handler,
    requests: RefCell<Vec<ComputeRequest>>,
    batch_sizes: RefCell<Vec<usize>>,
}

impl FakeTransport {
    pub fn new(handler: impl Fn(&ComputeRequest) -> ApiResult + 'static) -> Self {
        FakeTransport {
            handler: Box::new(handler),
            requests: Default::default(),
            batch_sizes: Default::default(),
        }
    }

    /// Every request succeeds with a finished operation.
    pub fn accept_all() -> Self {
        Self::new(|request| Ok(operation_json(&request.path, "DONE")))
    }

    pub fn requests(&self) -> Vec<ComputeRequest> {
        self.requests.borrow().clone()
    }

    pub fn requests_of(&self, method_id: &str) -> Vec<ComputeRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.method_id == method_id)
            .cloned()
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.borrow().clone()
    }

    pub fn clear(&self) {
        self.requests.borrow_mut().clear();
        self.batch_sizes.borrow_mut().clear();
    }
}

impl Transport for FakeTransport {
    fn execute<'a>(&'a self, request: &'a ComputeRequest) -> ApiFuture<'a, ApiResult> {
        self.requests.borrow_mut().push(request.clone());
        let result = (self.handler)(request);
        Box::pin(async move { result })
    }

    fn execute_batch<'a>(
        &'a self,
        requests: Vec<&'a ComputeRequest>,
    ) -> ApiFuture<'a, Vec<ApiResult>> {
        self.batch_sizes.borrow_mut().push(requests.len());
        let results: Vec<ApiResult> = requests
            .into_iter()
            .map(|request| {
                self.requests.borrow_mut().push(request.clone());
                (self.handler)(request)
            })
            .collect();
        Box::pin(async move { results })
    }
}

/// Zonal operation in the given status.
pub fn operation_json(name: &str, status: &str) -> Value {
    let name = name.rsplit('/').next().unwrap_or(name);
    json!({
        "name": name,
        "status": status,
        "zone": "zones/z",
        "selfLink": format!("projects/p/zones/z/operations/{name}"),
    })
}
