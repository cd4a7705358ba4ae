//! Thin client layer over the Compute Engine and Cloud TPU REST APIs.
//!
//! Requests are described by [`ComputeRequest`] values and executed through a
//! [`Transport`]. [`BatchExecutor`] adds batching, rate limit handling and
//! operation polling on top of it.

pub mod backoff;
pub mod error;
pub mod executor;
pub mod operation;
pub mod request;
pub mod rest;
pub mod selflink;
pub mod testing;
pub mod transport;

pub use error::ApiError;
pub use executor::{BatchExecutor, ExecutorLimits};
pub use operation::Operation;
pub use request::ComputeRequest;
pub use transport::{ApiResult, Transport};

pub type Map<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;
