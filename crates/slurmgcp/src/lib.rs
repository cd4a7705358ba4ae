pub mod common;
pub mod context;
pub mod inventory;
pub mod maintenance;
pub mod mig;
pub mod opswatch;
pub mod placement;
pub mod pubsub;
pub mod reconfigure;
pub mod resume;
pub mod scheduler;
pub mod suspend;
pub mod sync;
pub mod tpu;

#[cfg(test)]
pub(crate) mod tests;

pub use gce::Map;

pub type Error = crate::common::error::SyncError;
pub type Result<T> = std::result::Result<T, Error>;

pub const SLURMGCP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of placement policies created for nodes of this cluster.
pub const MANAGED_POLICY_INFIX: &str = "slurmgcp-managed";
