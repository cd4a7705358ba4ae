use thiserror::Error;

use crate::common::error::SyncError::GenericError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Node name {0} is not valid")]
    NamingError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compute API error: {0}")]
    ApiError(#[from] gce::ApiError),
    #[error("Command error: {0}")]
    CommandError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl SyncError {
    /// Reason reported to Slurm when a request fails.
    pub fn api_reason(&self) -> String {
        match self {
            SyncError::ApiError(error) => error.describe(),
            error => error.to_string(),
        }
    }
}

impl From<serde_json::error::Error> for SyncError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<String> for SyncError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
