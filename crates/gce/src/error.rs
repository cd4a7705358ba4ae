use serde::Deserialize;
use thiserror::Error;

/// Failure of a single API request.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("HTTP {status} {reason}: {message}")]
    Http {
        status: u16,
        /// Machine readable reason of the first error detail (e.g. `alreadyExists`).
        reason: String,
        message: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "Rate Limit Exceeded",
    "Quota Exceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
];

impl ApiError {
    pub fn http(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Http {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::http(404, "notFound", message)
    }

    /// Parses the standard JSON error envelope returned by Google APIs.
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let reason = envelope
                    .error
                    .errors
                    .first()
                    .and_then(|detail| detail.reason.clone())
                    .or(envelope.error.status)
                    .unwrap_or_default();
                ApiError::Http {
                    status,
                    reason,
                    message: envelope.error.message,
                }
            }
            Err(_) => ApiError::Http {
                status,
                reason: String::new(),
                message: body.trim().to_string(),
            },
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ApiError::Http { reason, .. } => reason,
            ApiError::Transport(_) => "transport",
            ApiError::Timeout(_) => "timeout",
            ApiError::Auth(_) => "auth",
            ApiError::Decode(_) => "decode",
        }
    }

    /// Human readable reason, used when reporting failures to Slurm.
    pub fn describe(&self) -> String {
        match self {
            ApiError::Http {
                reason, message, ..
            } if !message.is_empty() => {
                if reason.is_empty() {
                    message.clone()
                } else {
                    format!("{reason}: {message}")
                }
            }
            error => error.to_string(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        match self {
            ApiError::Http {
                status,
                reason,
                message,
            } => {
                *status == 429
                    || RATE_LIMIT_MARKERS
                        .iter()
                        .any(|marker| reason.contains(marker) || message.contains(marker))
            }
            _ => false,
        }
    }

    /// Errors worth retrying with a backoff when a single request is executed.
    pub fn is_retryable(&self) -> bool {
        self.is_rate_limit() || matches!(self, ApiError::Timeout(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::Http { status: 409, .. }) || self.reason() == "alreadyExists"
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Http { status: 404, .. }) || self.reason() == "notFound"
    }

    pub fn is_in_use(&self) -> bool {
        self.reason() == "resourceInUseByAnotherResource"
            || self.to_string().contains("resourceInUseByAnotherResource")
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout(error.to_string())
        } else if error.is_decode() {
            ApiError::Decode(error.to_string())
        } else {
            ApiError::Transport(error.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Decode(error.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::ApiError;

    #[test]
    fn parse_error_envelope() {
        let body = r#"{"error": {"code": 409, "message": "The resource 'x' already exists",
            "errors": [{"message": "The resource 'x' already exists", "domain": "global", "reason": "alreadyExists"}]}}"#;
        let error = ApiError::from_response(409, body);
        assert!(error.is_already_exists());
        assert!(!error.is_rate_limit());
        assert_eq!(error.reason(), "alreadyExists");
        assert_eq!(
            error.describe(),
            "alreadyExists: The resource 'x' already exists"
        );
    }

    #[test]
    fn rate_limit_detection() {
        assert!(ApiError::http(403, "rateLimitExceeded", "Rate Limit Exceeded").is_rate_limit());
        assert!(ApiError::http(403, "", "Quota Exceeded for quota metric").is_rate_limit());
        assert!(ApiError::http(429, "", "").is_rate_limit());
        assert!(!ApiError::http(403, "forbidden", "Permission denied").is_rate_limit());
        assert!(ApiError::Timeout("socket".into()).is_retryable());
    }

    #[test]
    fn unparsable_body() {
        let error = ApiError::from_response(502, "Bad gateway\n");
        assert_eq!(error.describe(), "Bad gateway");
        assert!(!error.is_not_found());
    }
}
