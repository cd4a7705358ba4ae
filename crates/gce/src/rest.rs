use crate::error::ApiError;
use crate::request::{ComputeRequest, HttpMethod, Service};
use crate::transport::{ApiFuture, ApiResult, Transport};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const COMPUTE_ROOT: &str = "https://compute.googleapis.com/compute/beta/";
const TPU_ROOT: &str = "https://tpu.googleapis.com/v2/";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub enum TokenSource {
    /// Service account of the VM, obtained from the metadata server.
    Metadata,
    /// Externally provided bearer token.
    Static(String),
}

struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

pub struct RestTransport {
    client: reqwest::Client,
    compute_root: String,
    tpu_root: String,
    source: TokenSource,
    token: Mutex<Option<AccessToken>>,
    trace: bool,
}

impl RestTransport {
    pub fn new(source: TokenSource) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("slurmgcp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            compute_root: COMPUTE_ROOT.to_string(),
            tpu_root: TPU_ROOT.to_string(),
            source,
            token: Mutex::new(None),
            trace: false,
        })
    }

    /// Overrides the Compute API root, e.g. to select the `v1` endpoint version.
    pub fn with_compute_root(mut self, root: &str) -> Self {
        self.compute_root = normalize_root(root);
        self
    }

    pub fn with_tpu_root(mut self, root: &str) -> Self {
        self.tpu_root = normalize_root(root);
        self
    }

    /// Logs every outgoing request with its body.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    async fn bearer_token(&self) -> Result<String, ApiError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            let valid = token
                .expires_at
                .map(|at| Instant::now() + TOKEN_EXPIRY_MARGIN < at)
                .unwrap_or(true);
            if valid {
                return Ok(token.value.clone());
            }
        }
        let token = match &self.source {
            TokenSource::Static(value) => AccessToken {
                value: value.clone(),
                expires_at: None,
            },
            TokenSource::Metadata => {
                let response = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| ApiError::Auth(format!("Cannot reach metadata server: {e}")))?;
                if !response.status().is_success() {
                    return Err(ApiError::Auth(format!(
                        "Metadata server returned {}",
                        response.status()
                    )));
                }
                let response: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| ApiError::Auth(format!("Invalid token response: {e}")))?;
                AccessToken {
                    value: response.access_token,
                    expires_at: Some(Instant::now() + Duration::from_secs(response.expires_in)),
                }
            }
        };
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    fn url(&self, request: &ComputeRequest) -> String {
        let root = match request.service {
            Service::Compute => &self.compute_root,
            Service::Tpu => &self.tpu_root,
        };
        format!("{root}{}", request.path.trim_start_matches('/'))
    }

    async fn send(&self, request: &ComputeRequest) -> ApiResult {
        let token = self.bearer_token().await?;
        let url = self.url(request);
        if self.trace {
            log::debug!(
                "API request: {} {} query={:?} body={}",
                request.method_id,
                url,
                request.query,
                request
                    .body
                    .as_ref()
                    .map(|b| b.to_string())
                    .unwrap_or_default()
            );
        }

        let builder = match request.http_method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        let mut builder = builder.bearer_auth(token).query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        } else if request.http_method == HttpMethod::Post {
            builder = builder.header(reqwest::header::CONTENT_LENGTH, 0);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_response(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl Transport for RestTransport {
    fn execute<'a>(&'a self, request: &'a ComputeRequest) -> ApiFuture<'a, ApiResult> {
        Box::pin(self.send(request))
    }
}

fn normalize_root(root: &str) -> String {
    if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    }
}
