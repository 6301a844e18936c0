//! IPFS content store backed by a Kubo node's HTTP RPC API
//!
//! Only `cat` is needed for reconciliation. Reads are bounded: the node is
//! asked for at most `max_bytes` and the body is truncated there as well, so
//! a bogus declared size cannot make us download an arbitrarily large object.
//!
//! ## Failure classification
//!
//! | Situation | Result |
//! |-----------|--------|
//! | connect error, timeout, broken body | `Connection` |
//! | HTTP 502/503/504, Kubo "context deadline exceeded" | `Connection` |
//! | any other Kubo error (bad CID, not found, directory) | `InvalidContent` |

use crate::content_store::{ContentStore, FetchError, FetchedContent};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const API_CAT: &str = "/api/v0/cat";
const API_ID: &str = "/api/v0/id";
/// Kubo's wording when its own request context expires
const KUBO_DEADLINE_EXCEEDED: &str = "context deadline exceeded";

/// Kubo connection settings
#[derive(Debug, Clone)]
pub struct KuboConfig {
    /// Base URL of the RPC API, e.g. `http://localhost:5001`
    pub api_url: String,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for KuboConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5001".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Error body returned by Kubo on non-2xx responses
#[derive(Debug, Deserialize)]
struct KuboErrorBody {
    #[serde(rename = "Message")]
    message: String,
}

pub struct KuboClient {
    http_client: reqwest::Client,
    api_url: String,
}

impl KuboClient {
    pub fn new(config: KuboConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReconcileError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Whether the node answers its identity endpoint
    pub async fn is_available(&self) -> bool {
        let url = format!("{}{}", self.api_url, API_ID);
        match self.http_client.post(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "IPFS node not reachable");
                false
            }
        }
    }

    fn cat_url(&self, id: &str, max_bytes: u64) -> std::result::Result<Url, FetchError> {
        let length = max_bytes.to_string();
        Url::parse_with_params(
            &format!("{}{}", self.api_url, API_CAT),
            &[("arg", id), ("length", length.as_str())],
        )
        .map_err(|e| FetchError::Connection(format!("Invalid IPFS API URL: {}", e)))
    }
}

#[async_trait]
impl ContentStore for KuboClient {
    async fn fetch(&self, id: &str, max_bytes: u64) -> std::result::Result<FetchedContent, FetchError> {
        let url = self.cat_url(id, max_bytes)?;

        let mut response = self
            .http_client
            .post(url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_error_response(status, &body);
            warn!(hash = %id, status = %status, error = %err, "IPFS read failed");
            return Err(err);
        }

        let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
        let mut content = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            let remaining = limit - content.len();
            if chunk.len() >= remaining {
                content.extend_from_slice(&chunk[..remaining]);
                break;
            }
            content.extend_from_slice(&chunk);
        }

        debug!(hash = %id, size = content.len(), "Read content from IPFS");
        Ok(FetchedContent::new(content.freeze()))
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Connection(format!("Ipfs read request timeout: {}", e))
    } else {
        FetchError::Connection(format!("Ipfs read request error: {}", e))
    }
}

fn classify_error_response(status: StatusCode, body: &str) -> FetchError {
    let message = serde_json::from_str::<KuboErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| format!("HTTP {}: {}", status, body.trim()));

    let gateway_failure = matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    );
    let node_timeout = message.contains(KUBO_DEADLINE_EXCEEDED);

    if gateway_failure || node_timeout {
        FetchError::Connection(message)
    } else {
        FetchError::InvalidContent(message)
    }
}
