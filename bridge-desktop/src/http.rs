//! Content Fetcher over HTTP using Reqwest
//!
//! Talks to a course content API laid out as:
//!
//! ```text
//! GET {base}/courses/{course_id}                        -> CourseSummary
//! GET {base}/courses/{course_id}/tabs/{tab_id}/items    -> [ContentItem]
//! GET {item.url}                                        -> raw bytes
//! ```
//!
//! Item URLs may be absolute or relative to the base URL. Server errors and
//! rate limiting are retried with backoff; other statuses fail immediately.

use async_trait::async_trait;
use bridge_traits::{
    content::{ContentFetcher, ContentItem, CourseSummary},
    error::{BridgeError, Result},
    work::RetryPolicy,
};
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Reqwest-based content fetcher
pub struct HttpContentFetcher {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
}

impl HttpContentFetcher {
    /// Create a fetcher for `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("course-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BridgeError::OperationFailed(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                use_exponential_backoff: true,
            },
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    async fn get(&self, url: &str) -> Result<Response> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(attempt, max_attempts, url = %redact(url), "Executing HTTP request");

            let mut request = self.client.get(url);
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let error = BridgeError::OperationFailed(format!(
                        "HTTP {} for {}",
                        status.as_u16(),
                        redact(url)
                    ));
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    warn!(status = status.as_u16(), attempt, "HTTP request failed with retryable status");
                    error
                }
                Err(e) => {
                    warn!(error = %e, attempt, "HTTP request failed");
                    if e.is_timeout() {
                        BridgeError::OperationFailed(format!("Request timed out: {}", redact(url)))
                    } else if e.is_connect() {
                        BridgeError::OperationFailed(format!("Connection failed: {}", e))
                    } else {
                        BridgeError::OperationFailed(e.to_string())
                    }
                }
            };

            if attempt >= max_attempts {
                return Err(error);
            }
            attempt += 1;
            let delay = self.retry.delay_for(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
            sleep(delay).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get(url)
            .await?
            .json()
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid response body: {}", e)))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Signed download links carry credentials in the query string.
fn redact(url: &str) -> &str {
    url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url)
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn course(&self, course_id: &str) -> Result<CourseSummary> {
        let url = format!("{}/courses/{}", self.base_url, course_id);
        self.get_json(&url).await
    }

    async fn list_items(&self, course_id: &str, tab_id: &str) -> Result<Vec<ContentItem>> {
        let url = format!(
            "{}/courses/{}/tabs/{}/items",
            self.base_url, course_id, tab_id
        );
        self.get_json(&url).await
    }

    async fn fetch(&self, item: &ContentItem) -> Result<Bytes> {
        let url = self.resolve(&item.url);
        let body = self
            .get(&url)
            .await?
            .bytes()
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to read body: {}", e)))?;

        debug!(item_id = %item.id, size = body.len(), "Fetched content item");
        Ok(body)
    }
}
