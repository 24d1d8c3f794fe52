//! HTTP transport for sending batches to the event collector.
//!
//! [`HecClient`] performs exactly one POST per call and classifies what came
//! back into a [`Disposition`]. It never retries on its own; that is the job
//! of [`crate::retry`]. The [`Transport`] trait is the seam the retry and
//! dispatch logic is written against, so tests can swap in scripted stubs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::Config;

/// Path of the JSON event endpoint on the collector.
pub const COLLECTOR_PATH: &str = "/services/collector/event";

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("hec-shipper/", env!("CARGO_PKG_VERSION"));

/// Response body returned by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HecResponse {
    /// Human-readable status, e.g. "Success"
    #[serde(default)]
    pub text: String,

    /// Collector status code; 0 means success
    #[serde(default)]
    pub code: i64,

    /// Index of the first rejected event, when the collector reports one
    #[serde(rename = "invalid-event-number", default)]
    pub invalid_event_number: Option<u64>,
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx: the collector accepted the batch.
    Success,
    /// Network error or 5xx: the same batch may be sent again.
    Retryable,
    /// 4xx or any other status: resending will not help.
    Fatal,
}

/// Record of one transport call for one batch.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    /// 1-based attempt number
    pub attempt: u32,

    pub disposition: Disposition,

    /// HTTP status, absent for transport errors
    pub status: Option<StatusCode>,

    /// Parsed response body, if it could be parsed
    pub response: Option<HecResponse>,

    /// Transport error description, if the request never got a status
    pub error: Option<String>,
}

impl DispatchAttempt {
    /// An attempt that received an HTTP response.
    pub fn from_status(attempt: u32, status: StatusCode, response: Option<HecResponse>) -> Self {
        Self {
            attempt,
            disposition: classify_status(status),
            status: Some(status),
            response,
            error: None,
        }
    }

    /// An attempt that failed before any response arrived.
    pub fn from_error(attempt: u32, error: impl std::fmt::Display) -> Self {
        Self {
            attempt,
            disposition: Disposition::Retryable,
            status: None,
            response: None,
            error: Some(error.to_string()),
        }
    }

    /// Short description of the attempt for log lines.
    pub fn describe(&self) -> String {
        match (&self.status, &self.response, &self.error) {
            (_, _, Some(error)) => error.clone(),
            (Some(status), Some(response), _) => match response.invalid_event_number {
                Some(index) => format!(
                    "{} ({}: {}, invalid event {})",
                    status, response.code, response.text, index
                ),
                None => format!("{} ({}: {})", status, response.code, response.text),
            },
            (Some(status), None, _) => status.to_string(),
            (None, _, None) => "no response".to_string(),
        }
    }
}

/// Classify an HTTP status.
///
/// * **2xx** → [`Disposition::Success`]
/// * **5xx** → [`Disposition::Retryable`]
/// * **anything else** (4xx included) → [`Disposition::Fatal`]
pub fn classify_status(status: StatusCode) -> Disposition {
    match status.as_u16() {
        200..=299 => Disposition::Success,
        500..=599 => Disposition::Retryable,
        _ => Disposition::Fatal,
    }
}

/// Sends one batch and reports how it went.
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &Batch, attempt: u32) -> DispatchAttempt;
}

/// Errors that can occur while building the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token cannot be used in an Authorization header: {0}")]
    InvalidToken(#[from] InvalidHeaderValue),

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// HTTP client for the event collector.
///
/// The underlying `reqwest::Client` is reused across batches, so connections
/// are pooled and the client can be shared freely behind an `Arc`.
pub struct HecClient {
    client: Client,
    endpoint_url: String,
    timeout: Duration,
}

impl HecClient {
    /// Create a client from the shipper configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the token is not a valid header value or
    /// the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.endpoint_url(),
            &config.token,
            config.verify,
            config.request_timeout,
        )
    }

    /// Create a client with explicit settings.
    pub fn with_settings(
        endpoint_url: impl Into<String>,
        token: &str,
        verify: bool,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut auth = HeaderValue::from_str(&format!("Splunk {}", token))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify)
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        if !verify {
            warn!("TLS certificate verification is disabled");
        }

        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
            timeout,
        })
    }

    /// Get the collector endpoint URL.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HecClient {
    async fn send(&self, batch: &Batch, attempt: u32) -> DispatchAttempt {
        debug!(
            batch_id = %batch.id(),
            events = batch.event_count(),
            bytes = batch.len(),
            attempt = attempt,
            url = %self.endpoint_url,
            "Posting batch"
        );

        let response = match self
            .client
            .post(&self.endpoint_url)
            .body(batch.payload())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return DispatchAttempt::from_error(attempt, e),
        };

        let status = response.status();
        // The status alone decides the disposition once it has arrived.
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, status = %status, "Failed to read response body");
                return DispatchAttempt::from_status(attempt, status, None);
            }
        };

        let parsed = serde_json::from_slice::<HecResponse>(&body).ok();
        if let Some(hec) = &parsed {
            if status.is_success() && hec.code != 0 {
                warn!(
                    batch_id = %batch.id(),
                    code = hec.code,
                    text = %hec.text,
                    "Collector accepted batch with non-zero status code"
                );
            }
        }

        DispatchAttempt::from_status(attempt, status, parsed)
    }
}
