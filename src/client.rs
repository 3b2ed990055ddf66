//! HTTP client used by the standalone simulator to post readings.
//!
//! This module provides an async HTTP client with connection pooling,
//! retry logic with exponential backoff, and a mapping from HTTP statuses
//! onto [`IngestError`] so the offline buffer can tell a transient outage
//! from a rejected reading.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ingest::{IngestError, ReadingSink};
use crate::reading::{NewReading, Reading};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Body of a successful `POST /lecturas`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    #[serde(default)]
    pub success: bool,

    /// The stored reading
    pub data: Reading,
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub code: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,

    #[serde(default)]
    pub sensores: usize,

    #[serde(default)]
    pub lecturas: u64,

    #[serde(default)]
    pub simulaciones_activas: usize,
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server returned an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Failed to parse response body
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// All retry attempts exhausted
    #[error("All {attempts} retry attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl From<ClientError> for IngestError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status { code, message } if code == StatusCode::BAD_REQUEST => {
                IngestError::Validation(message)
            }
            ClientError::Status { code, message } if code == StatusCode::NOT_FOUND => {
                IngestError::NotFound(message)
            }
            ClientError::Status { code, message }
                if code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS =>
            {
                IngestError::StorageUnavailable(message)
            }
            e @ (ClientError::Request(_) | ClientError::Timeout | ClientError::RetriesExhausted { .. }) => {
                IngestError::StorageUnavailable(e.to_string())
            }
            other => IngestError::Internal(other.to_string()),
        }
    }
}

/// HTTP client for the reading ingestion API.
///
/// The client uses connection pooling (via reqwest's internal pool),
/// implements retry logic with exponential backoff, and respects
/// configured timeouts.
///
/// # Example
///
/// ```no_run
/// use connected_root::client::ApiClient;
/// use connected_root::config::Config;
/// use connected_root::reading::{NewReading, ReadingKind};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = ApiClient::new(&config).expect("Failed to create client");
///
///     let reading = NewReading::new("648a1b2c3d4e5f6789012341", ReadingKind::Temperature, 21.4);
///     match client.send_reading(&reading).await {
///         Ok(stored) => println!("Stored reading {}", stored.id),
///         Err(e) => eprintln!("Failed to send: {}", e),
///     }
/// }
/// ```
pub struct ApiClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL for the reading ingestion endpoint
    ingest_url: String,

    /// URL for the health check
    health_url: String,

    /// Maximum number of retry attempts
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,
}

impl ApiClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(&config.api_url, config.request_timeout, config.max_retries)
    }

    /// Create a new client for the API rooted at `api_url`.
    pub fn with_settings(
        api_url: impl AsRef<str>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let base = api_url.as_ref().trim_end_matches('/');
        Ok(Self {
            client,
            ingest_url: format!("{}/lecturas", base),
            health_url: format!("{}/health", base),
            max_retries,
            timeout,
        })
    }

    /// Post one reading, retrying transient failures.
    ///
    /// Connection errors, timeouts, 5xx and 429 are retried up to
    /// `max_retries` times. Any other status fails immediately.
    pub async fn send_reading(&self, reading: &NewReading) -> Result<Reading, ClientError> {
        debug!(
            sensor_id = ?reading.sensor_id,
            tipo = ?reading.tipo,
            url = %self.ingest_url,
            "Sending reading"
        );

        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis(),
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(reading).await {
                Ok(response) => {
                    info!(
                        sensor_id = %response.data.sensor_id,
                        tipo = %response.data.tipo,
                        valor = response.data.valor,
                        "Reading accepted by API"
                    );
                    return Ok(response.data);
                }
                Err(e) => {
                    let is_retryable = self.is_retryable_error(&e);

                    if !is_retryable {
                        error!(error = %e, attempts = attempt + 1, "Request rejected");
                        return Err(e);
                    }

                    if attempt >= self.max_retries {
                        error!(error = %e, attempts = attempt + 1, "Request failed permanently");
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt + 1,
                            last_error: e.to_string(),
                        });
                    }

                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        "Request failed, will retry"
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// Send a single HTTP request without retry logic.
    async fn send_request(&self, reading: &NewReading) -> Result<IngestResponse, ClientError> {
        let response = self
            .client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(reading)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))
        } else {
            Err(ClientError::Status {
                code: status,
                message: error_message(&body),
            })
        }
    }

    /// Call `GET /health` once.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self
            .client
            .get(&self.health_url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))
        } else {
            Err(ClientError::Status {
                code: status,
                message: error_message(&body),
            })
        }
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = DEFAULT_BASE_DELAY_MS;

        let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

        // Up to 25% of the delay
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay.saturating_add(jitter).min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    /// Check if an error is retryable.
    fn is_retryable_error(&self, error: &ClientError) -> bool {
        match error {
            ClientError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Timeout => true,
            ClientError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            ClientError::Parse(_) => false,
            ClientError::RetriesExhausted { .. } => false,
            ClientError::Config(_) => false,
        }
    }

    /// Get the configured ingest URL.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Get the configured health URL.
    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ReadingSink for ApiClient {
    async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError> {
        self.send_reading(&reading).await.map_err(IngestError::from)
    }
}

/// Pull the `error` field out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.error.is_empty() => parsed.error,
        _ if body.is_empty() => "Unknown error".to_string(),
        _ => body.to_string(),
    }
}
