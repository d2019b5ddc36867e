//! Metrics backend client (Prometheus HTTP API)
//!
//! The analyzer consumes a single read: `query(expression) -> scalar`.
//! Anything that prevents a scalar from coming back — transport failure,
//! non-200, an error status in the body, or an empty result set — is an
//! error; classification is the analyzer's job.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Client-side timeout for metrics queries
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PrometheusError {
    #[error("metrics backend HTTP error: {0}")]
    HttpError(String),

    #[error("failed to parse response: {0}")]
    ParseError(String),

    #[error("no data returned from metrics backend")]
    NoData,

    #[error("invalid metric value: {0}")]
    InvalidValue(String),
}

/// Trait for executing instant queries against the metrics backend
///
/// Production code uses `HttpPrometheusClient`; tests use
/// `MockMetricsBackend` with preloaded responses.
#[async_trait]
pub trait MetricsQuerier: Send + Sync {
    /// Execute an instant query and return its scalar result
    async fn query(&self, expression: &str) -> Result<f64, PrometheusError>;
}

/// Instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (i64, String), // [timestamp, value-as-string]
}

/// Parse an instant query response body and extract the scalar value
fn parse_instant_query(body: &str) -> Result<f64, PrometheusError> {
    let response: PrometheusResponse = serde_json::from_str(body)
        .map_err(|e| PrometheusError::ParseError(format!("invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(PrometheusError::HttpError(format!(
            "query failed with status: {}",
            response.status
        )));
    }

    let result = response
        .data
        .result
        .first()
        .ok_or(PrometheusError::NoData)?;

    let value = result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| PrometheusError::ParseError(format!("invalid value: {}", e)))?;

    // NaN and infinity never satisfy a threshold meaningfully
    if value.is_nan() {
        return Err(PrometheusError::InvalidValue("NaN".to_string()));
    }
    if value.is_infinite() {
        return Err(PrometheusError::InvalidValue("infinity".to_string()));
    }

    Ok(value)
}

/// Production client for a real Prometheus-compatible backend
#[derive(Clone)]
pub struct HttpPrometheusClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPrometheusClient {
    pub fn new(base_url: String) -> Self {
        // Connection reuse lives in the reqwest client; build it once
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }
}

#[async_trait]
impl MetricsQuerier for HttpPrometheusClient {
    async fn query(&self, expression: &str) -> Result<f64, PrometheusError> {
        let url = format!("{}/api/v1/query", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("query", expression)])
            .send()
            .await
            .map_err(|e| PrometheusError::HttpError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PrometheusError::HttpError(format!(
                "unexpected status code: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PrometheusError::HttpError(format!("failed to read response: {}", e)))?;

        parse_instant_query(&body)
    }
}

/// Mock metrics backend for tests
///
/// Responses are served FIFO; every executed expression is recorded so
/// tests can assert which queries were (or were not) issued.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockMetricsBackend {
    responses: std::sync::Arc<std::sync::Mutex<Vec<Result<f64, PrometheusError>>>>,
    queries: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockMetricsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a scalar to be returned by the next `query` call
    pub fn enqueue_value(&self, value: f64) {
        self.responses
            .lock()
            .expect("MockMetricsBackend lock poisoned")
            .push(Ok(value));
    }

    /// Enqueue an error to be returned by the next `query` call
    pub fn enqueue_error(&self, error: PrometheusError) {
        self.responses
            .lock()
            .expect("MockMetricsBackend lock poisoned")
            .push(Err(error));
    }

    /// Expressions executed so far, in order
    pub fn executed_queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .expect("MockMetricsBackend lock poisoned")
            .clone()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::expect_used)]
impl MetricsQuerier for MockMetricsBackend {
    async fn query(&self, expression: &str) -> Result<f64, PrometheusError> {
        self.queries
            .lock()
            .expect("MockMetricsBackend lock poisoned")
            .push(expression.to_string());

        let mut responses = self
            .responses
            .lock()
            .expect("MockMetricsBackend lock poisoned");
        if responses.is_empty() {
            return Err(PrometheusError::NoData);
        }
        responses.remove(0)
    }
}
