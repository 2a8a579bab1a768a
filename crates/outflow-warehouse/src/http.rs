//! HTTP plumbing shared by the REST dialects: client construction and
//! mapping of transport failures into [`ConnectorError`].

use std::time::Duration;

use outflow_types::error::{ConnectorError, Result};
use reqwest::{Response, StatusCode};

/// Default per-request timeout for warehouse REST calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest response body excerpt carried in an error message.
const MAX_BODY_EXCERPT: usize = 512;

/// Build a `reqwest` client with the given timeout.
///
/// # Errors
///
/// Returns an `internal` error if the TLS backend cannot be initialized.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ConnectorError::internal("HTTP_CLIENT", e.to_string()))
}

/// Statuses worth retrying: timeouts, throttling, and server errors.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Classify a non-success response status.
#[must_use]
pub fn status_error(status: StatusCode, body: &str, retry_after_ms: Option<u64>) -> ConnectorError {
    let excerpt: String = body.chars().take(MAX_BODY_EXCERPT).collect();
    let message = format!("HTTP {status}: {excerpt}");
    let code = format!("HTTP_{}", status.as_u16());
    match status.as_u16() {
        401 => ConnectorError::auth(code, message),
        403 => ConnectorError::permission(code, message),
        429 => ConnectorError::rate_limit(code, message, retry_after_ms),
        _ if is_retryable_status(status) => ConnectorError::transient_network(code, message),
        _ => ConnectorError::data(code, message),
    }
}

/// Classify a transport-level `reqwest` failure.
#[must_use]
pub fn transport_error(err: &reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::transient_network("HTTP_TIMEOUT", err.to_string())
    } else if err.is_decode() {
        ConnectorError::data("HTTP_DECODE", err.to_string())
    } else if err.is_builder() {
        ConnectorError::config("HTTP_REQUEST", err.to_string())
    } else {
        ConnectorError::transient_network("HTTP_TRANSPORT", err.to_string())
    }
}

/// Pass through a successful response, or turn it into a classified error.
///
/// # Errors
///
/// Returns the [`status_error`] classification of a non-2xx response.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000));
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body, retry_after_ms))
}

/// Decode a JSON response body, mapping failures into the taxonomy.
///
/// # Errors
///
/// Returns a classified error for non-2xx statuses or malformed bodies.
pub async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    check_response(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| transport_error(&e))
}
