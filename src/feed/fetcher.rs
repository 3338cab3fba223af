use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;

/// Errors that can occur while retrieving a feed document.
///
/// `Network` and `HttpStatus` are deliberately distinct failure kinds so
/// the scheduler can tell transport trouble from a server that answered
/// and said no. The fetcher itself never retries; retry cadence is the
/// scheduler's policy.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The request (including body read) exceeded the configured timeout
    #[error("request timed out")]
    Timeout,
    /// Response body exceeded the configured size cap
    #[error("response too large")]
    ResponseTooLarge,
}

impl FetchError {
    /// Transport-level failures, including timeouts and cancellation.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Timeout)
    }
}

/// Retrieve the raw document at `url` within `timeout`.
///
/// Returns the response body as bytes; it performs no parsing and holds no
/// feed-specific state, so it is safe to invoke concurrently for distinct
/// URLs. The timeout covers the whole operation, connection through body
/// read, and a timed-out fetch is reported exactly like any other failed
/// attempt.
pub async fn fetch_payload(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    match tokio::time::timeout(timeout, fetch_inner(client, url, max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    }
}

async fn fetch_inner(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await.map_err(FetchError::Network)?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, max_bytes).await
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header before streaming
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
