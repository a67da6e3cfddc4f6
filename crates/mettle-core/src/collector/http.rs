//! Shared HTTP fetching for collectors that poll a JSON endpoint.

use std::time::Duration;

use thiserror::Error;

/// Timeout applied to collector HTTP requests.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for HTTP fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Builds the HTTP client shared by a collector's fetches.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// GETs `url` and returns the body when the status is 200.
pub(crate) async fn fetch_body(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let request_err = |source| FetchError::Request {
        url: url.to_string(),
        source,
    };

    let rsp = client.get(url).send().await.map_err(request_err)?;
    if rsp.status() != reqwest::StatusCode::OK {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: rsp.status(),
        });
    }
    rsp.text().await.map_err(request_err)
}
