//! Adapters that load spreadsheet tabs from Google.
//!
//! - **sheets**: authenticated Sheets API access returning raw cell values
//! - **published**: the public "publish to web" HTML rendering

pub mod published;
pub mod sheets;

pub use published::PublishedSource;
pub use sheets::{ServiceAccount, SheetsSource};

use std::time::Duration;

use crate::error::UpstreamError;

/// Timeout applied to every upstream request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client shared by the adapters.
pub fn http_client() -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("rollcall-viewer/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| UpstreamError::Http {
            url: String::new(),
            reason: format!("failed to create HTTP client: {}", e),
        })
}

/// Send a request and fail on non-success statuses.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<reqwest::Response, UpstreamError> {
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::http(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}
