//! Shared HTTP plumbing for the reqwest-backed clients.

use std::time::Duration;

use reqwest::{Response, Url};
use serde::de::DeserializeOwned;

use crate::error::ClientError;
use crate::ClientResult;

/// Longest response body kept on an error.
const MAX_ERROR_BODY: usize = 2048;

/// Build the shared reqwest client used by a backend.
pub(crate) fn build_client(timeout: Duration, cookies: bool) -> ClientResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("gitops-promoter/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .cookie_store(cookies)
        .build()
        .map_err(|e| ClientError::Config(format!("failed to create HTTP client: {e}")))
}

/// Parse a configured base URL.
pub(crate) fn parse_base(base: &str) -> ClientResult<Url> {
    let trimmed = base.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::Config("base URL is empty".to_string()));
    }
    Url::parse(&format!("{trimmed}/"))
        .map_err(|e| ClientError::Config(format!("invalid base URL {base:?}: {e}")))
}

/// Append raw path segments (each percent-encoded) to `base`.
pub(crate) fn join_segments(base: &Url, segments: &[&str]) -> ClientResult<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ClientError::Config(format!("base URL cannot be a base: {base}")))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

/// Turn a non-success response into [`ClientError::Api`], keeping the body.
pub(crate) async fn check(method: &str, response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(ClientError::Api {
        status: status.as_u16(),
        method: method.to_string(),
        url,
        body,
    })
}

/// Check the response and decode its JSON body.
pub(crate) async fn json<T: DeserializeOwned>(method: &str, response: Response) -> ClientResult<T> {
    let response = check(method, response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
