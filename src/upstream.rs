//! Shared plumbing for the hosted speech and language APIs.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Build the HTTP client used by one upstream adapter.
///
/// The client-level timeout bounds connect plus body transfer; callers still
/// wrap whole operations in `tokio::time::timeout`.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
}

/// Join a base URL and a path without doubling or dropping the slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pull the human-readable message out of an OpenAI-style error body, or
/// return the body unchanged when it has another shape.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.trim().to_string(),
    }
}
