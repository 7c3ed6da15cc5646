//! Shared HTTP client, SSE parsing, and auth utilities.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::WardenError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// Streams are bounded by the loop's idle timeout, so only connecting is
/// capped here.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            })
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Parse an SSE "data:" line, returning None for "[DONE]".
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Map an HTTP error status to an error. Only throttling and server-side
/// failures come back retryable.
pub fn status_to_error(status: u16, body: &str) -> WardenError {
    match status {
        401 | 403 => WardenError::Authentication(body.to_string()),
        404 => WardenError::PermanentModel(body.to_string()),
        429 => WardenError::RateLimited {
            retry_after_ms: extract_retry_after(body),
        },
        _ => WardenError::api(status, body),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_lines() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data:{}"), Some("{}"));
        assert_eq!(parse_sse_data("data: [DONE]"), None);
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(status_to_error(401, "no"), WardenError::Authentication(_)));
        assert!(matches!(status_to_error(404, "gone"), WardenError::PermanentModel(_)));
        assert!(matches!(
            status_to_error(429, r#"{"error":{"retry_after":1.5}}"#),
            WardenError::RateLimited {
                retry_after_ms: Some(1500)
            }
        ));
        let server = status_to_error(502, "bad gateway");
        assert!(server.is_retryable());
        assert!(!status_to_error(400, "bad request").is_retryable());
    }
}
