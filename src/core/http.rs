//! HTTP client utilities.
//!
//! Provides the shared client builder for provider adapters and the mapping
//! from HTTP failures onto the provider error taxonomy.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Response bodies longer than this are truncated in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Body markers that identify a content-policy refusal.
const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content_filter",
    "safety",
    "responsible_ai_policy",
];

/// Build a configured HTTP client.
///
/// # Errors
///
/// Returns error if client construction fails.
pub fn build_client(timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(format!("deepq/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| DeepqError::Config(format!("failed to build HTTP client: {e}")))
}

/// Send a request and decode a JSON response, classifying every failure.
///
/// # Errors
///
/// Returns a transport error when the request never completes, a provider
/// error for non-2xx responses, or `ParseResponse` for malformed bodies.
pub async fn send_json<T: DeserializeOwned>(
    provider: Provider,
    request: RequestBuilder,
    timeout: Duration,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, &e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, status, retry_after, &body));
    }

    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, &e, timeout))?;
    serde_json::from_str(&body).map_err(|e| DeepqError::ParseResponse {
        provider: provider.to_string(),
        message: e.to_string(),
    })
}

/// Map a reqwest send failure to a transport error.
#[must_use]
pub fn transport_error(provider: Provider, err: &reqwest::Error, timeout: Duration) -> DeepqError {
    if err.is_timeout() {
        DeepqError::Timeout {
            provider: provider.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        DeepqError::ConnectionFailed {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Classify a non-success HTTP status.
///
/// - 429 is a rate limit, carrying the `Retry-After` hint
/// - 5xx is unavailability
/// - 401/403 is an auth failure
/// - 404 is an unknown model or route
/// - 400/422 is a bad request, or a content rejection when the body names a
///   content policy
#[must_use]
pub fn classify_status(
    provider: Provider,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> DeepqError {
    let name = provider.to_string();
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status.as_u16() {
        429 => DeepqError::RateLimited {
            provider: name,
            retry_after,
            message,
        },
        401 | 403 => DeepqError::AuthFailed {
            provider: name,
            message,
        },
        404 => DeepqError::InvalidModel {
            provider: name,
            model: truncate(body),
        },
        400 | 422 if is_content_refusal(body) => DeepqError::ContentRejected {
            provider: name,
            message,
        },
        code if status.is_server_error() => DeepqError::ProviderUnavailable {
            provider: name,
            status_code: Some(code),
            message,
        },
        _ => DeepqError::BadRequest {
            provider: name,
            message,
        },
    }
}

/// Whether an error body describes a content-policy refusal.
#[must_use]
pub fn is_content_refusal(body: &str) -> bool {
    let lower = body.to_lowercase();
    CONTENT_POLICY_MARKERS.iter().any(|m| lower.contains(m))
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn classify_rate_limit_keeps_hint() {
        let err = classify_status(
            Provider::OpenAi,
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "slow down",
        );
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn classify_server_errors_as_unavailable() {
        let err = classify_status(Provider::Grok, StatusCode::BAD_GATEWAY, None, "");
        assert!(matches!(
            err,
            DeepqError::ProviderUnavailable {
                status_code: Some(502),
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_terminal_statuses() {
        let auth = classify_status(Provider::Gemini, StatusCode::UNAUTHORIZED, None, "");
        assert!(matches!(auth, DeepqError::AuthFailed { .. }));
        assert!(!auth.is_retryable());

        let bad = classify_status(Provider::Gemini, StatusCode::BAD_REQUEST, None, "bad field");
        assert!(matches!(bad, DeepqError::BadRequest { .. }));

        let refused = classify_status(
            Provider::Azure,
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error":{"code":"content_filter"}}"#,
        );
        assert!(matches!(refused, DeepqError::ContentRejected { .. }));
        assert!(!refused.counts_against_provider());
    }

    #[test]
    fn retry_after_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let err = classify_status(Provider::OpenAi, StatusCode::BAD_REQUEST, None, &body);
        assert!(err.to_string().len() < 700);
    }
}
