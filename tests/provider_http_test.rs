//! Provider adapters against mock HTTP endpoints.
//!
//! Covers:
//! - Request shape and auth headers per backend
//! - Status mapping for async (Responses) and sync (Gemini, chat) backends
//! - Error classification: 429 with Retry-After, 5xx, 401, content refusals
//! - Timeouts

mod common;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use deepq::core::models::{JobId, ResearchDepth};
use deepq::core::money::Usd;
use deepq::error::DeepqError;
use deepq::providers::{
    ChatCompletionsProvider, GeminiProvider, Provider, ProviderStatus, ResearchProvider,
    ResponsesProvider, SubmitOutcome, SubmitRequest,
};

use common::fixtures::{
    chat_completed, chat_refused, gemini_blocked, gemini_completed, response_completed,
    response_failed, response_in_progress, response_queued,
};
use common::logger::TestLogger;

const TIMEOUT: Duration = Duration::from_secs(5);

fn request(model: &str) -> SubmitRequest {
    SubmitRequest {
        job_id: JobId::from("job-1"),
        prompt: "How do sodium-ion cells compare with LFP?".to_string(),
        model: model.to_string(),
        depth: ResearchDepth::Quick,
    }
}

// =============================================================================
// Responses API
// =============================================================================

#[tokio::test]
async fn responses_submit_is_accepted_then_polled_to_completion() {
    let log = TestLogger::new("responses_submit_is_accepted_then_polled_to_completion");
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "o4-mini-deep-research",
            "background": true,
            "metadata": { "deepq_job_id": "job-1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_queued("resp_1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/resp_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_completed(
            "resp_1",
            "Sodium-ion trades density for cost.",
        )))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk-test", TIMEOUT).unwrap();

    log.phase("submit");
    let outcome = adapter.submit(&request("o4-mini-deep-research")).await.unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Accepted {
            provider_job_id: "resp_1".to_string()
        }
    );

    log.phase("poll");
    match adapter.poll("resp_1").await.unwrap() {
        ProviderStatus::Completed { output, usage, cost } => {
            assert_eq!(output, "Sodium-ion trades density for cost.");
            assert_eq!(usage.input_tokens, 20_000);
            assert_eq!(usage.output_tokens, 5_000);
            assert_eq!(usage.tool_calls, 2);
            assert_eq!(cost, None);
        }
        other => panic!("unexpected status {other:?}"),
    }
    log.finish_ok();
}

#[tokio::test]
async fn responses_in_progress_is_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/resp_2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_in_progress("resp_2")))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();
    assert_eq!(adapter.poll("resp_2").await.unwrap(), ProviderStatus::Pending);
}

#[tokio::test]
async fn responses_failure_carries_provider_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/resp_3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_failed("resp_3")))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();
    match adapter.poll("resp_3").await.unwrap() {
        ProviderStatus::Failed { reason, .. } => {
            assert_eq!(reason, "server_error: research run crashed");
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn azure_uses_api_key_header_and_cancel_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses/resp_4/cancel"))
        .and(header("api-key", "az-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_4", "status": "cancelled"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::Azure, server.uri(), "az-key", TIMEOUT).unwrap();
    adapter.cancel("resp_4").await.unwrap();
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "17")
                .set_body_string(r#"{"error":{"message":"slow down"}}"#),
        )
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();
    let err = adapter.submit(&request("o3-deep-research")).await.unwrap_err();
    assert!(matches!(err, DeepqError::RateLimited { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    assert!(err.is_retryable());
    assert!(err.counts_against_provider());
}

#[tokio::test]
async fn server_errors_and_auth_failures_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/down"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/denied"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();

    let down = adapter.poll("down").await.unwrap_err();
    assert!(matches!(
        down,
        DeepqError::ProviderUnavailable {
            status_code: Some(503),
            ..
        }
    ));
    assert!(down.is_retryable());

    let denied = adapter.poll("denied").await.unwrap_err();
    assert!(matches!(denied, DeepqError::AuthFailed { .. }));
    assert!(!denied.is_retryable());
    assert!(denied.counts_against_provider());
}

#[tokio::test]
async fn content_policy_400_is_a_rejection_not_a_provider_fault() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            r#"{"error":{"code":"content_policy_violation","message":"flagged"}}"#,
        ))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();
    let err = adapter.submit(&request("o4-mini-deep-research")).await.unwrap_err();
    assert!(matches!(err, DeepqError::ContentRejected { .. }));
    assert!(!err.is_retryable());
    assert!(!err.counts_against_provider());
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(response_in_progress("slow"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(
        Provider::OpenAi,
        server.uri(),
        "sk",
        Duration::from_millis(200),
    )
    .unwrap();
    let err = adapter.poll("slow").await.unwrap_err();
    assert!(matches!(err, DeepqError::Timeout { .. }));
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/responses/garbled"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let adapter = ResponsesProvider::new(Provider::OpenAi, server.uri(), "sk", TIMEOUT).unwrap();
    let err = adapter.poll("garbled").await.unwrap_err();
    assert!(matches!(err, DeepqError::ParseResponse { .. }));
}

// =============================================================================
// Gemini
// =============================================================================

#[tokio::test]
async fn gemini_finishes_inside_submit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "g-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_completed("Grounded answer")))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = GeminiProvider::new(server.uri(), "g-key", TIMEOUT).unwrap();
    match adapter.submit(&request("gemini-2.5-flash")).await.unwrap() {
        SubmitOutcome::Finished {
            provider_job_id,
            status: ProviderStatus::Completed { output, usage, .. },
        } => {
            assert_eq!(provider_job_id.as_deref(), Some("gem-resp-1"));
            assert_eq!(output, "Grounded answer");
            assert_eq!(usage.input_tokens, 1_000);
            assert_eq!(usage.output_tokens, 2_500);
            assert_eq!(usage.tool_calls, 3);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn gemini_blocked_prompt_is_content_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_blocked()))
        .mount(&server)
        .await;

    let adapter = GeminiProvider::new(server.uri(), "g-key", TIMEOUT).unwrap();
    let err = adapter.submit(&request("gemini-2.5-pro")).await.unwrap_err();
    assert!(matches!(err, DeepqError::ContentRejected { .. }));
}

#[tokio::test]
async fn gemini_has_nothing_to_poll() {
    let adapter = GeminiProvider::new("http://127.0.0.1:9", "g-key", TIMEOUT).unwrap();
    assert!(adapter.poll("anything").await.is_err());
    assert!(adapter.cancel("anything").await.is_ok());
}

// =============================================================================
// Chat completions
// =============================================================================

#[tokio::test]
async fn chat_completion_reports_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer x-key"))
        .and(body_partial_json(json!({ "model": "grok-4" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completed("Answer", 250_000_000)))
        .mount(&server)
        .await;

    let adapter =
        ChatCompletionsProvider::new(Provider::Grok, server.uri(), "x-key", TIMEOUT).unwrap();
    match adapter.submit(&request("grok-4")).await.unwrap() {
        SubmitOutcome::Finished {
            provider_job_id,
            status: ProviderStatus::Completed { output, usage, cost },
        } => {
            assert_eq!(provider_job_id.as_deref(), Some("chat-1"));
            assert_eq!(output, "Answer");
            assert_eq!(usage.tool_calls, 4);
            assert_eq!(cost, Some(Usd::from_micros(25_000)));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn chat_refusal_is_content_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_refused()))
        .mount(&server)
        .await;

    let adapter =
        ChatCompletionsProvider::new(Provider::Grok, server.uri(), "x-key", TIMEOUT).unwrap();
    let err = adapter.submit(&request("grok-4")).await.unwrap_err();
    assert!(matches!(err, DeepqError::ContentRejected { .. }));
}
