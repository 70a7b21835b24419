//! xAI chat completions with live search, used by `grok`.
//!
//! Synchronous like Gemini.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{
    ProviderStatus, ResearchProvider, SubmitOutcome, SubmitRequest, nothing_to_poll,
};
use crate::core::http::{build_client, send_json};
use crate::core::money::Usd;
use crate::core::pricing::TokenUsage;
use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};

/// xAI reports request cost in units of 1e-10 USD.
const COST_TICKS_PER_MICRO: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct ChatCompletionsProvider {
    provider: Provider,
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ChatCompletionsProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ResearchProvider for ChatCompletionsProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let body = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_output_tokens(),
            "search_parameters": {
                "mode": "auto",
                "max_search_results": request.max_tool_calls(),
            },
        });
        let response: ChatResponse = send_json(
            self.provider,
            self.client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
            self.timeout,
        )
        .await?;

        Ok(SubmitOutcome::Finished {
            provider_job_id: response.id.clone(),
            status: response.into_status(self.provider)?,
        })
    }

    async fn poll(&self, _provider_job_id: &str) -> Result<ProviderStatus> {
        Err(nothing_to_poll(self.provider))
    }

    async fn cancel(&self, _provider_job_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    num_sources_used: u64,
    #[serde(default)]
    cost_in_usd_ticks: Option<i64>,
}

impl ChatResponse {
    fn into_status(self, provider: Provider) -> Result<ProviderStatus> {
        let (usage, cost) = self.usage.as_ref().map_or((TokenUsage::default(), None), |u| {
            (
                TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    tool_calls: u.num_sources_used,
                },
                u.cost_in_usd_ticks
                    .map(|ticks| Usd::from_micros(ticks / COST_TICKS_PER_MICRO)),
            )
        });

        let Some(choice) = self.choices.into_iter().next() else {
            return Ok(ProviderStatus::Failed {
                reason: "no choices returned".to_string(),
                usage,
                cost,
            });
        };

        if let Some(refusal) = choice.message.refusal {
            return Err(DeepqError::ContentRejected {
                provider: provider.to_string(),
                message: refusal,
            });
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(DeepqError::ContentRejected {
                provider: provider.to_string(),
                message: "response withheld by content filter".to_string(),
            });
        }

        Ok(ProviderStatus::Completed {
            output: choice.message.content.unwrap_or_default(),
            usage,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_with_reported_cost() {
        let raw = r#"{
            "id": "chat-1",
            "choices": [{"message": {"content": "Answer"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 300,
                      "num_sources_used": 4, "cost_in_usd_ticks": 125000000}
        }"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        match response.into_status(Provider::Grok).unwrap() {
            ProviderStatus::Completed { output, usage, cost } => {
                assert_eq!(output, "Answer");
                assert_eq!(usage.tool_calls, 4);
                assert_eq!(cost, Some(Usd::from_micros(12_500)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn content_filter_is_rejection() {
        let raw = r#"{"choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            response.into_status(Provider::Grok),
            Err(DeepqError::ContentRejected { .. })
        ));
    }
}
