//! Gemini `generateContent` with Google Search grounding.
//!
//! Synchronous: the whole research run happens inside `submit`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{
    ProviderStatus, ResearchProvider, SubmitOutcome, SubmitRequest, nothing_to_poll,
};
use crate::core::http::{build_client, send_json};
use crate::core::pricing::TokenUsage;
use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ResearchProvider for GeminiProvider {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "tools": [{ "google_search": {} }],
            "generationConfig": { "maxOutputTokens": request.max_output_tokens() },
        });
        let response: GenerateResponse = send_json(
            Provider::Gemini,
            self.client
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body),
            self.timeout,
        )
        .await?;

        Ok(SubmitOutcome::Finished {
            provider_job_id: response.response_id.clone(),
            status: response.into_status()?,
        })
    }

    async fn poll(&self, _provider_job_id: &str) -> Result<ProviderStatus> {
        Err(nothing_to_poll(Provider::Gemini))
    }

    async fn cancel(&self, _provider_job_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    web_search_queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn usage(&self) -> TokenUsage {
        let tool_calls = self
            .candidates
            .iter()
            .filter_map(|c| c.grounding_metadata.as_ref())
            .map(|g| g.web_search_queries.len() as u64)
            .sum::<u64>();
        self.usage_metadata.as_ref().map_or(
            TokenUsage {
                tool_calls,
                ..TokenUsage::default()
            },
            |u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count + u.thoughts_token_count,
                tool_calls,
            },
        )
    }

    fn into_status(self) -> Result<ProviderStatus> {
        if let Some(reason) = self.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
            return Err(DeepqError::ContentRejected {
                provider: Provider::Gemini.to_string(),
                message: format!("prompt blocked: {reason}"),
            });
        }
        let usage = self.usage();
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Ok(ProviderStatus::Failed {
                reason: "no candidates returned".to_string(),
                usage,
                cost: None,
            });
        };

        let finish = candidate.finish_reason.unwrap_or_default();
        match finish.as_str() {
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" => {
                Err(DeepqError::ContentRejected {
                    provider: Provider::Gemini.to_string(),
                    message: format!("response blocked: {finish}"),
                })
            }
            _ => {
                let output = candidate
                    .content
                    .map(|c| {
                        c.parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                Ok(ProviderStatus::Completed {
                    output,
                    usage,
                    cost: None,
                })
            }
        }
    }
}
