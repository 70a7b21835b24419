//! OpenAI Responses API in background mode.
//!
//! Used by `openai` and `azure`. Submission creates a background response
//! and returns its id; polling reads the response until it reaches a terminal
//! status.
//!
//! Endpoints (relative to the base URL):
//! - `POST /v1/responses`
//! - `GET /v1/responses/{id}`
//! - `POST /v1/responses/{id}/cancel`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;

use super::{ProviderStatus, ResearchProvider, SubmitOutcome, SubmitRequest};
use crate::core::http::{build_client, send_json};
use crate::core::pricing::TokenUsage;
use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};

/// Adapter for the Responses API.
#[derive(Debug, Clone)]
pub struct ResponsesProvider {
    provider: Provider,
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ResponsesProvider {
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

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        // Azure takes the key in its own header.
        if self.provider == Provider::Azure {
            request.header("api-key", &self.api_key)
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/responses{path}", self.base_url)
    }
}

#[async_trait]
impl ResearchProvider for ResponsesProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let body = json!({
            "model": request.model,
            "input": request.prompt,
            "background": true,
            "tools": [{ "type": "web_search_preview" }],
            "max_tool_calls": request.max_tool_calls(),
            "max_output_tokens": request.max_output_tokens(),
            "metadata": { "deepq_job_id": request.job_id.as_str() },
        });
        let response: ResponseObject = send_json(
            self.provider,
            self.authorize(self.client.post(self.url("")).json(&body)),
            self.timeout,
        )
        .await?;

        let status = response.to_status(self.provider)?;
        if status.is_terminal() {
            Ok(SubmitOutcome::Finished {
                provider_job_id: Some(response.id),
                status,
            })
        } else {
            Ok(SubmitOutcome::Accepted {
                provider_job_id: response.id,
            })
        }
    }

    async fn poll(&self, provider_job_id: &str) -> Result<ProviderStatus> {
        let response: ResponseObject = send_json(
            self.provider,
            self.authorize(self.client.get(self.url(&format!("/{provider_job_id}")))),
            self.timeout,
        )
        .await?;
        response.to_status(self.provider)
    }

    async fn cancel(&self, provider_job_id: &str) -> Result<()> {
        let _: ResponseObject = send_json(
            self.provider,
            self.authorize(
                self.client
                    .post(self.url(&format!("/{provider_job_id}/cancel"))),
            ),
            self.timeout,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ResponseObject {
    id: String,
    status: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
    #[serde(default)]
    error: Option<ResponseError>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

impl ResponseObject {
    fn usage(&self) -> TokenUsage {
        let tool_calls = self
            .output
            .iter()
            .filter(|item| item.kind.ends_with("_call"))
            .count() as u64;
        self.usage.as_ref().map_or(
            TokenUsage {
                tool_calls,
                ..TokenUsage::default()
            },
            |u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                tool_calls,
            },
        )
    }

    fn text(&self) -> String {
        if let Some(text) = &self.output_text {
            return text.clone();
        }
        self.output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| item.content.iter())
            .filter(|part| part.kind == "output_text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn to_status(&self, provider: Provider) -> Result<ProviderStatus> {
        let usage = self.usage();
        match self.status.as_str() {
            "queued" | "in_progress" => Ok(ProviderStatus::Pending),
            "completed" => Ok(ProviderStatus::Completed {
                output: self.text(),
                usage,
                cost: None,
            }),
            "failed" => {
                let reason = self.error.as_ref().map_or_else(
                    || "provider reported failure".to_string(),
                    |e| {
                        format!(
                            "{}: {}",
                            e.code.as_deref().unwrap_or("error"),
                            e.message.as_deref().unwrap_or("no message")
                        )
                    },
                );
                Ok(ProviderStatus::Failed {
                    reason,
                    usage,
                    cost: None,
                })
            }
            "incomplete" => Ok(ProviderStatus::Failed {
                reason: format!(
                    "incomplete: {}",
                    self.incomplete_details
                        .as_ref()
                        .and_then(|d| d.reason.as_deref())
                        .unwrap_or("unknown")
                ),
                usage,
                cost: None,
            }),
            "cancelled" => Ok(ProviderStatus::Cancelled { usage, cost: None }),
            other => Err(DeepqError::ParseResponse {
                provider: provider.to_string(),
                message: format!("unexpected response status '{other}'"),
            }),
        }
    }
}
