//! Provider wire bodies and engine shortcuts for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use deepq::core::budgets::BudgetLimits;
use deepq::core::engine::Engine;
use deepq::core::money::Usd;
use deepq::test_utils::{Provider, ScriptedProvider, test_engine};

// =============================================================================
// Responses API (openai / azure)
// =============================================================================

pub fn response_queued(id: &str) -> Value {
    json!({ "id": id, "object": "response", "status": "queued" })
}

pub fn response_in_progress(id: &str) -> Value {
    json!({ "id": id, "object": "response", "status": "in_progress" })
}

pub fn response_completed(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "object": "response",
        "status": "completed",
        "output": [
            { "type": "web_search_call", "status": "completed" },
            { "type": "web_search_call", "status": "completed" },
            {
                "type": "message",
                "role": "assistant",
                "content": [{ "type": "output_text", "text": text }]
            }
        ],
        "usage": { "input_tokens": 20_000, "output_tokens": 5_000, "total_tokens": 25_000 }
    })
}

pub fn response_failed(id: &str) -> Value {
    json!({
        "id": id,
        "object": "response",
        "status": "failed",
        "error": { "code": "server_error", "message": "research run crashed" }
    })
}

pub fn response_cancelled(id: &str) -> Value {
    json!({ "id": id, "object": "response", "status": "cancelled" })
}

// =============================================================================
// Gemini generateContent
// =============================================================================

pub fn gemini_completed(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP",
            "groundingMetadata": { "webSearchQueries": ["q1", "q2", "q3"] }
        }],
        "usageMetadata": {
            "promptTokenCount": 1_000,
            "candidatesTokenCount": 2_000,
            "thoughtsTokenCount": 500
        },
        "responseId": "gem-resp-1"
    })
}

pub fn gemini_blocked() -> Value {
    json!({ "promptFeedback": { "blockReason": "SAFETY" } })
}

// =============================================================================
// Chat completions (grok)
// =============================================================================

pub fn chat_completed(text: &str, cost_ticks: i64) -> Value {
    json!({
        "id": "chat-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 900,
            "completion_tokens": 300,
            "num_sources_used": 4,
            "cost_in_usd_ticks": cost_ticks
        }
    })
}

pub fn chat_refused() -> Value {
    json!({
        "id": "chat-2",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": null, "refusal": "I can't help with that." },
            "finish_reason": "stop"
        }]
    })
}

// =============================================================================
// Engines
// =============================================================================

pub fn scripted(provider: Provider) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(provider))
}

/// Engine over scripted providers with the given limits.
pub fn engine_with_limits(providers: &[Arc<ScriptedProvider>], limits: BudgetLimits) -> Engine {
    test_engine(providers).budget(limits).build().unwrap()
}

/// Limits with only a daily cap, in dollars.
pub fn daily_limit(dollars: f64) -> BudgetLimits {
    BudgetLimits {
        daily: Some(Usd::from_dollars(dollars)),
        ..BudgetLimits::default()
    }
}
