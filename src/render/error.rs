//! Error rendering for the operator binary.

use serde::Serialize;

use crate::cli::args::OutputFormat;
use crate::error::DeepqError;

/// Render an error for stderr in the requested format.
#[must_use]
pub fn render_error(error: &DeepqError, format: OutputFormat, pretty: bool) -> String {
    match format {
        OutputFormat::Json => render_error_json(error, pretty),
        OutputFormat::Human => render_simple(error),
    }
}

/// Render error as structured JSON for machine consumption.
#[must_use]
pub fn render_error_json(error: &DeepqError, pretty: bool) -> String {
    let error_json = ErrorJson::from_error(error);
    let rendered = if pretty {
        serde_json::to_string_pretty(&error_json)
    } else {
        serde_json::to_string(&error_json)
    };
    rendered.unwrap_or_else(|_| render_simple(error))
}

/// `error[CODE]: message` plus a retry hint where one applies.
#[must_use]
pub fn render_simple(error: &DeepqError) -> String {
    let mut out = format!("error[{}]: {error}", error.error_code());
    if let Some(after) = error.retry_after() {
        out.push_str(&format!("\n  retry after {}s", after.as_secs()));
    } else if error.is_retryable() {
        out.push_str("\n  this error is transient; retrying may succeed");
    }
    out
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorJson {
    error_code: String,
    category: String,
    message: String,
    is_retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl ErrorJson {
    fn from_error(error: &DeepqError) -> Self {
        Self {
            error_code: error.error_code().to_string(),
            category: error.category().to_string(),
            message: error.to_string(),
            is_retryable: error.is_retryable(),
            provider: error.provider().map(String::from),
            retry_after_seconds: error.retry_after().map(|d| d.as_secs()),
        }
    }
}
