//! Machine-readable JSON output.
//!
//! Every command wraps its payload in the same envelope so scripts can check
//! `schemaVersion` and `command` before reading `data`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

pub const SCHEMA_VERSION: &str = "deepq.v1";

/// Envelope for all JSON output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotOutput<'a, T: ?Sized> {
    pub schema_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub command: &'a str,
    pub data: &'a T,
}

impl<'a, T: ?Sized> RobotOutput<'a, T> {
    pub fn new(command: &'a str, data: &'a T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            command,
            data,
        }
    }
}

/// Render `data` for `command` as JSON.
///
/// # Errors
/// Returns an error if `data` fails to serialize.
pub fn render_json<T: Serialize + ?Sized>(command: &str, data: &T, pretty: bool) -> Result<String> {
    let output = RobotOutput::new(command, data);
    Ok(if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::Usd;

    #[test]
    fn envelope_wraps_payload() {
        #[derive(Serialize)]
        struct Payload {
            cost: Usd,
        }
        let json = render_json(
            "status",
            &Payload {
                cost: Usd::from_cents(25),
            },
            false,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["schemaVersion"], SCHEMA_VERSION);
        assert_eq!(value["command"], "status");
        assert_eq!(value["data"]["cost"], 0.25);
        assert!(value["generatedAt"].is_string());
    }

    #[test]
    fn pretty_output_is_multiline() {
        let json = render_json("list", &[1, 2, 3], true).unwrap();
        assert!(json.contains('\n'));
    }
}
