//! Output rendering for human and robot modes.

pub mod error;
pub mod human;
pub mod robot;

use serde::Serialize;

use crate::cli::args::OutputFormat;
use crate::error::Result;
pub use human::{HumanRender, Message};

/// Render a command result in the requested format.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn render<T>(command: &str, data: &T, format: OutputFormat, pretty: bool) -> Result<String>
where
    T: Serialize + HumanRender + ?Sized,
{
    match format {
        OutputFormat::Human => Ok(data.render_human()),
        OutputFormat::Json => robot::render_json(command, data, pretty),
    }
}
