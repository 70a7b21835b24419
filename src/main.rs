//! deepq - deep research job queue
//!
//! CLI entry point.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use clap::Parser;
use std::process::ExitCode;

use deepq::cli::{self, Cli};
use deepq::core::logging::{self, LogSettings};
use deepq::storage::config::ResolvedConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = cli.effective_format();
    let pretty = cli.pretty;

    // Logging needs the configured level, so configuration resolves first.
    let resolved = ResolvedConfig::resolve(&cli::overrides(&cli));
    let config_level = resolved
        .as_ref()
        .ok()
        .and_then(|r| r.config.general.log_level.clone());
    logging::init(&LogSettings::resolve(
        cli.log_level.as_deref(),
        cli.verbose,
        config_level.as_deref(),
    ));

    let result = match resolved {
        Ok(resolved) => {
            tracing::debug!(
                config = %resolved.config_path.display(),
                config_source = %resolved.sources.config_path,
                database_source = %resolved.sources.database_path,
                "Configuration resolved"
            );
            cli::execute(cli, resolved).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = %e, code = e.error_code(), "Command failed");
            eprintln!("{}", deepq::render::error::render_error(&e, format, pretty));
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
