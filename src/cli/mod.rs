//! CLI argument parsing and command dispatch.

pub mod admin;
pub mod args;
pub mod jobs;
pub mod run;

use serde::Serialize;

pub use args::{Cli, Commands, OutputFormat};

use crate::core::engine::Engine;
use crate::error::Result;
use crate::render::{self, HumanRender};
use crate::storage::config::{Overrides, ResolvedConfig};

/// Everything a command needs.
#[derive(Debug)]
pub struct Context {
    pub engine: Engine,
    pub resolved: ResolvedConfig,
    pub format: OutputFormat,
    pub pretty: bool,
}

impl Context {
    /// Open the engine for an already resolved configuration.
    ///
    /// # Errors
    /// Returns storage or provider construction errors.
    pub fn open(cli: &Cli, resolved: ResolvedConfig) -> Result<Self> {
        let engine = Engine::from_config(&resolved.config)?;
        Ok(Self {
            engine,
            resolved,
            format: cli.effective_format(),
            pretty: cli.pretty,
        })
    }

    /// Print a command result to stdout.
    ///
    /// # Errors
    /// Returns an error if JSON serialization fails.
    pub fn emit<T>(&self, command: &str, data: &T) -> Result<()>
    where
        T: Serialize + HumanRender + ?Sized,
    {
        let out = render::render(command, data, self.format, self.pretty)?;
        print!("{out}");
        if self.format == OutputFormat::Json {
            println!();
        }
        Ok(())
    }
}

/// Configuration overrides carried by the command line.
#[must_use]
pub fn overrides(cli: &Cli) -> Overrides {
    let workers = match &cli.command {
        Commands::Run(args) => args.workers,
        _ => None,
    };
    Overrides {
        config_path: cli.config.clone(),
        database_path: cli.db.clone(),
        workers,
    }
}

/// Run the parsed command.
///
/// # Errors
/// Returns the command's error for the caller to render.
pub async fn execute(cli: Cli, resolved: ResolvedConfig) -> Result<()> {
    let ctx = Context::open(&cli, resolved)?;

    match cli.command {
        Commands::Run(_) => run::execute(&ctx).await,
        Commands::Submit(args) => jobs::submit(&ctx, &args),
        Commands::Status(args) => jobs::status(&ctx, &args),
        Commands::Result(args) => jobs::result(&ctx, &args),
        Commands::Cancel(args) => jobs::cancel(&ctx, &args),
        Commands::List(args) => jobs::list(&ctx, &args),
        Commands::Events(args) => jobs::events(&ctx, &args),
        Commands::Reap(args) => admin::reap(&ctx, &args),
        Commands::Reconcile => admin::reconcile(&ctx),
        Commands::Health => admin::health(&ctx),
        Commands::Budget => admin::budget(&ctx),
        Commands::Pause(args) => admin::pause(&ctx, &args),
        Commands::Resume => admin::resume(&ctx),
        Commands::Route(args) => admin::route(&ctx, &args),
        Commands::Cleanup(args) => admin::cleanup(&ctx, &args),
    }
}
