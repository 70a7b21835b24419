//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::core::models::{JobStatus, ResearchDepth};
use crate::core::provider::Provider;

/// Deep research job queue: scheduling, provider routing and budget enforcement.
#[derive(Parser, Debug)]
#[command(name = "deepq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    // === Global flags ===
    /// Config file (overrides DEEPQ_CONFIG)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Database file (overrides DEEPQ_DB)
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Shorthand for JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    #[must_use]
    pub const fn effective_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run dispatcher/poller workers until interrupted
    Run(RunArgs),

    /// Submit a research job
    Submit(SubmitArgs),

    /// Show a job's status
    Status(JobArgs),

    /// Show a job's result
    Result(JobArgs),

    /// Cancel a job
    Cancel(CancelArgs),

    /// List jobs
    List(ListArgs),

    /// Show a job's status history
    Events(JobArgs),

    /// Cancel jobs stuck beyond their timeouts
    Reap(ReapArgs),

    /// Finish interrupted settlements
    Reconcile,

    /// Show provider health and circuit state
    Health,

    /// Show budget scopes and pause state
    Budget,

    /// Stop admitting new jobs
    Pause(PauseArgs),

    /// Resume admitting new jobs
    Resume,

    /// Explain routing and estimate cost for a prompt without submitting it
    Route(RouteArgs),

    /// Delete settled jobs older than the retention window
    Cleanup(CleanupArgs),
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of workers (overrides DEEPQ_WORKERS)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

/// What to research. Shared by `submit` and `route`.
#[derive(Args, Debug)]
pub struct JobSpecArgs {
    /// Research prompt
    #[arg(value_name = "PROMPT", required_unless_present = "prompt_file")]
    pub prompt: Option<String>,

    /// Read the prompt from a file
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    pub prompt_file: Option<PathBuf>,

    /// Research depth
    #[arg(long, value_enum, default_value = "standard")]
    pub depth: DepthArg,

    /// Pin the job to a provider
    #[arg(long, value_enum)]
    pub provider: Option<ProviderArg>,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,
}

/// Arguments for the `submit` command.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub spec: JobSpecArgs,

    /// Higher runs first
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub priority: i64,

    /// Per-job spending cap in USD
    #[arg(long, value_name = "USD")]
    pub max_cost: Option<f64>,

    /// Session to charge
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    /// Session spending cap in USD (requires --session)
    #[arg(long, value_name = "USD", requires = "session")]
    pub session_limit: Option<f64>,
}

/// A single job id.
#[derive(Args, Debug)]
pub struct JobArgs {
    /// Job id
    pub id: String,
}

/// Arguments for the `cancel` command.
#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Job id
    pub id: String,

    /// Reason recorded on the job
    #[arg(long, default_value = "operator request")]
    pub reason: String,
}

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only jobs in these states
    #[arg(long, value_enum)]
    pub status: Vec<StatusArg>,

    /// Only jobs bound to this provider
    #[arg(long, value_enum)]
    pub provider: Option<ProviderArg>,

    /// Maximum rows
    #[arg(long, default_value = "50")]
    pub limit: usize,
}

/// Arguments for the `reap` command.
#[derive(Args, Debug)]
pub struct ReapArgs {
    /// Queued jobs older than this are cancelled (default from config)
    #[arg(long, value_name = "SECONDS")]
    pub queued_timeout: Option<u64>,

    /// Processing jobs started before this are cancelled (default from config)
    #[arg(long, value_name = "SECONDS")]
    pub processing_timeout: Option<u64>,
}

/// Arguments for the `pause` command.
#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Why admission is paused
    #[arg(default_value = "paused by operator")]
    pub reason: String,
}

/// Arguments for the `route` command.
#[derive(Args, Debug)]
pub struct RouteArgs {
    #[command(flatten)]
    pub spec: JobSpecArgs,
}

/// Arguments for the `cleanup` command.
#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Retention window in days (default from config)
    #[arg(long, value_name = "DAYS")]
    pub older_than_days: Option<i64>,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text
    #[default]
    Human,
    /// JSON envelope
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    #[value(name = "openai")]
    OpenAi,
    Azure,
    Gemini,
    Grok,
}

impl From<ProviderArg> for Provider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::OpenAi => Self::OpenAi,
            ProviderArg::Azure => Self::Azure,
            ProviderArg::Gemini => Self::Gemini,
            ProviderArg::Grok => Self::Grok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DepthArg {
    Quick,
    Standard,
    Deep,
}

impl From<DepthArg> for ResearchDepth {
    fn from(arg: DepthArg) -> Self {
        match arg {
            DepthArg::Quick => Self::Quick,
            DepthArg::Standard => Self::Standard,
            DepthArg::Deep => Self::Deep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Queued => Self::Queued,
            StatusArg::Processing => Self::Processing,
            StatusArg::Completed => Self::Completed,
            StatusArg::Failed => Self::Failed,
            StatusArg::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_flags() {
        let cli = Cli::try_parse_from([
            "deepq",
            "--json",
            "submit",
            "state of solid-state batteries",
            "--provider",
            "openai",
            "--depth",
            "deep",
            "--priority",
            "-2",
            "--session",
            "s1",
            "--session-limit",
            "3.5",
        ])
        .unwrap();
        assert_eq!(cli.effective_format(), OutputFormat::Json);
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.spec.provider.map(Provider::from), Some(Provider::OpenAi));
        assert_eq!(ResearchDepth::from(args.spec.depth), ResearchDepth::Deep);
        assert_eq!(args.priority, -2);
        assert_eq!(args.session_limit, Some(3.5));
    }

    #[test]
    fn session_limit_requires_session() {
        assert!(Cli::try_parse_from(["deepq", "submit", "p", "--session-limit", "1"]).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(Cli::try_parse_from(["deepq", "submit", "p", "--provider", "unknown"]).is_err());
    }

    #[test]
    fn list_accepts_repeated_status() {
        let cli = Cli::try_parse_from([
            "deepq", "list", "--status", "queued", "--status", "failed",
        ])
        .unwrap();
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.status, vec![StatusArg::Queued, StatusArg::Failed]);
    }
}
