//! Persistence: configuration, paths, the SQLite schema and the job store.

pub mod config;
pub mod jobs;
pub mod paths;
pub mod schema;

pub use config::{
    Config, ConfigSource, ConfigSources, ENV_CONFIG, ENV_DB, ENV_WORKERS, Overrides,
    ResolvedConfig,
};
pub use jobs::JobStore;
pub use paths::AppPaths;
pub use schema::Database;
