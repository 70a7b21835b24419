//! Test utilities for deepq.
//!
//! Provides a scripted in-memory provider, request factories, a fast-ticking
//! engine builder and assertion macros for use across all test modules.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deepq::test_utils::*;
//!
//! let openai = Arc::new(ScriptedProvider::new(Provider::OpenAi));
//! let engine = test_engine(&[openai.clone()]).build().unwrap();
//! let submitted = engine.submit(make_test_submit("compare sodium-ion cells")).unwrap();
//! ```

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::dispatcher::{PollConfig, RetryConfig};
use crate::core::engine::{Engine, EngineBuilder, EngineSettings, SubmitJob};
use crate::core::health::CircuitConfig;
use crate::core::models::{JobId, JobSpec, JobStatus, JobStatusView, ResearchDepth};
use crate::core::money::Usd;
use crate::core::pricing::TokenUsage;
pub use crate::core::provider::Provider;
use crate::core::router::RoutingConfig;
use crate::error::{DeepqError, Result};
use crate::providers::{ProviderSet, ProviderStatus, ResearchProvider, SubmitOutcome, SubmitRequest};
use crate::storage::schema::Database;

// =============================================================================
// Scripted Provider
// =============================================================================

/// In-memory provider driven by queued responses.
///
/// Each call pops the next scripted response for its operation. With nothing
/// scripted, `submit` accepts with a fresh handle and `poll` completes with
/// [`ScriptedProvider::default_cost`].
#[derive(Debug)]
pub struct ScriptedProvider {
    provider: Provider,
    submits: Mutex<VecDeque<Result<SubmitOutcome>>>,
    polls: Mutex<VecDeque<Result<ProviderStatus>>>,
    submitted: Mutex<Vec<SubmitRequest>>,
    cancelled: Mutex<Vec<String>>,
    polls_seen: AtomicUsize,
    default_cost: Usd,
    submit_delay: Option<Duration>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            submits: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            polls_seen: AtomicUsize::new(0),
            default_cost: Usd::from_cents(5),
            submit_delay: None,
        }
    }

    /// Cost reported by the default completion.
    #[must_use]
    pub const fn default_cost(mut self, cost: Usd) -> Self {
        self.default_cost = cost;
        self
    }

    /// Sleep inside every `submit` call.
    #[must_use]
    pub const fn submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// Queue the next `submit` response.
    ///
    /// # Panics
    /// Panics if the script lock is poisoned.
    pub fn push_submit(&self, response: Result<SubmitOutcome>) -> &Self {
        self.submits.lock().unwrap().push_back(response);
        self
    }

    /// Queue the next `poll` response.
    ///
    /// # Panics
    /// Panics if the script lock is poisoned.
    pub fn push_poll(&self, response: Result<ProviderStatus>) -> &Self {
        self.polls.lock().unwrap().push_back(response);
        self
    }

    /// Queue `n` copies of a failing submit.
    pub fn fail_submits(&self, n: usize, make: impl Fn() -> DeepqError) -> &Self {
        for _ in 0..n {
            self.push_submit(Err(make()));
        }
        self
    }

    /// Requests seen by `submit`, in order.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.submitted.lock().unwrap().clone()
    }

    #[must_use]
    pub fn submit_count(&self) -> usize {
        self.submitted.lock().map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.polls_seen.load(Ordering::SeqCst)
    }

    /// Handles passed to `cancel`.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResearchProvider for ScriptedProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        let next = {
            let mut submitted = self
                .submitted
                .lock()
                .map_err(|_| DeepqError::Storage("script lock poisoned".into()))?;
            submitted.push(request.clone());
            self.submits
                .lock()
                .map_err(|_| DeepqError::Storage("script lock poisoned".into()))?
                .pop_front()
        };
        next.unwrap_or_else(|| {
            Ok(SubmitOutcome::Accepted {
                provider_job_id: format!("{}-resp-{}", self.provider, request.job_id),
            })
        })
    }

    async fn poll(&self, _provider_job_id: &str) -> Result<ProviderStatus> {
        self.polls_seen.fetch_add(1, Ordering::SeqCst);
        let next = self
            .polls
            .lock()
            .map_err(|_| DeepqError::Storage("script lock poisoned".into()))?
            .pop_front();
        next.unwrap_or_else(|| Ok(completed("research report", Some(self.default_cost))))
    }

    async fn cancel(&self, provider_job_id: &str) -> Result<()> {
        self.cancelled
            .lock()
            .map_err(|_| DeepqError::Storage("script lock poisoned".into()))?
            .push(provider_job_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Response Factories
// =============================================================================

/// Usage small enough to never matter for budgets.
#[must_use]
pub const fn make_test_usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 1_200,
        output_tokens: 800,
        tool_calls: 3,
    }
}

#[must_use]
pub fn completed(output: &str, cost: Option<Usd>) -> ProviderStatus {
    ProviderStatus::Completed {
        output: output.to_string(),
        usage: make_test_usage(),
        cost,
    }
}

#[must_use]
pub fn failed(reason: &str, cost: Option<Usd>) -> ProviderStatus {
    ProviderStatus::Failed {
        reason: reason.to_string(),
        usage: make_test_usage(),
        cost,
    }
}

#[must_use]
pub fn accepted(handle: &str) -> SubmitOutcome {
    SubmitOutcome::Accepted {
        provider_job_id: handle.to_string(),
    }
}

/// Retryable 5xx from `provider`.
#[must_use]
pub fn unavailable(provider: Provider) -> DeepqError {
    DeepqError::ProviderUnavailable {
        provider: provider.to_string(),
        status_code: Some(503),
        message: "service unavailable".to_string(),
    }
}

/// Terminal content-policy refusal from `provider`.
#[must_use]
pub fn content_rejected(provider: Provider) -> DeepqError {
    DeepqError::ContentRejected {
        provider: provider.to_string(),
        message: "request violates usage policy".to_string(),
    }
}

// =============================================================================
// Request Factories
// =============================================================================

#[must_use]
pub fn make_test_spec(prompt: &str) -> JobSpec {
    JobSpec::new(prompt).with_depth(ResearchDepth::Quick)
}

#[must_use]
pub fn make_test_submit(prompt: &str) -> SubmitJob {
    SubmitJob::new(make_test_spec(prompt))
}

/// Sample config TOML content for testing.
#[must_use]
pub fn make_test_config_toml() -> String {
    r#"[general]
workers = 2
log_level = "info"

[routing]
exploration = 0.0
seed = 42

[budget]
daily = 20.0
monthly = 200.0
warn_percent = 80

[providers.openai]
api_key_env = "DEEPQ_TEST_OPENAI_KEY"

[providers.azure]
enabled = false
"#
    .to_string()
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Millisecond-scale timings so worker tests finish quickly.
#[must_use]
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            same_provider_attempts: 3,
            max_attempts: 8,
        },
        poll: PollConfig {
            initial_ms: 5,
            max_ms: 20,
            growth: 1.5,
            lease_secs: 30,
            max_poll_errors: 5,
            idle_ms: 5,
        },
        call_timeout: Some(Duration::from_secs(5)),
        ..EngineSettings::default()
    }
}

/// Deterministic routing: no exploration, fixed seed.
#[must_use]
pub fn deterministic_routing() -> RoutingConfig {
    RoutingConfig {
        exploration: 0.0,
        seed: Some(7),
        ..RoutingConfig::default()
    }
}

/// Engine builder over an in-memory database with the given providers.
///
/// # Panics
/// Panics if the in-memory database cannot be created.
#[must_use]
pub fn test_engine(providers: &[Arc<ScriptedProvider>]) -> EngineBuilder {
    test_engine_on(Database::open_in_memory().unwrap(), providers)
}

/// Like [`test_engine`] over an existing database.
#[must_use]
pub fn test_engine_on(db: Database, providers: &[Arc<ScriptedProvider>]) -> EngineBuilder {
    let mut set = ProviderSet::new();
    for p in providers {
        let provider = p.provider();
        set.insert(Arc::clone(p) as Arc<dyn ResearchProvider>, provider.default_model());
    }
    Engine::builder(db)
        .providers(set)
        .routing(deterministic_routing())
        .circuit(CircuitConfig {
            cooldown_ms: 60_000,
            ..CircuitConfig::default()
        })
        .settings(fast_settings())
}

/// Poll `get_status` until `done` holds or `timeout` elapses.
///
/// # Panics
/// Panics on timeout or when the job cannot be read.
pub async fn wait_for(
    engine: &Engine,
    id: &JobId,
    timeout: Duration,
    done: impl Fn(&JobStatusView) -> bool,
) -> JobStatusView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = engine.get_status(id).unwrap();
        if done(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id}; last status {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the job reaches `status` with its settlement finished.
pub async fn wait_for_status(engine: &Engine, id: &JobId, status: JobStatus) -> JobStatusView {
    wait_for(engine, id, Duration::from_secs(10), |s| {
        s.status == status && s.settlement == crate::core::models::SettlementState::Done
    })
    .await
}

// =============================================================================
// Temporary Directories
// =============================================================================

/// An isolated temporary directory, removed on drop.
///
/// # Examples
///
/// ```rust,ignore
/// let dir = TestDir::new();
/// dir.create_file("config.toml", "[general]\nworkers = 2");
/// let db = dir.file_path("deepq.sqlite");
/// ```
pub struct TestDir {
    inner: tempfile::TempDir,
}

impl TestDir {
    /// # Panics
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: tempfile::tempdir().expect("Failed to create temp directory"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Create a file with the given content, creating parent directories.
    ///
    /// # Panics
    /// Panics if the file cannot be created or written.
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.inner.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        let mut file = fs::File::create(&path).expect("Failed to create test file");
        file.write_all(content.as_bytes())
            .expect("Failed to write test file");
    }

    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn read_file(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.inner.path().join(name))
    }

    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.inner.path().join(name)
    }

    /// Open (and migrate) a database file inside the directory.
    ///
    /// # Panics
    /// Panics if the database cannot be opened.
    #[must_use]
    pub fn database(&self, name: &str) -> Database {
        Database::open(&self.file_path(name)).expect("Failed to open test database")
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Assertion Macros
// =============================================================================

/// Assert that a string contains a substring.
#[macro_export]
macro_rules! assert_contains {
    ($haystack:expr, $needle:expr) => {
        let haystack = $haystack;
        let needle = $needle;
        assert!(
            haystack.contains(needle),
            "Expected string to contain {:?}\n\nActual string:\n{:?}",
            needle,
            haystack
        );
    };
}

/// Assert two `Usd` amounts are equal, printing dollars on failure.
#[macro_export]
macro_rules! assert_usd_eq {
    ($left:expr, $right:expr) => {
        let left: $crate::core::money::Usd = $left;
        let right: $crate::core::money::Usd = $right;
        assert!(
            left == right,
            "Usd mismatch: {} ({} micros) != {} ({} micros)",
            left,
            left.micros(),
            right,
            right.micros()
        );
    };
}
