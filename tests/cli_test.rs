//! End-to-end tests for the deepq binary.
//!
//! Each test gets its own database and a config path that does not exist, so
//! defaults apply. Only OpenAI has a key, and nothing here runs workers, so no
//! provider is ever contacted.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

mod common;

use common::logger::TestLogger;
use deepq::test_utils::TestDir;

// =============================================================================
// Test Helpers
// =============================================================================

struct Cli {
    dir: TestDir,
}

impl Cli {
    fn new() -> Self {
        Self { dir: TestDir::new() }
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("deepq").expect("deepq binary");
        cmd.env("DEEPQ_CONFIG", self.dir.file_path("missing-config.toml"))
            .env("DEEPQ_DB", self.dir.file_path("deepq.sqlite"))
            .env("OPENAI_API_KEY", "sk-test")
            .env_remove("DEEPQ_WORKERS")
            .env_remove("DEEPQ_LOG_FILE")
            .env_remove("AZURE_OPENAI_API_KEY")
            .env_remove("GEMINI_API_KEY")
            .env_remove("XAI_API_KEY");
        cmd
    }

    /// Run with `--json` and return the envelope's `data`.
    fn json(&self, args: &[&str]) -> Value {
        let output = self.cmd().arg("--json").args(args).output().expect("run deepq");
        assert!(
            output.status.success(),
            "deepq {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let envelope: Value = serde_json::from_slice(&output.stdout).expect("JSON envelope");
        assert_eq!(envelope["schemaVersion"], "deepq.v1");
        assert_eq!(envelope["command"], args[0]);
        envelope["data"].clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn help_lists_commands() {
    Cli::new()
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("route"));
}

#[test]
fn submitted_job_is_visible_to_status_and_list() {
    let log = TestLogger::new("submitted_job_is_visible_to_status_and_list");
    let cli = Cli::new();

    log.phase("submit");
    let submitted = cli.json(&["submit", "history of the lithium supply chain", "--depth", "quick"]);
    assert_eq!(submitted["provider"], "openai");
    let id = submitted["job_id"].as_str().expect("job id").to_string();

    log.phase("status");
    let status = cli.json(&["status", &id]);
    assert_eq!(status["id"], id.as_str());
    assert_eq!(status["status"], "queued");

    log.phase("list");
    let listed = cli.json(&["list", "--status", "queued"]);
    let rows = listed.as_array().expect("job rows");
    assert_eq!(rows.len(), 1);

    log.phase("events");
    let events = cli.json(&["events", &id]);
    assert_eq!(events.as_array().map(Vec::len), Some(1));
    log.finish_ok();
}

#[test]
fn cancel_then_cancel_again_conflicts() {
    let cli = Cli::new();
    let submitted = cli.json(&["submit", "desalination costs", "--depth", "quick"]);
    let id = submitted["job_id"].as_str().expect("job id").to_string();

    let cancelled = cli.json(&["cancel", &id, "--reason", "duplicate"]);
    assert_eq!(cancelled["status"], "cancelled");

    cli.cmd().args(["cancel", &id]).assert().code(5);
}

#[test]
fn paused_ledger_rejects_submissions() {
    let cli = Cli::new();
    cli.cmd().args(["pause", "quarter close"]).assert().success();

    let budget = cli.json(&["budget"]);
    assert_eq!(budget["paused"], true);
    assert_eq!(budget["reason"], "quarter close");

    cli.cmd()
        .args(["submit", "ocean heat content", "--depth", "quick"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DEEPQ-B002"));

    cli.cmd().arg("resume").assert().success();
    cli.json(&["submit", "ocean heat content", "--depth", "quick"]);
}

#[test]
fn tight_job_cap_is_rejected() {
    Cli::new()
        .cmd()
        .args(["--json", "submit", "a survey", "--max-cost", "0.01"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("\"category\""));
}

#[test]
fn unknown_job_is_a_conflict() {
    Cli::new()
        .cmd()
        .args(["status", "no-such-job"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("job not found"));
}

#[test]
fn pinning_a_provider_without_a_key_fails() {
    Cli::new()
        .cmd()
        .args(["submit", "p", "--provider", "grok"])
        .assert()
        .failure();
}

#[test]
fn route_explains_candidates_without_submitting() {
    let cli = Cli::new();
    let plan = cli.json(&["route", "compare heat pump vendors", "--depth", "quick"]);
    let candidates = plan["candidates"].as_array().expect("candidates");
    assert!(!candidates.is_empty());
    assert!(plan["estimate"].is_object());

    let listed = cli.json(&["list"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(0));
}

#[test]
fn reconcile_and_health_work_on_an_empty_store() {
    let cli = Cli::new();
    let report = cli.json(&["reconcile"]);
    assert_eq!(report["settled"], 0);
    cli.json(&["health"]);
}
