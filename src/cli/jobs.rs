//! Job commands: submit, status, result, cancel, list, events.

use super::Context;
use super::args::{CancelArgs, JobArgs, JobSpecArgs, ListArgs, SubmitArgs};
use crate::core::engine::SubmitJob;
use crate::core::models::{BudgetConstraints, JobFilter, JobId, JobSpec};
use crate::core::money::Usd;
use crate::error::{DeepqError, Result};

/// Build a request from CLI arguments.
///
/// # Errors
/// Returns an error if the prompt file cannot be read.
pub fn spec_from_args(args: &JobSpecArgs) -> Result<JobSpec> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            return Err(DeepqError::InvalidRequest("a prompt is required".to_string()));
        }
    };
    let mut spec = JobSpec::new(prompt).with_depth(args.depth.into());
    if let Some(provider) = args.provider {
        spec = spec.with_provider(provider.into());
    }
    if let Some(model) = &args.model {
        spec = spec.with_model(model.clone());
    }
    Ok(spec)
}

fn dollars(flag: &str, value: Option<f64>) -> Result<Option<Usd>> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(DeepqError::InvalidRequest(format!(
            "{flag} must be a positive amount"
        ))),
        Some(v) => Ok(Some(Usd::from_dollars(v))),
        None => Ok(None),
    }
}

/// # Errors
/// Returns admission and routing errors.
pub fn submit(ctx: &Context, args: &SubmitArgs) -> Result<()> {
    let constraints = BudgetConstraints {
        max_cost: dollars("--max-cost", args.max_cost)?,
        session_id: args.session.clone(),
        session_limit: dollars("--session-limit", args.session_limit)?,
    };
    let submitted = ctx.engine.submit(
        SubmitJob::new(spec_from_args(&args.spec)?)
            .priority(args.priority)
            .constraints(constraints),
    )?;
    ctx.emit("submit", &submitted)
}

/// # Errors
/// Returns `JobNotFound` or a storage error.
pub fn status(ctx: &Context, args: &JobArgs) -> Result<()> {
    let view = ctx.engine.get_status(&JobId::from(args.id.as_str()))?;
    ctx.emit("status", &view)
}

/// # Errors
/// Returns `JobNotFound` or a storage error.
pub fn result(ctx: &Context, args: &JobArgs) -> Result<()> {
    let result = ctx.engine.get_result(&JobId::from(args.id.as_str()))?;
    ctx.emit("result", &result)
}

/// # Errors
/// Returns `StateConflict` for finished jobs.
pub fn cancel(ctx: &Context, args: &CancelArgs) -> Result<()> {
    let view = ctx
        .engine
        .cancel(&JobId::from(args.id.as_str()), &args.reason)?;
    ctx.emit("cancel", &view)
}

/// # Errors
/// Returns a storage error.
pub fn list(ctx: &Context, args: &ListArgs) -> Result<()> {
    let filter = JobFilter {
        statuses: args.status.iter().map(|s| (*s).into()).collect(),
        provider: args.provider.map(Into::into),
        limit: Some(args.limit),
        ..JobFilter::default()
    };
    let jobs = ctx.engine.list(&filter)?;
    ctx.emit("list", jobs.as_slice())
}

/// # Errors
/// Returns `JobNotFound` or a storage error.
pub fn events(ctx: &Context, args: &JobArgs) -> Result<()> {
    let id = JobId::from(args.id.as_str());
    ctx.engine.get_status(&id)?;
    let events = ctx.engine.events(&id)?;
    ctx.emit("events", events.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{DepthArg, ProviderArg};
    use crate::core::models::ResearchDepth;
    use crate::core::provider::Provider;

    #[test]
    fn spec_from_prompt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "Survey grid-scale storage").unwrap();
        let spec = spec_from_args(&JobSpecArgs {
            prompt: None,
            prompt_file: Some(path),
            depth: DepthArg::Quick,
            provider: Some(ProviderArg::Gemini),
            model: None,
        })
        .unwrap();
        assert_eq!(spec.prompt, "Survey grid-scale storage");
        assert_eq!(spec.depth, ResearchDepth::Quick);
        assert_eq!(spec.provider, Some(Provider::Gemini));
    }

    #[test]
    fn non_positive_caps_are_rejected() {
        assert!(dollars("--max-cost", Some(0.0)).is_err());
        assert!(dollars("--max-cost", Some(f64::NAN)).is_err());
        assert_eq!(
            dollars("--max-cost", Some(2.5)).unwrap(),
            Some(Usd::from_cents(250))
        );
    }
}
