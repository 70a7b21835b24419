//! Model pricing and the cost estimator.
//!
//! Estimates are pure: they depend only on the request and the pricing table.
//! The same table turns provider-reported token usage into an actual cost
//! when a backend does not report dollars itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::models::{JobSpec, ResearchDepth};
use super::money::Usd;
use super::provider::Provider;

/// Rough prompt sizing used before any tokenizer sees the text.
const CHARS_PER_TOKEN: usize = 4;

/// Per-million token pricing for a specific model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    /// Model identifier (e.g., "o4-mini-deep-research").
    pub model: String,
    /// Cost per million input tokens (USD).
    pub input_per_million: f64,
    /// Cost per million output tokens (USD).
    pub output_per_million: f64,
    /// Surcharge per search/tool call (USD).
    pub per_tool_call: f64,
}

impl ModelPricing {
    fn new(model: &str, input_per_million: f64, output_per_million: f64, per_tool_call: f64) -> Self {
        Self {
            model: model.to_string(),
            input_per_million,
            output_per_million,
            per_tool_call,
        }
    }

    /// Cost of the given usage under this pricing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: &TokenUsage) -> Usd {
        let input = (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output = (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        let tools = usage.tool_calls as f64 * self.per_tool_call;
        Usd::from_dollars(input + output + tools)
    }
}

/// Token usage reported by a provider (or projected by the estimator).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_calls: u64,
}

/// Expected-cost range for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub provider: Provider,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub low: Usd,
    /// Amount reserved at admission.
    pub expected: Usd,
    pub high: Usd,
}

/// Model name to pricing.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::current()
    }
}

impl PricingTable {
    /// Published list prices for the supported research models.
    #[must_use]
    pub fn current() -> Self {
        let entries = [
            ModelPricing::new("o4-mini-deep-research", 2.0, 8.0, 0.01),
            ModelPricing::new("o3-deep-research", 10.0, 40.0, 0.01),
            ModelPricing::new("gemini-2.5-flash", 0.30, 2.50, 0.035),
            ModelPricing::new("gemini-2.5-pro", 1.25, 10.0, 0.035),
            ModelPricing::new("grok-4", 3.0, 15.0, 0.025),
            ModelPricing::new("grok-3-mini", 0.30, 0.50, 0.025),
        ];
        Self {
            models: entries
                .into_iter()
                .map(|p| (p.model.to_lowercase(), p))
                .collect(),
        }
    }

    /// An empty table, filled with [`PricingTable::insert`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn insert(&mut self, pricing: ModelPricing) {
        self.models.insert(pricing.model.to_lowercase(), pricing);
    }

    /// Pricing for `model`, falling back to the provider's default model.
    #[must_use]
    pub fn get(&self, provider: Provider, model: &str) -> Option<&ModelPricing> {
        self.models
            .get(&model.to_lowercase())
            .or_else(|| self.models.get(provider.default_model()))
    }

    #[must_use]
    pub fn models(&self) -> Vec<&ModelPricing> {
        let mut list: Vec<_> = self.models.values().collect();
        list.sort_by(|a, b| a.model.cmp(&b.model));
        list
    }
}

/// Stateless cost estimator over a pricing table.
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    table: PricingTable,
}

impl CostEstimator {
    #[must_use]
    pub const fn new(table: PricingTable) -> Self {
        Self { table }
    }

    #[must_use]
    pub const fn table(&self) -> &PricingTable {
        &self.table
    }

    /// Projected usage for a request, before any provider is involved.
    #[must_use]
    pub fn projected_usage(spec: &JobSpec) -> TokenUsage {
        let prompt_tokens = spec.prompt.chars().count().div_ceil(CHARS_PER_TOKEN) as u64;
        TokenUsage {
            input_tokens: prompt_tokens + context_tokens(spec.depth),
            output_tokens: spec.depth.output_tokens(),
            tool_calls: spec.depth.tool_calls(),
        }
    }

    /// Estimate the cost of running `spec` on `provider`/`model`.
    ///
    /// Unknown models are priced as the provider's default model; a provider
    /// with no pricing at all estimates to zero.
    #[must_use]
    pub fn estimate(&self, spec: &JobSpec, provider: Provider, model: &str) -> CostEstimate {
        let usage = Self::projected_usage(spec);
        let expected = self
            .table
            .get(provider, model)
            .map_or(Usd::ZERO, |p| p.cost(&usage));
        CostEstimate {
            provider,
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            low: expected.scale(0.5),
            expected,
            high: expected.scale(2.0),
        }
    }

    /// Actual cost from reported usage.
    #[must_use]
    pub fn cost_of(&self, provider: Provider, model: &str, usage: &TokenUsage) -> Usd {
        self.table
            .get(provider, model)
            .map_or(Usd::ZERO, |p| p.cost(usage))
    }
}

/// Retrieved source material the model reads per depth.
const fn context_tokens(depth: ResearchDepth) -> u64 {
    match depth {
        ResearchDepth::Quick => 20_000,
        ResearchDepth::Standard => 80_000,
        ResearchDepth::Deep => 250_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_pure_and_ordered() {
        let estimator = CostEstimator::default();
        let spec = JobSpec::new("Survey recent work on LSM compaction.");
        let a = estimator.estimate(&spec, Provider::OpenAi, "o4-mini-deep-research");
        let b = estimator.estimate(&spec, Provider::OpenAi, "o4-mini-deep-research");
        assert_eq!(a, b);
        assert!(a.low < a.expected && a.expected < a.high);
        assert_eq!(a.high, a.expected.scale(2.0));
    }

    #[test]
    fn depth_drives_cost() {
        let estimator = CostEstimator::default();
        let quick = JobSpec::new("q").with_depth(ResearchDepth::Quick);
        let deep = JobSpec::new("q").with_depth(ResearchDepth::Deep);
        let q = estimator.estimate(&quick, Provider::Grok, "grok-4");
        let d = estimator.estimate(&deep, Provider::Grok, "grok-4");
        assert!(d.expected > q.expected);
    }

    #[test]
    fn unknown_model_uses_provider_default_pricing() {
        let estimator = CostEstimator::default();
        let spec = JobSpec::new("x");
        let known = estimator.estimate(&spec, Provider::Gemini, "gemini-2.5-flash");
        let unknown = estimator.estimate(&spec, Provider::Gemini, "gemini-next");
        assert_eq!(known.expected, unknown.expected);
        assert_eq!(unknown.model, "gemini-next");
    }

    #[test]
    fn cost_from_usage() {
        let pricing = ModelPricing::new("m", 2.0, 8.0, 0.01);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            tool_calls: 10,
        };
        assert_eq!(pricing.cost(&usage), Usd::from_dollars(6.10));
    }
}
