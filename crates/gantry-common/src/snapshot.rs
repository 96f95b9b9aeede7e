//! Frozen per-run configuration.
//!
//! A `ConfigSnapshot` is taken at trigger time and never mutated for the
//! lifetime of the run; price-table changes do not retroactively affect
//! running CRs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retry policy for rate-limit-class agent failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for a 1-based attempt number.
    pub fn delay_secs(&self, attempt: u32) -> u64 {
        self.base_delay_secs.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
    }
}

/// Per-million-token prices for one model, input and output priced
/// separately.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Model id → price mapping frozen into the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PriceTable(pub BTreeMap<String, ModelPrice>);

impl PriceTable {
    /// USD cost of one invocation. Unknown models cost 0; the caller logs
    /// the miss so accounting gaps are visible.
    pub fn cost_usd(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.0.get(model_id) {
            Some(price) => {
                (input_tokens as f64 / 1_000_000.0) * price.input_per_mtok
                    + (output_tokens as f64 / 1_000_000.0) * price.output_per_mtok
            }
            None => 0.0,
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.0.contains_key(model_id)
    }
}

/// Runtime configuration frozen into a run at trigger time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    /// Default model for agent calls.
    pub model: String,
    /// Explore-phase model; empty skips the phase.
    #[serde(default)]
    pub explore_model: String,
    /// Plan-phase model; empty skips the phase.
    #[serde(default)]
    pub plan_model: String,
    pub max_verification_loops: u32,
    pub max_review_loops: u32,
    pub max_tdd_iterations: u32,
    pub max_ci_loops: u32,
    pub max_rebase_attempts: u32,
    pub stage_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Cost circuit breaker; None disables it.
    pub max_cost_usd: Option<f64>,
    /// Release gate waits for an approval signal instead of auto-approving.
    pub require_approval: bool,
    /// Days a terminal CR's event stream is retained.
    pub event_retention_days: u32,
    /// Token cap on the repo-context prompt layer.
    pub repo_context_token_cap: usize,
    pub prices: PriceTable,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            explore_model: String::new(),
            plan_model: String::new(),
            max_verification_loops: 3,
            max_review_loops: 3,
            max_tdd_iterations: 5,
            max_ci_loops: 3,
            max_rebase_attempts: 3,
            stage_timeout_secs: 1800,
            agent_timeout_secs: 120,
            retry: RetryPolicy::default(),
            max_cost_usd: None,
            require_approval: false,
            event_retention_days: 7,
            repo_context_token_cap: 12_000,
            prices: PriceTable::default(),
        }
    }
}
