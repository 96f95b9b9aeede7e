//! Runtime configuration.
//!
//! Loaded once at startup from an optional TOML file plus environment
//! overrides. Each triggered run freezes the pipeline section into a
//! [`ConfigSnapshot`]; later edits never affect in-flight runs.

use anyhow::{Context, Result};
use gantry_common::snapshot::{ConfigSnapshot, ModelPrice, PriceTable, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Server-level settings (not frozen into runs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Per-CR worktrees live under `{runs_dir}/{cr_id}/{repo_name}`.
    pub runs_dir: PathBuf,
    /// Shared bare clones, one per repository URL.
    pub clones_dir: PathBuf,
    pub tenant: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3960,
            db_path: PathBuf::from(".gantry/gantry.db"),
            runs_dir: PathBuf::from("runs"),
            clones_dir: PathBuf::from(".gantry/clones"),
            tenant: "default".to_string(),
        }
    }
}

/// Pipeline settings frozen into each run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: Option<String>,
    pub explore_model: Option<String>,
    pub plan_model: Option<String>,
    pub max_verification_loops: Option<u32>,
    pub max_review_loops: Option<u32>,
    pub max_tdd_iterations: Option<u32>,
    pub max_ci_loops: Option<u32>,
    pub max_rebase_attempts: Option<u32>,
    pub stage_timeout_secs: Option<u64>,
    pub agent_timeout_secs: Option<u64>,
    pub retry_max_attempts: Option<u32>,
    pub retry_base_delay_secs: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub require_approval: Option<bool>,
    pub event_retention_days: Option<u32>,
    pub repo_context_token_cap: Option<usize>,
    /// model id → {input_per_mtok, output_per_mtok}
    pub prices: BTreeMap<String, ModelPrice>,
}

/// Agent backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// CLI command for the default backend; `GANTRY_AGENT_CMD` overrides.
    pub command: String,
    /// Calls per minute across all CRs sharing this process's API key.
    pub calls_per_minute: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            calls_per_minute: 60,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfigOpt,
    pub pipeline: PipelineConfig,
    pub agent: AgentConfig,
}

/// Optional-field mirror of [`ServerConfig`] for TOML parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigOpt {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub clones_dir: Option<PathBuf>,
    pub tenant: Option<String>,
}

impl Config {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn server(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            port: self.server.port.unwrap_or(defaults.port),
            db_path: self.server.db_path.clone().unwrap_or(defaults.db_path),
            runs_dir: self.server.runs_dir.clone().unwrap_or(defaults.runs_dir),
            clones_dir: self.server.clones_dir.clone().unwrap_or(defaults.clones_dir),
            tenant: self.server.tenant.clone().unwrap_or(defaults.tenant),
        }
    }

    /// Freeze the pipeline section into a per-run snapshot.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let defaults = ConfigSnapshot::default();
        let p = &self.pipeline;
        ConfigSnapshot {
            model: p.model.clone().unwrap_or(defaults.model),
            explore_model: p.explore_model.clone().unwrap_or_default(),
            plan_model: p.plan_model.clone().unwrap_or_default(),
            max_verification_loops: p
                .max_verification_loops
                .unwrap_or(defaults.max_verification_loops),
            max_review_loops: p.max_review_loops.unwrap_or(defaults.max_review_loops),
            max_tdd_iterations: p.max_tdd_iterations.unwrap_or(defaults.max_tdd_iterations),
            max_ci_loops: p.max_ci_loops.unwrap_or(defaults.max_ci_loops),
            max_rebase_attempts: p.max_rebase_attempts.unwrap_or(defaults.max_rebase_attempts),
            stage_timeout_secs: p.stage_timeout_secs.unwrap_or(defaults.stage_timeout_secs),
            agent_timeout_secs: p.agent_timeout_secs.unwrap_or(defaults.agent_timeout_secs),
            retry: RetryPolicy {
                max_attempts: p.retry_max_attempts.unwrap_or(defaults.retry.max_attempts),
                base_delay_secs: p
                    .retry_base_delay_secs
                    .unwrap_or(defaults.retry.base_delay_secs),
            },
            max_cost_usd: p.max_cost_usd,
            require_approval: p.require_approval.unwrap_or(defaults.require_approval),
            event_retention_days: p
                .event_retention_days
                .unwrap_or(defaults.event_retention_days),
            repo_context_token_cap: p
                .repo_context_token_cap
                .unwrap_or(defaults.repo_context_token_cap),
            prices: PriceTable(p.prices.clone()),
        }
    }

    pub fn agent_command(&self) -> String {
        std::env::var("GANTRY_AGENT_CMD").unwrap_or_else(|_| self.agent.command.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/gantry.toml")).unwrap();
        assert_eq!(config.server().port, 3960);
        assert_eq!(config.snapshot().max_tdd_iterations, 5);
    }

    #[test]
    fn toml_overrides_defaults() {
        let raw = r#"
            [server]
            port = 8080
            tenant = "acme"

            [pipeline]
            max_review_loops = 2
            max_cost_usd = 25.0

            [pipeline.prices.fast-model]
            input_per_mtok = 3.0
            output_per_mtok = 15.0

            [agent]
            command = "claude-local"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server().port, 8080);
        assert_eq!(config.server().tenant, "acme");
        let snap = config.snapshot();
        assert_eq!(snap.max_review_loops, 2);
        assert_eq!(snap.max_cost_usd, Some(25.0));
        assert!(snap.prices.contains("fast-model"));
        // Untouched limits keep their defaults.
        assert_eq!(snap.max_tdd_iterations, 5);
        assert_eq!(config.agent.command, "claude-local");
    }

    #[test]
    fn snapshot_is_detached_from_config() {
        let mut config = Config::default();
        let snap = config.snapshot();
        config.pipeline.max_review_loops = Some(99);
        assert_eq!(snap.max_review_loops, 3);
    }
}
