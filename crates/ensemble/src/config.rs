use std::time::Duration;

use serde::Deserialize;

use crate::Error;
use crate::agent::WorkerSpec;
use crate::llm::retry::RetryConfig;
use crate::orchestrator::OrchestrationConfig;
use crate::plan::WorkerKind;
use crate::tool::ToolBinding;

/// Top-level configuration loaded from `ensemble.toml`.
#[derive(Debug, Deserialize)]
pub struct EnsembleConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub workers: Vec<WorkerSection>,
}

/// Oracle provider configuration.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub retry: Option<RetrySection>,
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}

/// Retry settings for transient oracle failures (429, 500, 502, 503, 529).
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetrySection {
    fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Run-level limits with sensible defaults.
#[derive(Debug, Deserialize)]
pub struct OrchestrationSection {
    /// Concurrent task ceiling. Absent means as wide as the plan's worker
    /// diversity.
    pub max_parallelism: Option<usize>,
    #[serde(default = "default_per_task_timeout_seconds")]
    pub per_task_timeout_seconds: u64,
    #[serde(default = "default_max_plan_tasks")]
    pub max_plan_tasks: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Wall-clock deadline in seconds for the whole run.
    pub run_timeout_seconds: Option<u64>,
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,
}

fn default_per_task_timeout_seconds() -> u64 {
    60
}

fn default_max_plan_tasks() -> usize {
    12
}

fn default_max_turns() -> usize {
    10
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_tool_output_limit() -> usize {
    10_000
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            per_task_timeout_seconds: default_per_task_timeout_seconds(),
            max_plan_tasks: default_max_plan_tasks(),
            max_turns: default_max_turns(),
            max_tokens: default_max_tokens(),
            run_timeout_seconds: None,
            tool_output_limit: default_tool_output_limit(),
        }
    }
}

/// One worker declaration.
#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    pub kind: WorkerKind,
    pub system_prompt: String,
    /// Tool bindings by registered name.
    #[serde(default)]
    pub tools: Vec<ToolBinding>,
    pub max_turns: Option<usize>,
    pub max_tokens: Option<u32>,
}

impl EnsembleConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, Error> {
        toml::from_str(input).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn orchestration_config(&self) -> OrchestrationConfig {
        let retry = self
            .provider
            .retry
            .as_ref()
            .map(|r| r.to_retry_config())
            .unwrap_or_default();
        OrchestrationConfig {
            max_parallelism: self.orchestration.max_parallelism,
            per_task_timeout: Duration::from_secs(self.orchestration.per_task_timeout_seconds),
            max_plan_tasks: self.orchestration.max_plan_tasks,
            max_turns: self.orchestration.max_turns,
            max_tokens: self.orchestration.max_tokens,
            retry,
            run_timeout: self
                .orchestration
                .run_timeout_seconds
                .map(Duration::from_secs),
            tool_output_limit: self.orchestration.tool_output_limit,
        }
    }

    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        self.workers
            .iter()
            .map(|w| {
                let mut spec = WorkerSpec::new(w.kind, w.system_prompt.clone());
                spec.tools = w.tools.clone();
                spec.max_turns = w.max_turns;
                spec.max_tokens = w.max_tokens;
                spec
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
[provider]
model = "claude-sonnet-4-20250514"
api_key_env = "MY_KEY"

[provider.retry]
max_retries = 4
base_delay_ms = 250

[orchestration]
max_parallelism = 3
per_task_timeout_seconds = 90
max_plan_tasks = 8
run_timeout_seconds = 600

[[workers]]
kind = "data_analyst"
system_prompt = "You analyze datasets."
tools = [{ name = "sql_query", required = true }, { name = "summarize" }]

[[workers]]
kind = "report"
system_prompt = "You write reports."
max_turns = 4
"#;

    #[test]
    fn parses_full_config() {
        let config = EnsembleConfig::from_toml_str(FULL_CONFIG).unwrap();
        assert_eq!(config.provider.model, "claude-sonnet-4-20250514");
        assert_eq!(config.provider.api_key_env, "MY_KEY");
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].kind, WorkerKind::DataAnalyst);
        assert_eq!(config.workers[0].tools.len(), 2);
        assert!(config.workers[0].tools[0].required);
        assert!(!config.workers[0].tools[1].required);
        assert_eq!(config.workers[1].max_turns, Some(4));
    }

    #[test]
    fn orchestration_config_conversion() {
        let config = EnsembleConfig::from_toml_str(FULL_CONFIG).unwrap();
        let oc = config.orchestration_config();
        assert_eq!(oc.max_parallelism, Some(3));
        assert_eq!(oc.per_task_timeout, Duration::from_secs(90));
        assert_eq!(oc.max_plan_tasks, 8);
        assert_eq!(oc.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(oc.retry.max_retries, 4);
        assert_eq!(oc.retry.base_delay, Duration::from_millis(250));
        // Unspecified retry field keeps its default.
        assert_eq!(oc.retry.max_delay, Duration::from_millis(30_000));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = EnsembleConfig::from_toml_str(
            r#"
[provider]
model = "claude-sonnet-4-20250514"
"#,
        )
        .unwrap();
        assert_eq!(config.provider.api_key_env, "ANTHROPIC_API_KEY");
        assert!(config.workers.is_empty());

        let oc = config.orchestration_config();
        assert_eq!(oc.max_parallelism, None);
        assert_eq!(oc.per_task_timeout, Duration::from_secs(60));
        assert_eq!(oc.max_plan_tasks, 12);
        assert_eq!(oc.max_turns, 10);
        assert_eq!(oc.max_tokens, 4096);
        assert_eq!(oc.run_timeout, None);
        assert_eq!(oc.retry.max_retries, 2);
    }

    #[test]
    fn worker_specs_conversion() {
        let config = EnsembleConfig::from_toml_str(FULL_CONFIG).unwrap();
        let specs = config.worker_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, WorkerKind::DataAnalyst);
        assert_eq!(specs[0].tools[0].name, "sql_query");
        assert_eq!(specs[1].max_turns, Some(4));
    }

    #[test]
    fn unknown_worker_kind_is_a_config_error() {
        let err = EnsembleConfig::from_toml_str(
            r#"
[provider]
model = "m"

[[workers]]
kind = "marketing"
system_prompt = "p"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
