//! Multi-agent orchestration for data analysis requests.
//!
//! A free-text request is decomposed by a [`plan::planner::TaskPlanner`] into
//! a dependency-ordered [`Plan`], executed by a [`dispatch::Dispatcher`]
//! across specialized [`agent::WorkerAgent`]s, and folded back into one
//! answer by a [`synthesis::Aggregator`]. The [`Orchestrator`] wires the
//! three stages together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ensemble::{AnthropicProvider, Orchestrator, WorkerKind, WorkerSpec};
//!
//! # async fn run() -> Result<(), ensemble::Error> {
//! let provider = Arc::new(AnthropicProvider::new("api-key", "claude-sonnet-4-20250514"));
//! let orchestrator = Orchestrator::builder(provider)
//!     .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "You analyze datasets."))
//!     .worker(WorkerSpec::new(WorkerKind::Report, "You write reports."))
//!     .build()?;
//!
//! let result = orchestrator.analyze("How did sales develop last quarter?").await?;
//! println!("{:?}", result.final_insights);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod plan;
pub mod synthesis;
pub mod tool;
mod util;

pub use agent::events::{NoopHooks, ObservabilityHooks, RunEvent, TracingHooks};
pub use agent::{TaskContext, WorkerAgent, WorkerSpec};
pub use config::EnsembleConfig;
pub use error::Error;
pub use llm::LlmProvider;
pub use llm::anthropic::AnthropicProvider;
pub use llm::retry::{RetryConfig, RetryingProvider};
pub use orchestrator::{OrchestrationConfig, Orchestrator, OrchestratorBuilder};
pub use plan::{
    AnswerStatus, FailureKind, OrchestrationResult, Plan, SkipReason, Task, TaskFailure,
    TaskOutcome, WorkerKind, WorkerOutput, WorkerResult,
};
pub use synthesis::{Aggregator, Synthesis};
pub use tool::registry::ToolRegistry;
pub use tool::{Tool, ToolBinding, ToolOutput};
