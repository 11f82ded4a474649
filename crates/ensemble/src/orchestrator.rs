use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::events::{NoopHooks, ObservabilityHooks, RunEvent};
use crate::agent::{BoundTool, WorkerAgent, WorkerSpec};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::retry::RetryConfig;
use crate::plan::planner::TaskPlanner;
use crate::plan::{OrchestrationResult, WorkerKind};
use crate::synthesis::{Aggregator, confidence_score};
use crate::tool::Tool;
use crate::tool::registry::ToolRegistry;

/// Run-wide limits and defaults. Individual workers may override turn and
/// token limits through their [`WorkerSpec`].
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Concurrent task ceiling. `None` means as wide as the plan's worker
    /// diversity.
    pub max_parallelism: Option<usize>,
    /// Wall-clock budget per task.
    pub per_task_timeout: Duration,
    /// Largest plan the planner may produce.
    pub max_plan_tasks: usize,
    /// Default oracle round limit per task.
    pub max_turns: usize,
    /// Default completion token limit per oracle call.
    pub max_tokens: u32,
    /// Retry policy for every oracle call in the run.
    pub retry: RetryConfig,
    /// Wall-clock budget for the whole run, dispatch onward. `None` disables
    /// the watchdog.
    pub run_timeout: Option<Duration>,
    /// Byte cap applied to tool outputs before they reach the oracle.
    pub tool_output_limit: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            per_task_timeout: Duration::from_secs(60),
            max_plan_tasks: 12,
            max_turns: 10,
            max_tokens: 4096,
            retry: RetryConfig::default(),
            run_timeout: None,
            tool_output_limit: 10_000,
        }
    }
}

/// Top-level entry point: plans a request, dispatches the plan across worker
/// agents, and synthesizes their results into one answer.
pub struct Orchestrator<P> {
    planner: TaskPlanner<P>,
    dispatcher: Dispatcher<P>,
    aggregator: Aggregator<P>,
    available: BTreeSet<WorkerKind>,
    hooks: Arc<dyn ObservabilityHooks>,
    cancel: CancellationToken,
    run_timeout: Option<Duration>,
}

impl<P: LlmProvider + Send + Sync + 'static> Orchestrator<P> {
    pub fn builder(provider: Arc<P>) -> OrchestratorBuilder<P> {
        OrchestratorBuilder {
            provider,
            workers: Vec::new(),
            tools: Vec::new(),
            config: OrchestrationConfig::default(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Token that cancels this orchestrator's runs. Cancelling it lets
    /// in-flight tasks finish observing it; their results are recorded as
    /// skipped, and the run still returns a result.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one analysis request end to end.
    ///
    /// Planning failures (empty request, invalid plan) return `Err`. Once a
    /// plan is dispatched, worker trouble is absorbed into the result; this
    /// only errors before the first task starts.
    pub async fn analyze(&self, request: &str) -> Result<OrchestrationResult, Error> {
        let run_id = Uuid::new_v4().to_string();
        self.hooks.on_event(&RunEvent::RunStarted {
            run_id: run_id.clone(),
            request: crate::agent::events::truncate_for_event(request),
        });

        let plan = self
            .planner
            .plan(request, &self.available, &run_id, self.hooks.clone())
            .await?;
        self.hooks.on_event(&RunEvent::plan_built(&run_id, &plan));

        let child = self.cancel.child_token();
        let watchdog = self.run_timeout.map(|budget| {
            let child = child.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                child.cancel();
            })
        });

        let report = self.dispatcher.execute(&plan, &run_id, &child).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if child.is_cancelled() {
            self.hooks.on_event(&RunEvent::RunCancelled {
                run_id: run_id.clone(),
            });
        }

        let synthesis = self
            .aggregator
            .synthesize(request, &plan, &report.outcomes, &run_id, self.hooks.clone())
            .await;
        let confidence = confidence_score(&plan, &report.outcomes);

        let result = OrchestrationResult {
            plan,
            outcomes: report.outcomes,
            final_insights: synthesis.final_insights,
            recommendations: synthesis.recommendations,
            confidence_score: confidence,
            grounding_disclaimer: synthesis.grounding_disclaimer,
            completed_at: Utc::now(),
        };

        self.hooks.on_event(&RunEvent::RunCompleted {
            run_id,
            succeeded: result.succeeded_count(),
            failed: result.failed_count(),
            skipped: result.skipped_count(),
            confidence_score: result.confidence_score,
            usage: report.usage,
        });
        Ok(result)
    }
}

pub struct OrchestratorBuilder<P> {
    provider: Arc<P>,
    workers: Vec<WorkerSpec>,
    tools: Vec<Arc<dyn Tool>>,
    config: OrchestrationConfig,
    hooks: Arc<dyn ObservabilityHooks>,
}

impl<P: LlmProvider + Send + Sync + 'static> OrchestratorBuilder<P> {
    pub fn worker(mut self, spec: WorkerSpec) -> Self {
        self.workers.push(spec);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ObservabilityHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Assemble the orchestrator. Fails when no worker is declared, a worker
    /// kind appears twice, a tool name collides, or a worker binds a tool
    /// that was never registered.
    pub fn build(self) -> Result<Orchestrator<P>, Error> {
        if self.workers.is_empty() {
            return Err(Error::Config("at least one worker is required".into()));
        }

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool)?;
        }

        let mut agents: HashMap<WorkerKind, Arc<WorkerAgent<P>>> = HashMap::new();
        for spec in &self.workers {
            if agents.contains_key(&spec.kind) {
                return Err(Error::Config(format!(
                    "worker kind '{}' declared more than once",
                    spec.kind
                )));
            }
            let bound = spec
                .tools
                .iter()
                .map(|binding| {
                    registry.resolve(&binding.name).map(|tool| BoundTool {
                        tool,
                        required: binding.required,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let agent = WorkerAgent::new(
                self.provider.clone(),
                spec,
                bound,
                self.config.max_turns,
                self.config.max_tokens,
                self.config.retry.clone(),
                self.config.tool_output_limit,
            );
            agents.insert(spec.kind, Arc::new(agent));
        }

        let available: BTreeSet<WorkerKind> = agents.keys().copied().collect();
        let planner = TaskPlanner::new(
            self.provider.clone(),
            self.config.retry.clone(),
            self.config.max_tokens,
            self.config.max_plan_tasks,
        );
        let dispatcher = Dispatcher::new(
            agents,
            self.config.max_parallelism,
            self.config.per_task_timeout,
            self.hooks.clone(),
        );
        let aggregator = Aggregator::new(
            self.provider,
            self.config.retry.clone(),
            self.config.max_tokens,
        );

        Ok(Orchestrator {
            planner,
            dispatcher,
            aggregator,
            available,
            hooks: self.hooks,
            cancel: CancellationToken::new(),
            run_timeout: self.config.run_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{
        CompletionRequest, CompletionResponse, ContentBlock, StopReason, TokenUsage,
    };
    use crate::plan::{AnswerStatus, TaskOutcome};
    use crate::tool::{ToolBinding, ToolOutput};
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;

    /// Routes requests by role: planning, synthesis, or worker, keyed on the
    /// system prompt each component uses.
    struct RoleProvider {
        plan_json: String,
        synthesis_json: String,
    }

    impl LlmProvider for RoleProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
            let text = if request.system.starts_with("You are a task planner") {
                self.plan_json.clone()
            } else if request.system.starts_with("You are the aggregator") {
                self.synthesis_json.clone()
            } else {
                r#"{"answer": "worker finding", "confidence": 0.9}"#.to_string()
            };
            Ok(CompletionResponse {
                content: vec![ContentBlock::Text { text }],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    fn two_task_plan() -> String {
        r#"{"tasks": [
            {"id": "t1", "worker": "data_analyst", "description": "analyze", "depends_on": []},
            {"id": "t2", "worker": "report", "description": "report", "depends_on": ["t1"]}
        ]}"#
        .to_string()
    }

    #[tokio::test]
    async fn full_run_produces_answered_result() {
        let provider = Arc::new(RoleProvider {
            plan_json: two_task_plan(),
            synthesis_json: r#"{"insights": ["t1 and t2 agree."], "recommendations": ["ship it"]}"#
                .into(),
        });
        let orchestrator = Orchestrator::builder(provider)
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "analyze"))
            .worker(WorkerSpec::new(WorkerKind::Report, "report"))
            .build()
            .unwrap();

        let result = orchestrator.analyze("how are sales").await.unwrap();
        assert_eq!(result.status(), AnswerStatus::Answered);
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.outcomes.values().all(TaskOutcome::is_succeeded));
        assert_eq!(result.final_insights, vec!["t1 and t2 agree."]);
        assert!((result.confidence_score - 0.9).abs() < 1e-9);
        assert!(result.grounding_disclaimer.is_none());
    }

    #[tokio::test]
    async fn planning_error_aborts_run() {
        let provider = Arc::new(RoleProvider {
            plan_json: r#"{"tasks": [{"id": "t1", "worker": "marketing", "description": "x"}]}"#
                .into(),
            synthesis_json: String::new(),
        });
        let orchestrator = Orchestrator::builder(provider)
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "analyze"))
            .build()
            .unwrap();

        let err = orchestrator.analyze("promote").await.unwrap_err();
        assert!(matches!(err, Error::UnknownWorker { .. }));
        assert!(err.is_planning());
    }

    #[tokio::test]
    async fn empty_request_aborts_run() {
        let provider = Arc::new(RoleProvider {
            plan_json: two_task_plan(),
            synthesis_json: String::new(),
        });
        let orchestrator = Orchestrator::builder(provider)
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "analyze"))
            .build()
            .unwrap();

        let err = orchestrator.analyze("").await.unwrap_err();
        assert!(matches!(err, Error::EmptyRequest));
    }

    #[test]
    fn build_requires_a_worker() {
        let provider = Arc::new(RoleProvider {
            plan_json: String::new(),
            synthesis_json: String::new(),
        });
        let err = Orchestrator::builder(provider).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn build_rejects_duplicate_worker_kinds() {
        let provider = Arc::new(RoleProvider {
            plan_json: String::new(),
            synthesis_json: String::new(),
        });
        let err = Orchestrator::builder(provider)
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "a"))
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "b"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("data_analyst")));
    }

    #[test]
    fn build_rejects_unresolved_tool_binding() {
        let provider = Arc::new(RoleProvider {
            plan_json: String::new(),
            synthesis_json: String::new(),
        });
        let err = Orchestrator::builder(provider)
            .worker(
                WorkerSpec::new(WorkerKind::DataAnalyst, "a")
                    .tool(ToolBinding::required("sql_query")),
            )
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownTool(name) if name == "sql_query"));
    }

    struct EchoTool;

    impl Tool for EchoTool {
        fn definition(&self) -> crate::llm::types::ToolDefinition {
            crate::llm::types::ToolDefinition {
                name: "echo".into(),
                description: "echoes".into(),
                input_schema: json!({"type": "object"}),
            }
        }

        fn execute(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
            Box::pin(async { Ok(ToolOutput::success("echo")) })
        }
    }

    #[test]
    fn build_resolves_registered_tools() {
        let provider = Arc::new(RoleProvider {
            plan_json: String::new(),
            synthesis_json: String::new(),
        });
        let orchestrator = Orchestrator::builder(provider)
            .tool(Arc::new(EchoTool))
            .worker(
                WorkerSpec::new(WorkerKind::DataAnalyst, "a").tool(ToolBinding::optional("echo")),
            )
            .build();
        assert!(orchestrator.is_ok());
    }

    #[tokio::test]
    async fn pre_cancelled_orchestrator_still_returns_a_result() {
        let provider = Arc::new(RoleProvider {
            plan_json: two_task_plan(),
            synthesis_json: r#"{"insights": ["t1 partial."], "recommendations": []}"#.into(),
        });
        let orchestrator = Orchestrator::builder(provider)
            .worker(WorkerSpec::new(WorkerKind::DataAnalyst, "analyze"))
            .worker(WorkerSpec::new(WorkerKind::Report, "report"))
            .build()
            .unwrap();
        orchestrator.cancel_token().cancel();

        let result = orchestrator.analyze("how are sales").await.unwrap();
        assert_eq!(result.status(), AnswerStatus::Unanswered);
        assert!(result.outcomes.values().all(TaskOutcome::is_skipped));
        assert_eq!(result.confidence_score, 0.0);
        assert!(result.grounding_disclaimer.is_some());
    }
}
