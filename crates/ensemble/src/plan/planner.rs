use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::agent::events::{ObservabilityHooks, RunEvent};
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::retry::{RetryConfig, RetryingProvider};
use crate::llm::types::{CompletionRequest, Message};
use crate::plan::{Plan, Task, WorkerKind};
use crate::util::extract_json;

/// Turns a free-text analysis request into a validated [`Plan`].
///
/// The oracle proposes the task graph; everything it proposes goes through
/// [`Plan::validate`] before any worker sees it. A malformed or invalid plan
/// aborts the run with a planning error, it is never partially executed.
pub struct TaskPlanner<P> {
    provider: Arc<P>,
    retry: RetryConfig,
    max_tokens: u32,
    max_plan_tasks: usize,
}

impl<P: LlmProvider + 'static> TaskPlanner<P> {
    pub fn new(
        provider: Arc<P>,
        retry: RetryConfig,
        max_tokens: u32,
        max_plan_tasks: usize,
    ) -> Self {
        Self {
            provider,
            retry,
            max_tokens,
            max_plan_tasks,
        }
    }

    pub async fn plan(
        &self,
        request: &str,
        available: &BTreeSet<WorkerKind>,
        run_id: &str,
        hooks: Arc<dyn ObservabilityHooks>,
    ) -> Result<Plan, Error> {
        if request.trim().is_empty() {
            return Err(Error::EmptyRequest);
        }

        let retry_run_id = run_id.to_string();
        let provider = RetryingProvider::new(self.provider.clone(), self.retry.clone())
            .with_on_retry(Arc::new(move |attempt, max_retries, delay_ms, class| {
                hooks.on_event(&RunEvent::OracleRetry {
                    run_id: retry_run_id.clone(),
                    attempt,
                    max_retries,
                    delay_ms,
                    error_class: class.to_string(),
                });
            }));

        let request_body = CompletionRequest {
            system: build_planning_prompt(available, self.max_plan_tasks),
            messages: vec![Message::user(request)],
            tools: vec![],
            max_tokens: self.max_tokens,
        };
        let response = provider.complete(request_body).await?;
        debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "planner oracle call finished"
        );

        let plan = parse_plan(&response.text())?;
        plan.validate(available, self.max_plan_tasks)?;
        Ok(plan)
    }
}

fn build_planning_prompt(available: &BTreeSet<WorkerKind>, max_tasks: usize) -> String {
    let workers: Vec<String> = available
        .iter()
        .map(|kind| format!("- {kind}: {}", worker_blurb(*kind)))
        .collect();
    format!(
        r#"You are a task planner for a data analysis team. Decompose the user's request into a dependency-ordered set of tasks, each assigned to one of these workers:

{}

Respond with ONLY a JSON object in this exact shape:
{{
  "tasks": [
    {{"id": "t1", "worker": "data_analyst", "description": "...", "depends_on": [], "priority": 0}}
  ],
  "estimated_minutes": 10,
  "success_criteria": ["..."]
}}

Rules:
- At most {max_tasks} tasks.
- Task ids must be unique; depends_on may only reference ids in this plan.
- The dependency graph must be acyclic.
- Lower priority numbers run first among tasks that are ready together.
- Only assign workers from the list above."#,
        workers.join("\n")
    )
}

fn worker_blurb(kind: WorkerKind) -> &'static str {
    match kind {
        WorkerKind::DataAnalyst => "queries and summarizes datasets",
        WorkerKind::Visualization => "produces charts and visual summaries",
        WorkerKind::Prediction => "builds forecasts from analyzed data",
        WorkerKind::Report => "composes findings into a final report",
        WorkerKind::Orchestrator => "coordinates other workers",
    }
}

#[derive(Deserialize)]
struct PlanDraft {
    tasks: Vec<TaskDraft>,
    #[serde(default)]
    estimated_minutes: Option<u32>,
    #[serde(default)]
    success_criteria: Vec<String>,
}

#[derive(Deserialize)]
struct TaskDraft {
    id: String,
    worker: String,
    description: String,
    #[serde(default)]
    depends_on: BTreeSet<String>,
    #[serde(default)]
    priority: i32,
}

/// Parse oracle output into a [`Plan`]. Worker names are resolved here so an
/// invented specialization surfaces as [`Error::UnknownWorker`] rather than a
/// deserialization failure.
fn parse_plan(text: &str) -> Result<Plan, Error> {
    let json = extract_json(text)
        .ok_or_else(|| Error::Agent("planner response contained no JSON object".into()))?;
    let draft: PlanDraft = serde_json::from_str(json)?;

    let tasks = draft
        .tasks
        .into_iter()
        .map(|t| {
            let worker = WorkerKind::from_str(&t.worker).map_err(|_| Error::UnknownWorker {
                task_id: t.id.clone(),
                worker: t.worker.clone(),
            })?;
            Ok(Task {
                id: t.id,
                worker,
                description: t.description,
                depends_on: t.depends_on,
                priority: t.priority,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(Plan {
        tasks,
        estimated_minutes: draft.estimated_minutes,
        success_criteria: draft.success_criteria,
    })
}
