use serde::{Deserialize, Serialize};

use crate::llm::types::TokenUsage;
use crate::plan::{Plan, SkipReason, TaskFailure, WorkerKind};
use crate::util::truncate_text;

/// Max bytes of free text carried inside an event payload.
const EVENT_TEXT_LIMIT: usize = 500;

/// Lifecycle events emitted during an orchestration run.
///
/// Tagged for straightforward serialization into log pipelines or UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        request: String,
    },
    PlanBuilt {
        run_id: String,
        task_count: usize,
        task_ids: Vec<String>,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        worker: WorkerKind,
    },
    TaskSucceeded {
        run_id: String,
        task_id: String,
        worker: WorkerKind,
        confidence: f64,
        summary: String,
    },
    TaskFailed {
        run_id: String,
        task_id: String,
        worker: WorkerKind,
        failure: TaskFailure,
    },
    TaskSkipped {
        run_id: String,
        task_id: String,
        reason: SkipReason,
    },
    ToolCallStarted {
        run_id: String,
        task_id: String,
        tool_name: String,
        params: serde_json::Value,
    },
    ToolCallCompleted {
        run_id: String,
        task_id: String,
        tool_name: String,
        is_error: bool,
        result_summary: String,
    },
    OracleRetry {
        run_id: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error_class: String,
    },
    SynthesisStarted {
        run_id: String,
        evidence_task_ids: Vec<String>,
    },
    SynthesisCompleted {
        run_id: String,
        insight_count: usize,
        grounded: bool,
    },
    RunCancelled {
        run_id: String,
    },
    RunCompleted {
        run_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        confidence_score: f64,
        usage: TokenUsage,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::PlanBuilt { run_id, .. }
            | RunEvent::TaskStarted { run_id, .. }
            | RunEvent::TaskSucceeded { run_id, .. }
            | RunEvent::TaskFailed { run_id, .. }
            | RunEvent::TaskSkipped { run_id, .. }
            | RunEvent::ToolCallStarted { run_id, .. }
            | RunEvent::ToolCallCompleted { run_id, .. }
            | RunEvent::OracleRetry { run_id, .. }
            | RunEvent::SynthesisStarted { run_id, .. }
            | RunEvent::SynthesisCompleted { run_id, .. }
            | RunEvent::RunCancelled { run_id }
            | RunEvent::RunCompleted { run_id, .. } => run_id,
        }
    }

    pub(crate) fn plan_built(run_id: &str, plan: &Plan) -> Self {
        RunEvent::PlanBuilt {
            run_id: run_id.to_string(),
            task_count: plan.len(),
            task_ids: plan.tasks.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

/// Bound free text before it lands in an event payload.
pub(crate) fn truncate_for_event(text: &str) -> String {
    truncate_text(text, EVENT_TEXT_LIMIT)
}

/// Sink for [`RunEvent`]s.
///
/// Implementations must be cheap and non-blocking; they are called inline from
/// the dispatch path. A slow sink slows the whole run.
pub trait ObservabilityHooks: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ObservabilityHooks for NoopHooks {
    fn on_event(&self, _event: &RunEvent) {}
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl ObservabilityHooks for TracingHooks {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { run_id, request } => {
                tracing::info!(%run_id, request = %truncate_for_event(request), "run started");
            }
            RunEvent::PlanBuilt {
                run_id, task_count, ..
            } => {
                tracing::info!(%run_id, task_count, "plan built");
            }
            RunEvent::TaskStarted {
                run_id,
                task_id,
                worker,
            } => {
                tracing::info!(%run_id, %task_id, worker = %worker, "task started");
            }
            RunEvent::TaskSucceeded {
                run_id,
                task_id,
                worker,
                confidence,
                ..
            } => {
                tracing::info!(%run_id, %task_id, worker = %worker, confidence, "task succeeded");
            }
            RunEvent::TaskFailed {
                run_id,
                task_id,
                worker,
                failure,
            } => {
                tracing::warn!(
                    %run_id,
                    %task_id,
                    worker = %worker,
                    kind = ?failure.kind,
                    retryable = failure.retryable,
                    message = %failure.message,
                    "task failed"
                );
            }
            RunEvent::TaskSkipped {
                run_id,
                task_id,
                reason,
            } => {
                tracing::warn!(%run_id, %task_id, reason = %reason, "task skipped");
            }
            RunEvent::ToolCallStarted {
                run_id,
                task_id,
                tool_name,
                ..
            } => {
                tracing::debug!(%run_id, %task_id, %tool_name, "tool call started");
            }
            RunEvent::ToolCallCompleted {
                run_id,
                task_id,
                tool_name,
                is_error,
                ..
            } => {
                tracing::debug!(%run_id, %task_id, %tool_name, is_error, "tool call completed");
            }
            RunEvent::OracleRetry {
                run_id,
                attempt,
                max_retries,
                delay_ms,
                error_class,
            } => {
                tracing::warn!(
                    %run_id,
                    attempt,
                    max_retries,
                    delay_ms,
                    %error_class,
                    "oracle retry"
                );
            }
            RunEvent::SynthesisStarted {
                run_id,
                evidence_task_ids,
            } => {
                tracing::info!(%run_id, evidence = evidence_task_ids.len(), "synthesis started");
            }
            RunEvent::SynthesisCompleted {
                run_id,
                insight_count,
                grounded,
            } => {
                tracing::info!(%run_id, insight_count, grounded, "synthesis completed");
            }
            RunEvent::RunCancelled { run_id } => {
                tracing::warn!(%run_id, "run cancelled");
            }
            RunEvent::RunCompleted {
                run_id,
                succeeded,
                failed,
                skipped,
                confidence_score,
                usage,
            } => {
                tracing::info!(
                    %run_id,
                    succeeded,
                    failed,
                    skipped,
                    confidence_score,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "run completed"
                );
            }
        }
    }
}
