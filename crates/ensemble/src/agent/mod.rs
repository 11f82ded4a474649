pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::retry::{RetryConfig, RetryingProvider};
use crate::llm::types::{
    CompletionRequest, Message, Role, StopReason, TokenUsage, ToolDefinition, ToolResult,
};
use crate::plan::{Task, ToolCallRecord, WorkerKind, WorkerOutput, WorkerResult};
use crate::tool::{Tool, ToolBinding, validate_tool_input};
use crate::util::{extract_json, truncate_text};

use self::events::{ObservabilityHooks, RunEvent, truncate_for_event};

/// Confidence deducted for each optional tool that failed during a task.
const OPTIONAL_FAILURE_PENALTY: f64 = 0.2;

/// Declarative description of a worker: its specialization, prompt, and the
/// tools it may call. Resolved into a [`WorkerAgent`] when the orchestrator
/// is built.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub kind: WorkerKind,
    pub system_prompt: String,
    pub tools: Vec<ToolBinding>,
    pub max_turns: Option<usize>,
    pub max_tokens: Option<u32>,
}

impl WorkerSpec {
    pub fn new(kind: WorkerKind, system_prompt: impl Into<String>) -> Self {
        Self {
            kind,
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            max_turns: None,
            max_tokens: None,
        }
    }

    pub fn tool(mut self, binding: ToolBinding) -> Self {
        self.tools.push(binding);
        self
    }

    pub fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A resolved tool plus its failure semantics for this worker.
#[derive(Clone)]
pub struct BoundTool {
    pub tool: Arc<dyn Tool>,
    pub required: bool,
}

/// Results of upstream tasks, handed to a worker as part of its prompt.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub upstream: Vec<WorkerResult>,
}

impl TaskContext {
    pub fn new(upstream: Vec<WorkerResult>) -> Self {
        Self { upstream }
    }

    /// Render upstream results as a prompt section. Empty string when the
    /// task has no dependencies.
    pub fn render(&self) -> String {
        if self.upstream.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n\nResults from tasks this one depends on:\n");
        for result in &self.upstream {
            out.push_str(&format!(
                "\n[{} ({}), confidence {:.2}]\n{}\n",
                result.task_id, result.worker, result.confidence, result.output.text
            ));
            if let Some(payload) = &result.output.payload {
                out.push_str(&format!("payload: {payload}\n"));
            }
        }
        out
    }
}

/// Executes one task at a time: oracle call, tool execution, repeat until the
/// oracle produces a final answer.
///
/// Tools run strictly one at a time, in the order the oracle requested them,
/// so each call can observe the effects of the previous one.
pub struct WorkerAgent<P> {
    provider: Arc<P>,
    kind: WorkerKind,
    system_prompt: String,
    tools: HashMap<String, BoundTool>,
    tool_defs: Vec<ToolDefinition>,
    max_turns: usize,
    max_tokens: u32,
    retry: RetryConfig,
    tool_output_limit: usize,
}

/// A completed worker execution: the result plus the oracle tokens it cost.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub result: WorkerResult,
    pub usage: TokenUsage,
}

impl<P: LlmProvider + 'static> WorkerAgent<P> {
    pub(crate) fn new(
        provider: Arc<P>,
        spec: &WorkerSpec,
        bound: Vec<BoundTool>,
        default_max_turns: usize,
        default_max_tokens: u32,
        retry: RetryConfig,
        tool_output_limit: usize,
    ) -> Self {
        let tool_defs: Vec<ToolDefinition> = bound.iter().map(|b| b.tool.definition()).collect();
        let tools: HashMap<String, BoundTool> = bound
            .into_iter()
            .map(|b| (b.tool.definition().name, b))
            .collect();
        Self {
            provider,
            kind: spec.kind,
            system_prompt: spec.system_prompt.clone(),
            tools,
            tool_defs,
            max_turns: spec.max_turns.unwrap_or(default_max_turns),
            max_tokens: spec.max_tokens.unwrap_or(default_max_tokens),
            retry,
            tool_output_limit,
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Execute `task` to completion. Cancellation is observed between oracle
    /// calls and between tool executions; an already-cancelled token returns
    /// `Error::Cancelled` before any oracle call is made.
    pub async fn run(
        &self,
        task: &Task,
        ctx: &TaskContext,
        run_id: &str,
        hooks: Arc<dyn ObservabilityHooks>,
        cancel: &CancellationToken,
    ) -> Result<WorkerRun, Error> {
        if task.description.trim().is_empty() {
            return Err(Error::EmptyTaskDescription(task.id.clone()));
        }

        let retry_hooks = hooks.clone();
        let retry_run_id = run_id.to_string();
        let provider = RetryingProvider::new(self.provider.clone(), self.retry.clone())
            .with_on_retry(Arc::new(move |attempt, max_retries, delay_ms, class| {
                retry_hooks.on_event(&RunEvent::OracleRetry {
                    run_id: retry_run_id.clone(),
                    attempt,
                    max_retries,
                    delay_ms,
                    error_class: class.to_string(),
                });
            }));

        let mut messages = vec![Message::user(format!(
            "Task '{}': {}{}",
            task.id,
            task.description,
            ctx.render()
        ))];
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut optional_failures = 0usize;
        let mut usage = TokenUsage::default();

        for turn in 0..self.max_turns {
            debug!(worker = %self.kind, task_id = %task.id, turn, "executing turn");
            let request = CompletionRequest {
                system: self.system_prompt.clone(),
                messages: messages.clone(),
                tools: self.tool_defs.clone(),
                max_tokens: self.max_tokens,
            };

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = provider.complete(request) => response?,
            };
            usage += response.usage;

            let tool_calls = response.tool_calls();
            let stop_reason = response.stop_reason;
            messages.push(Message {
                role: Role::Assistant,
                content: response.content,
            });

            if tool_calls.is_empty() {
                if stop_reason == StopReason::MaxTokens {
                    return Err(Error::Truncated);
                }
                let text = match messages.last() {
                    Some(m) => m
                        .content
                        .iter()
                        .filter_map(|b| match b {
                            crate::llm::types::ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<String>(),
                    None => String::new(),
                };
                let result =
                    self.finish(task, text, optional_failures, records);
                return Ok(WorkerRun { result, usage });
            }

            let mut results = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                hooks.on_event(&RunEvent::ToolCallStarted {
                    run_id: run_id.to_string(),
                    task_id: task.id.clone(),
                    tool_name: call.name.clone(),
                    params: call.input.clone(),
                });

                let result = match self.tools.get(&call.name) {
                    None => {
                        optional_failures += 1;
                        ToolResult::error(&call.id, format!("Tool not found: {}", call.name))
                    }
                    Some(bound) => {
                        let schema = bound.tool.definition().input_schema;
                        if let Err(msg) = validate_tool_input(&schema, &call.input) {
                            // Fed back verbatim so the oracle can correct its
                            // next call; not counted against confidence.
                            ToolResult::error(&call.id, msg)
                        } else {
                            match bound.tool.execute(call.input.clone()).await {
                                Ok(output) => {
                                    let output = output.truncated(self.tool_output_limit);
                                    if output.is_error {
                                        if bound.required {
                                            return Err(Error::RequiredToolFailed {
                                                tool: call.name.clone(),
                                                message: output.content,
                                                transient: false,
                                            });
                                        }
                                        optional_failures += 1;
                                        ToolResult::error(&call.id, output.content)
                                    } else {
                                        ToolResult::success(&call.id, output.content)
                                    }
                                }
                                Err(e) => {
                                    if bound.required {
                                        return Err(Error::RequiredToolFailed {
                                            tool: call.name.clone(),
                                            message: e.to_string(),
                                            transient: e.is_transient(),
                                        });
                                    }
                                    optional_failures += 1;
                                    ToolResult::error(&call.id, e.to_string())
                                }
                            }
                        }
                    }
                };

                hooks.on_event(&RunEvent::ToolCallCompleted {
                    run_id: run_id.to_string(),
                    task_id: task.id.clone(),
                    tool_name: call.name.clone(),
                    is_error: result.is_error,
                    result_summary: truncate_for_event(&result.content),
                });
                records.push(ToolCallRecord {
                    tool_name: call.name.clone(),
                    params: call.input.clone(),
                    result_summary: truncate_text(&result.content, 200),
                });
                results.push(result);
            }
            messages.push(Message::tool_results(results));
        }

        Err(Error::MaxTurnsExceeded(self.max_turns))
    }

    fn finish(
        &self,
        task: &Task,
        text: String,
        optional_failures: usize,
        records: Vec<ToolCallRecord>,
    ) -> WorkerResult {
        let (answer, confidence, payload) = parse_final_answer(&text);
        let penalty = OPTIONAL_FAILURE_PENALTY * optional_failures as f64;
        WorkerResult {
            task_id: task.id.clone(),
            worker: self.kind,
            output: WorkerOutput {
                text: answer,
                payload,
            },
            confidence: (confidence - penalty).clamp(0.0, 1.0),
            tool_calls_made: records,
        }
    }
}

/// Expected shape of a worker's final message. Free text is accepted as a
/// fallback at a neutral confidence.
#[derive(serde::Deserialize)]
struct FinalAnswer {
    answer: String,
    confidence: Option<f64>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

fn parse_final_answer(text: &str) -> (String, f64, Option<serde_json::Value>) {
    if let Some(json) = extract_json(text) {
        if let Ok(parsed) = serde_json::from_str::<FinalAnswer>(json) {
            let confidence = parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
            return (parsed.answer, confidence, parsed.payload);
        }
    }
    (text.to_string(), 0.5, None)
}
