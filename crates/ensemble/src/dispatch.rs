use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::agent::events::{ObservabilityHooks, RunEvent, truncate_for_event};
use crate::agent::{TaskContext, WorkerAgent, WorkerRun};
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::TokenUsage;
use crate::plan::{
    Plan, SkipReason, TaskFailure, TaskOutcome, TaskState, WorkerKind, WorkerResult,
};

/// Everything the dispatcher produced for one plan: a terminal outcome for
/// every task, plus the worker oracle tokens the run cost.
#[derive(Debug)]
pub struct DispatchReport {
    pub outcomes: BTreeMap<String, TaskOutcome>,
    pub usage: TokenUsage,
}

/// Runs a validated plan: launches tasks as their dependencies succeed, up to
/// the parallelism bound, and records a terminal outcome for every task.
///
/// Dispatch is infallible by construction. Worker errors become `Failed`
/// outcomes, never an `Err` out of [`Dispatcher::execute`].
pub struct Dispatcher<P> {
    workers: HashMap<WorkerKind, Arc<WorkerAgent<P>>>,
    max_parallelism: Option<usize>,
    per_task_timeout: Duration,
    hooks: Arc<dyn ObservabilityHooks>,
}

enum WorkerTermination {
    Completed(WorkerRun),
    Failed(TaskFailure),
    Cancelled,
}

impl<P: LlmProvider + Send + Sync + 'static> Dispatcher<P> {
    pub fn new(
        workers: HashMap<WorkerKind, Arc<WorkerAgent<P>>>,
        max_parallelism: Option<usize>,
        per_task_timeout: Duration,
        hooks: Arc<dyn ObservabilityHooks>,
    ) -> Self {
        Self {
            workers,
            max_parallelism,
            per_task_timeout,
            hooks,
        }
    }

    /// Execute every task in `plan`. The plan must already be validated; every
    /// `task.worker` must have a registered agent.
    ///
    /// Returns exactly one outcome per plan task. Tasks whose dependency chain
    /// failed are `Skipped`; tasks overtaken by cancellation are `Skipped` with
    /// a cancellation reason.
    pub async fn execute(
        &self,
        plan: &Plan,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let effective_parallelism = self
            .max_parallelism
            .unwrap_or_else(|| default_parallelism(plan))
            .max(1);

        let mut states: Vec<TaskState> = vec![TaskState::Pending; plan.tasks.len()];
        let mut blocking: Vec<usize> = plan.tasks.iter().map(|t| t.depends_on.len()).collect();
        let index_of: HashMap<&str, usize> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut ready: Vec<usize> = Vec::new();
        for (idx, count) in blocking.iter().enumerate() {
            if *count == 0 {
                states[idx] = TaskState::Ready;
                ready.push(idx);
            }
        }

        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut usage = TokenUsage::default();
        let mut in_flight: JoinSet<(usize, WorkerTermination)> = JoinSet::new();
        let mut handle_to_idx: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            while in_flight.len() < effective_parallelism && !cancel.is_cancelled() {
                let Some(idx) = pop_next_ready(&mut ready, plan) else {
                    break;
                };
                states[idx] = TaskState::Running;
                let handle = self.launch(plan, idx, run_id, cancel, &outcomes, &mut in_flight);
                handle_to_idx.insert(handle, idx);
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            // A panicking worker must not sink the run.
            let (idx, termination) = match joined {
                Ok((id, result)) => {
                    handle_to_idx.remove(&id);
                    result
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker task panicked");
                    let Some(idx) = handle_to_idx.remove(&join_err.id()) else {
                        error!("panicked worker had no launch record, dropping its join result");
                        continue;
                    };
                    (
                        idx,
                        WorkerTermination::Failed(TaskFailure {
                            task_id: plan.tasks[idx].id.clone(),
                            kind: crate::plan::FailureKind::Internal,
                            message: join_err.to_string(),
                            retryable: false,
                        }),
                    )
                }
            };

            let task = &plan.tasks[idx];
            match termination {
                WorkerTermination::Completed(run) => {
                    states[idx] = TaskState::Succeeded;
                    usage += run.usage;
                    self.hooks.on_event(&RunEvent::TaskSucceeded {
                        run_id: run_id.to_string(),
                        task_id: task.id.clone(),
                        worker: task.worker,
                        confidence: run.result.confidence,
                        summary: truncate_for_event(&run.result.output.text),
                    });
                    outcomes.insert(task.id.clone(), TaskOutcome::Succeeded(run.result));

                    for dependent in dependents_of(plan, &task.id) {
                        blocking[dependent] -= 1;
                        if blocking[dependent] == 0 && states[dependent] == TaskState::Pending {
                            states[dependent] = TaskState::Ready;
                            ready.push(dependent);
                        }
                    }
                }
                WorkerTermination::Failed(failure) => {
                    states[idx] = TaskState::Failed;
                    self.hooks.on_event(&RunEvent::TaskFailed {
                        run_id: run_id.to_string(),
                        task_id: task.id.clone(),
                        worker: task.worker,
                        failure: failure.clone(),
                    });
                    outcomes.insert(task.id.clone(), TaskOutcome::Failed(failure));
                    self.skip_dependents(
                        plan,
                        &task.id,
                        run_id,
                        &mut states,
                        &mut ready,
                        &index_of,
                        &mut outcomes,
                    );
                }
                WorkerTermination::Cancelled => {
                    states[idx] = TaskState::Skipped;
                    let reason = SkipReason::Cancelled;
                    self.hooks.on_event(&RunEvent::TaskSkipped {
                        run_id: run_id.to_string(),
                        task_id: task.id.clone(),
                        reason: reason.clone(),
                    });
                    outcomes.insert(task.id.clone(), TaskOutcome::Skipped { reason });
                }
            }
        }

        // Anything still non-terminal was overtaken by cancellation.
        for (idx, task) in plan.tasks.iter().enumerate() {
            if matches!(states[idx], TaskState::Pending | TaskState::Ready) {
                if !cancel.is_cancelled() {
                    error!(task_id = %task.id, "task never reached a terminal state");
                }
                states[idx] = TaskState::Skipped;
                let reason = SkipReason::Cancelled;
                self.hooks.on_event(&RunEvent::TaskSkipped {
                    run_id: run_id.to_string(),
                    task_id: task.id.clone(),
                    reason: reason.clone(),
                });
                outcomes.insert(task.id.clone(), TaskOutcome::Skipped { reason });
            }
        }

        DispatchReport { outcomes, usage }
    }

    fn launch(
        &self,
        plan: &Plan,
        idx: usize,
        run_id: &str,
        cancel: &CancellationToken,
        outcomes: &BTreeMap<String, TaskOutcome>,
        in_flight: &mut JoinSet<(usize, WorkerTermination)>,
    ) -> tokio::task::Id {
        let task = plan.tasks[idx].clone();
        let agent = self.workers[&task.worker].clone();
        let upstream: Vec<WorkerResult> = task
            .depends_on
            .iter()
            .filter_map(|dep| outcomes.get(dep).and_then(|o| o.as_success()).cloned())
            .collect();
        let ctx = TaskContext::new(upstream);
        let timeout = self.per_task_timeout;
        let timeout_secs = timeout.as_secs();
        let run_id = run_id.to_string();
        let hooks = self.hooks.clone();
        let cancel = cancel.clone();

        self.hooks.on_event(&RunEvent::TaskStarted {
            run_id: run_id.clone(),
            task_id: task.id.clone(),
            worker: task.worker,
        });

        in_flight
            .spawn(async move {
                let outcome =
                    tokio::time::timeout(timeout, agent.run(&task, &ctx, &run_id, hooks, &cancel))
                        .await;
                let termination = match outcome {
                    Ok(Ok(run)) => WorkerTermination::Completed(run),
                    Ok(Err(Error::Cancelled)) => WorkerTermination::Cancelled,
                    Ok(Err(e)) => WorkerTermination::Failed(TaskFailure::from_error(&task.id, &e)),
                    Err(_elapsed) => {
                        WorkerTermination::Failed(TaskFailure::timeout(&task.id, timeout_secs))
                    }
                };
                (idx, termination)
            })
            .id()
    }

    /// Mark every direct and transitive dependent of `failed_id` as skipped,
    /// attributing the skip to the originally failed task.
    #[allow(clippy::too_many_arguments)]
    fn skip_dependents(
        &self,
        plan: &Plan,
        failed_id: &str,
        run_id: &str,
        states: &mut [TaskState],
        ready: &mut Vec<usize>,
        index_of: &HashMap<&str, usize>,
        outcomes: &mut BTreeMap<String, TaskOutcome>,
    ) {
        for dependent_id in plan.transitive_dependents(failed_id) {
            let idx = index_of[dependent_id.as_str()];
            if !matches!(states[idx], TaskState::Pending | TaskState::Ready) {
                continue;
            }
            states[idx] = TaskState::Skipped;
            ready.retain(|&r| r != idx);
            let reason = SkipReason::FailedDependency {
                failed_task: failed_id.to_string(),
            };
            self.hooks.on_event(&RunEvent::TaskSkipped {
                run_id: run_id.to_string(),
                task_id: dependent_id.clone(),
                reason: reason.clone(),
            });
            outcomes.insert(dependent_id, TaskOutcome::Skipped { reason });
        }
    }
}

/// Lowest priority wins; insertion order in the plan breaks ties.
fn pop_next_ready(ready: &mut Vec<usize>, plan: &Plan) -> Option<usize> {
    let pos = ready
        .iter()
        .enumerate()
        .min_by_key(|&(_, &idx)| (plan.tasks[idx].priority, idx))
        .map(|(pos, _)| pos)?;
    Some(ready.swap_remove(pos))
}

/// Without an explicit bound, run as wide as the plan's worker diversity.
fn default_parallelism(plan: &Plan) -> usize {
    plan.tasks
        .iter()
        .map(|t| t.worker)
        .collect::<std::collections::BTreeSet<_>>()
        .len()
}

fn dependents_of(plan: &Plan, id: &str) -> Vec<usize> {
    plan.tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.depends_on.contains(id))
        .map(|(i, _)| i)
        .collect()
}
