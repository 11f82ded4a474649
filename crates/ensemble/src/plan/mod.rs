pub mod planner;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Worker specialization a task is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    DataAnalyst,
    Visualization,
    Prediction,
    Report,
    Orchestrator,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 5] = [
        WorkerKind::DataAnalyst,
        WorkerKind::Visualization,
        WorkerKind::Prediction,
        WorkerKind::Report,
        WorkerKind::Orchestrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::DataAnalyst => "data_analyst",
            WorkerKind::Visualization => "visualization",
            WorkerKind::Prediction => "prediction",
            WorkerKind::Report => "report",
            WorkerKind::Orchestrator => "orchestrator",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_analyst" => Ok(WorkerKind::DataAnalyst),
            "visualization" => Ok(WorkerKind::Visualization),
            "prediction" => Ok(WorkerKind::Prediction),
            "report" => Ok(WorkerKind::Report),
            "orchestrator" => Ok(WorkerKind::Orchestrator),
            _ => Err(()),
        }
    }
}

/// One unit of work addressed to a worker specialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub worker: WorkerKind,
    pub description: String,
    /// Ids of tasks whose results this task consumes. Must reference ids
    /// present in the same plan.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Lower runs first when several tasks become ready together.
    #[serde(default)]
    pub priority: i32,
}

/// The task graph produced from a user request before execution.
///
/// `tasks` preserves discovery order, which is not execution order; the
/// dispatcher derives execution order from dependencies and priorities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Deterministic validation gate, run after planning and before dispatch.
    ///
    /// Rejects, in order: empty plans, plans over the size ceiling, duplicate
    /// task ids, blank task descriptions, workers not in `available`,
    /// dependencies on ids outside the plan, and dependency cycles.
    pub fn validate(
        &self,
        available: &BTreeSet<WorkerKind>,
        max_tasks: usize,
    ) -> Result<(), Error> {
        if self.tasks.is_empty() {
            return Err(Error::EmptyPlan);
        }
        if self.tasks.len() > max_tasks {
            return Err(Error::PlanTooLarge {
                count: self.tasks.len(),
                max: max_tasks,
            });
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(Error::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            if task.description.trim().is_empty() {
                return Err(Error::EmptyTaskDescription(task.id.clone()));
            }
            if !available.contains(&task.worker) {
                return Err(Error::UnknownWorker {
                    task_id: task.id.clone(),
                    worker: task.worker.to_string(),
                });
            }
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm; any node left with in-degree > 0 sits on a cycle.
    fn check_acyclic(&self) -> Result<(), Error> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            in_degree.insert(&task.id, task.depends_on.len());
            for dep in &task.depends_on {
                dependents.entry(dep).or_default().push(&task.id);
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut resolved = 0usize;
        while let Some(id) = queue.pop() {
            resolved += 1;
            for &dependent in dependents.get(id).into_iter().flatten() {
                let d = in_degree
                    .get_mut(dependent)
                    .expect("dependent is a plan task");
                *d -= 1;
                if *d == 0 {
                    queue.push(dependent);
                }
            }
        }

        if resolved == self.tasks.len() {
            Ok(())
        } else {
            // BTreeMap iteration makes the reported task deterministic.
            let on_cycle = in_degree
                .iter()
                .find(|&(_, &d)| d > 0)
                .map(|(&id, _)| id.to_string())
                .expect("unresolved task exists when a cycle was detected");
            Err(Error::CyclicPlan(on_cycle))
        }
    }

    /// Direct and transitive dependents of `id`, in plan order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut affected: BTreeSet<&str> = BTreeSet::new();
        affected.insert(id);
        // Tasks only depend on earlier discoveries in practice, but a single
        // forward pass per added node keeps this correct for any order.
        let mut changed = true;
        while changed {
            changed = false;
            for task in &self.tasks {
                if affected.contains(task.id.as_str()) {
                    continue;
                }
                if task.depends_on.iter().any(|d| affected.contains(d.as_str())) {
                    affected.insert(&task.id);
                    changed = true;
                }
            }
        }
        self.tasks
            .iter()
            .filter(|t| t.id != id && affected.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Lifecycle of a task inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One tool invocation a worker made while executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub result_summary: String,
}

/// Semi-structured worker output: free text plus an optional structured
/// payload such as a table or chart handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Produced once per successfully completed task; immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: String,
    pub worker: WorkerKind,
    pub output: WorkerOutput,
    /// Self-reported, clamped to 0.0..=1.0, degraded by optional tool failures.
    pub confidence: f64,
    pub tool_calls_made: Vec<ToolCallRecord>,
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OracleUnavailable,
    RequiredToolFailed,
    Timeout,
    Internal,
}

/// Produced when a worker raises or times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    /// Map a worker error onto the failure taxonomy.
    pub fn from_error(task_id: impl Into<String>, err: &Error) -> Self {
        let task_id = task_id.into();
        match err {
            Error::OracleUnavailable { .. } => Self {
                task_id,
                kind: FailureKind::OracleUnavailable,
                message: err.to_string(),
                retryable: true,
            },
            Error::RequiredToolFailed { .. } => Self {
                task_id,
                kind: FailureKind::RequiredToolFailed,
                message: err.to_string(),
                retryable: err.is_transient(),
            },
            _ => Self {
                task_id,
                kind: FailureKind::Internal,
                message: err.to_string(),
                retryable: err.is_transient(),
            },
        }
    }

    pub fn timeout(task_id: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            task_id: task_id.into(),
            kind: FailureKind::Timeout,
            message: format!("task exceeded {timeout_secs}s wall-clock timeout"),
            retryable: true,
        }
    }
}

/// Why a task was skipped without being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// An ancestor in the dependency chain failed.
    FailedDependency { failed_task: String },
    /// The run was cancelled before this task produced a result.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::FailedDependency { failed_task } => {
                write!(f, "dependency '{failed_task}' failed")
            }
            SkipReason::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(WorkerResult),
    Failed(TaskFailure),
    Skipped { reason: SkipReason },
}

impl TaskOutcome {
    pub fn as_success(&self) -> Option<&WorkerResult> {
        match self {
            TaskOutcome::Succeeded(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskOutcome::Skipped { .. })
    }
}

/// How completely the run answered the user's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// Every plan task succeeded.
    Answered,
    /// Some tasks succeeded; the outcomes map says what is missing and why.
    PartiallyAnswered,
    /// No task succeeded.
    Unanswered,
}

/// Final product of a run: the plan, every task's terminal outcome, and the
/// synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub plan: Plan,
    pub outcomes: BTreeMap<String, TaskOutcome>,
    pub final_insights: Vec<String>,
    pub recommendations: Vec<String>,
    /// Mean of succeeded confidences, weighted by the fraction of plan tasks
    /// that succeeded. 0.0 when nothing succeeded.
    pub confidence_score: f64,
    /// Set when synthesis could not be fully grounded or the synthesis oracle
    /// was unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_disclaimer: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl OrchestrationResult {
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failed()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_skipped()).count()
    }

    pub fn status(&self) -> AnswerStatus {
        let succeeded = self.succeeded_count();
        if succeeded == 0 {
            AnswerStatus::Unanswered
        } else if succeeded == self.plan.len() {
            AnswerStatus::Answered
        } else {
            AnswerStatus::PartiallyAnswered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, worker: WorkerKind, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            worker,
            description: format!("work for {id}"),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
        }
    }

    fn all_workers() -> BTreeSet<WorkerKind> {
        WorkerKind::ALL.into_iter().collect()
    }

    fn plan(tasks: Vec<Task>) -> Plan {
        Plan {
            tasks,
            estimated_minutes: None,
            success_criteria: vec![],
        }
    }

    #[test]
    fn worker_kind_wire_names() {
        assert_eq!(WorkerKind::DataAnalyst.to_string(), "data_analyst");
        assert_eq!(
            serde_json::to_string(&WorkerKind::Visualization).unwrap(),
            "\"visualization\""
        );
        let kind: WorkerKind = serde_json::from_str("\"data_analyst\"").unwrap();
        assert_eq!(kind, WorkerKind::DataAnalyst);
    }

    #[test]
    fn validate_accepts_linear_chain() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t2", WorkerKind::Visualization, &["t1"]),
            task("t3", WorkerKind::Report, &["t1", "t2"]),
        ]);
        assert!(p.validate(&all_workers(), 10).is_ok());
    }

    #[test]
    fn validate_rejects_empty_plan() {
        let p = plan(vec![]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::EmptyPlan)
        ));
    }

    #[test]
    fn validate_rejects_oversized_plan() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t2", WorkerKind::DataAnalyst, &[]),
            task("t3", WorkerKind::DataAnalyst, &[]),
        ]);
        assert!(matches!(
            p.validate(&all_workers(), 2),
            Err(Error::PlanTooLarge { count: 3, max: 2 })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t1", WorkerKind::Report, &[]),
        ]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::DuplicateTask(id)) if id == "t1"
        ));
    }

    #[test]
    fn validate_rejects_blank_description() {
        let mut t = task("t1", WorkerKind::DataAnalyst, &[]);
        t.description = "   ".into();
        let p = plan(vec![t]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::EmptyTaskDescription(id)) if id == "t1"
        ));
    }

    #[test]
    fn validate_rejects_unregistered_worker() {
        let p = plan(vec![task("t1", WorkerKind::Prediction, &[])]);
        let mut available = all_workers();
        available.remove(&WorkerKind::Prediction);
        assert!(matches!(
            p.validate(&available, 10),
            Err(Error::UnknownWorker { task_id, worker })
                if task_id == "t1" && worker == "prediction"
        ));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let p = plan(vec![task("t1", WorkerKind::DataAnalyst, &["ghost"])]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::UnknownDependency { task_id, dependency })
                if task_id == "t1" && dependency == "ghost"
        ));
    }

    #[test]
    fn validate_rejects_self_cycle() {
        let p = plan(vec![task("t1", WorkerKind::DataAnalyst, &["t1"])]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::CyclicPlan(_))
        ));
    }

    #[test]
    fn validate_rejects_two_node_cycle() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &["t2"]),
            task("t2", WorkerKind::Visualization, &["t1"]),
        ]);
        let err = p.validate(&all_workers(), 10).unwrap_err();
        assert!(matches!(err, Error::CyclicPlan(_)));
    }

    #[test]
    fn validate_rejects_cycle_behind_valid_prefix() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t2", WorkerKind::Visualization, &["t1", "t4"]),
            task("t3", WorkerKind::Prediction, &["t2"]),
            task("t4", WorkerKind::Report, &["t3"]),
        ]);
        assert!(matches!(
            p.validate(&all_workers(), 10),
            Err(Error::CyclicPlan(_))
        ));
    }

    #[test]
    fn transitive_dependents_walks_whole_chain() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t2", WorkerKind::Visualization, &["t1"]),
            task("t3", WorkerKind::Report, &["t2"]),
            task("t4", WorkerKind::Prediction, &[]),
        ]);
        assert_eq!(p.transitive_dependents("t1"), vec!["t2", "t3"]);
        assert_eq!(p.transitive_dependents("t3"), Vec::<String>::new());
        assert_eq!(p.transitive_dependents("t4"), Vec::<String>::new());
    }

    #[test]
    fn transitive_dependents_diamond() {
        let p = plan(vec![
            task("a", WorkerKind::DataAnalyst, &[]),
            task("b", WorkerKind::Visualization, &["a"]),
            task("c", WorkerKind::Prediction, &["a"]),
            task("d", WorkerKind::Report, &["b", "c"]),
        ]);
        assert_eq!(p.transitive_dependents("a"), vec!["b", "c", "d"]);
        assert_eq!(p.transitive_dependents("b"), vec!["d"]);
    }

    #[test]
    fn failure_from_error_taxonomy() {
        let f = TaskFailure::from_error(
            "t1",
            &Error::OracleUnavailable {
                attempts: 3,
                message: "429".into(),
            },
        );
        assert_eq!(f.kind, FailureKind::OracleUnavailable);
        assert!(f.retryable);

        let f = TaskFailure::from_error(
            "t1",
            &Error::RequiredToolFailed {
                tool: "sql_query".into(),
                message: "syntax error".into(),
                transient: false,
            },
        );
        assert_eq!(f.kind, FailureKind::RequiredToolFailed);
        assert!(!f.retryable);

        // A required tool that failed on transport keeps its transience.
        let f = TaskFailure::from_error(
            "t1",
            &Error::RequiredToolFailed {
                tool: "sql_query".into(),
                message: "connection reset".into(),
                transient: true,
            },
        );
        assert_eq!(f.kind, FailureKind::RequiredToolFailed);
        assert!(f.retryable);

        let f = TaskFailure::from_error("t1", &Error::Agent("boom".into()));
        assert_eq!(f.kind, FailureKind::Internal);
        assert!(!f.retryable);

        let f = TaskFailure::timeout("t2", 60);
        assert_eq!(f.kind, FailureKind::Timeout);
        assert!(f.retryable);
        assert!(f.message.contains("60s"));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = TaskOutcome::Skipped {
            reason: SkipReason::FailedDependency {
                failed_task: "t1".into(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["kind"], "failed_dependency");
        assert_eq!(json["reason"]["failed_task"], "t1");

        let back: TaskOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn result_status_classification() {
        let p = plan(vec![
            task("t1", WorkerKind::DataAnalyst, &[]),
            task("t2", WorkerKind::Report, &["t1"]),
        ]);
        let succeeded = TaskOutcome::Succeeded(WorkerResult {
            task_id: "t1".into(),
            worker: WorkerKind::DataAnalyst,
            output: WorkerOutput {
                text: "rows: 3".into(),
                payload: None,
            },
            confidence: 0.9,
            tool_calls_made: vec![],
        });

        let mut outcomes = BTreeMap::new();
        outcomes.insert("t1".to_string(), succeeded.clone());
        outcomes.insert(
            "t2".to_string(),
            TaskOutcome::Failed(TaskFailure::timeout("t2", 60)),
        );
        let result = OrchestrationResult {
            plan: p.clone(),
            outcomes,
            final_insights: vec![],
            recommendations: vec![],
            confidence_score: 0.45,
            grounding_disclaimer: None,
            completed_at: Utc::now(),
        };
        assert_eq!(result.status(), AnswerStatus::PartiallyAnswered);
        assert_eq!(result.succeeded_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.skipped_count(), 0);

        let mut outcomes = BTreeMap::new();
        outcomes.insert("t1".to_string(), succeeded);
        let mut result = OrchestrationResult {
            plan: p,
            outcomes,
            final_insights: vec![],
            recommendations: vec![],
            confidence_score: 0.0,
            grounding_disclaimer: None,
            completed_at: Utc::now(),
        };
        result.outcomes.insert(
            "t2".to_string(),
            TaskOutcome::Succeeded(WorkerResult {
                task_id: "t2".into(),
                worker: WorkerKind::Report,
                output: WorkerOutput {
                    text: "report".into(),
                    payload: None,
                },
                confidence: 1.0,
                tool_calls_made: vec![],
            }),
        );
        assert_eq!(result.status(), AnswerStatus::Answered);
    }
}
