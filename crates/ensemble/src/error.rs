use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("analysis request is empty")]
    EmptyRequest,

    #[error("plan contains no tasks")]
    EmptyPlan,

    #[error("plan dependency graph contains a cycle involving task '{0}'")]
    CyclicPlan(String),

    #[error("task '{task_id}' names worker '{worker}', which is not registered")]
    UnknownWorker { task_id: String, worker: String },

    #[error("plan has {count} tasks, exceeding the configured maximum of {max}")]
    PlanTooLarge { count: usize, max: usize },

    #[error("task '{task_id}' depends on '{dependency}', which is not in the plan")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("duplicate task id '{0}' in plan")]
    DuplicateTask(String),

    #[error("task '{0}' has an empty description")]
    EmptyTaskDescription(String),

    #[error("a tool named '{0}' is already registered")]
    DuplicateTool(String),

    #[error("no tool named '{0}' is registered")]
    UnknownTool(String),

    #[error("oracle unavailable after {attempts} attempt(s): {message}")]
    OracleUnavailable { attempts: u32, message: String },

    #[error("required tool '{tool}' failed: {message}")]
    RequiredToolFailed {
        tool: String,
        message: String,
        /// Whether the underlying tool error was a transient transport
        /// condition, carried here because the source error is stringified.
        transient: bool,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("Max turns ({0}) exceeded")]
    MaxTurnsExceeded(usize),

    #[error("Response truncated (max_tokens reached)")]
    Truncated,

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a transient transport/oracle condition that a
    /// later attempt could clear. Drives `TaskFailure.retryable`.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { status, .. } => matches!(*status, 429 | 500 | 502 | 503 | 529),
            Error::Http(_) => true,
            Error::OracleUnavailable { .. } => true,
            Error::RequiredToolFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this error aborts a run before any task executes.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Error::EmptyRequest
                | Error::EmptyPlan
                | Error::CyclicPlan(_)
                | Error::UnknownWorker { .. }
                | Error::PlanTooLarge { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::EmptyTaskDescription(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::Api {
            status: 429,
            message: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "API error (429): rate limited");

        let err = Error::PlanTooLarge { count: 20, max: 12 };
        assert_eq!(
            err.to_string(),
            "plan has 20 tasks, exceeding the configured maximum of 12"
        );

        let err = Error::CyclicPlan("t3".into());
        assert!(err.to_string().contains("t3"));
    }

    #[test]
    fn transient_classification() {
        assert!(
            Error::Api {
                status: 429,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            Error::Api {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            Error::OracleUnavailable {
                attempts: 3,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !Error::Api {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !Error::RequiredToolFailed {
                tool: "sql_query".into(),
                message: String::new(),
                transient: false
            }
            .is_transient()
        );
        assert!(
            Error::RequiredToolFailed {
                tool: "sql_query".into(),
                message: String::new(),
                transient: true
            }
            .is_transient()
        );
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn planning_classification() {
        assert!(Error::EmptyRequest.is_planning());
        assert!(Error::CyclicPlan("a".into()).is_planning());
        assert!(Error::EmptyTaskDescription("t1".into()).is_planning());
        assert!(
            Error::UnknownWorker {
                task_id: "t1".into(),
                worker: "marketing".into()
            }
            .is_planning()
        );
        assert!(!Error::Cancelled.is_planning());
        assert!(
            !Error::OracleUnavailable {
                attempts: 1,
                message: String::new()
            }
            .is_planning()
        );
    }
}
