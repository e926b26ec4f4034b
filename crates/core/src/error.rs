/// Errors raised at the orchestrator boundary by callers misusing the API.
///
/// These are never conflated with a task's own failure, which is recorded
/// inside the task and reported through its status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {0} has not been started")]
    NotStarted(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for the unknown `(client, task)` condition.
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "task",
            id: task_id.into(),
        }
    }
}
