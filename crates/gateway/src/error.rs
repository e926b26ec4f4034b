/// Everything that can end a generation task in the FAILED state.
///
/// Task failures are rendered to text and stored on the task; they never
/// escape a driving routine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("Workflow template error: {0}")]
    Template(String),

    #[error("Image upload failed: {0}")]
    Upload(String),

    #[error("Job submission failed: {0}")]
    Submission(String),

    /// The backend reported the job as failed.
    #[error("{0}")]
    JobFailed(String),

    #[error("Progress stream ended without a success signal")]
    StreamExhausted,

    #[error("Result not available after success: {0}")]
    ResultUnavailable(String),

    #[error("Failed to fetch result: {0}")]
    ResultFetch(String),

    /// Local tracking was stopped; the remote job may still be running.
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task driver panicked: {0}")]
    Panicked(String),
}

impl From<sds_comfyui::workflow::WorkflowError> for GenerationError {
    fn from(e: sds_comfyui::workflow::WorkflowError) -> Self {
        Self::Template(e.to_string())
    }
}
