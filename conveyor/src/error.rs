//! Error types for pipeline construction and execution.

use std::fmt;

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A stage function that terminated abnormally (panicked) inside a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    /// Registered stage name (may be empty).
    pub stage: String,
    /// Position of the stage in registration order.
    pub stage_index: usize,
    /// Worker lane within the stage.
    pub worker: usize,
    /// Panic payload, when it was a string.
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage {} ('{}') worker {} panicked: {}",
            self.stage_index, self.stage, self.worker, self.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline needs at least one stage, got {0}")]
    InvalidStageCount(usize),

    #[error("no pipeline stages left (declared {declared})")]
    NoSlotsLeft { declared: usize },

    #[error("stage '{stage}' has no stage function")]
    MissingFunction { stage: String },

    #[error("stage '{stage}' parallelism must be at least 1, got {parallelism}")]
    InvalidParallelism { stage: String, parallelism: usize },

    #[error("only {registered} of {declared} stages registered")]
    IncompleteStages { registered: usize, declared: usize },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("{0}")]
    StageFailed(StageFailure),

    #[error("invalid pipeline options: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for errors caused by cancellation or a contained stage panic.
    pub fn is_abort(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::StageFailed(_))
    }
}
