use thiserror::Error;
use uuid::Uuid;

use crate::controller::SubjectRef;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No transition from state {from} to state {to} in graph {graph}")]
    TransitionNotFound { graph: Uuid, from: Uuid, to: Uuid },

    #[error("{count} transitions match {from} -> {to} in graph {graph}, expected exactly one")]
    AmbiguousTransition {
        graph: Uuid,
        from: Uuid,
        to: Uuid,
        count: usize,
    },

    #[error("Transition {from} -> {to} already exists in graph {graph}")]
    DuplicateTransition { graph: Uuid, from: Uuid, to: Uuid },

    #[error("Cannot load task {0}")]
    TaskNotResolvable(String),

    #[error("Workflow graph {0} has no initial state")]
    MissingInitialState(Uuid),

    #[error("Controller cannot be null")]
    MissingController,

    #[error("Next state cannot be null")]
    MissingNextState,

    #[error("Controller {0} is already running a transition")]
    ControllerBusy(Uuid),

    #[error("Controller not found: {0}")]
    ControllerNotFound(Uuid),

    #[error("Subject {0} already has a state controller")]
    AlreadyInitialized(SubjectRef),

    #[error("Subject not found: {0}")]
    SubjectNotFound(SubjectRef),

    #[error("State not found: {0}")]
    StateNotFound(String),

    #[error("Workflow graph not found: {0}")]
    GraphNotFound(String),

    #[error("Invalid workflow document: {0}")]
    InvalidDocument(String),

    #[error("Job submission failed: {0}")]
    JobSubmission(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    /// Configuration errors are raised while a plan is being built, before
    /// anything is submitted or mutated.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::TransitionNotFound { .. }
                | EngineError::AmbiguousTransition { .. }
                | EngineError::TaskNotResolvable(_)
                | EngineError::MissingInitialState(_)
                | EngineError::MissingController
                | EngineError::MissingNextState
        )
    }
}

/// Classifies a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The task's own logic said no (a validation rejected the data, a rule failed).
    Business,
    /// Infrastructure failed underneath the task (storage, missing records).
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// Error returned by a [`Task`](crate::task::Task) body.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Rejected(_) => FailureKind::Business,
            TaskError::Failed(_) | TaskError::Engine(_) => FailureKind::System,
        }
    }
}
