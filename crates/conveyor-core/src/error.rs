//! Error taxonomy for the engine.

use thiserror::Error;

/// Error type for the Conveyor engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Definition rejected at publish time
    #[error("Invalid definition: {0}")]
    DefinitionInvalid(String),

    /// Definition not found
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    /// Process instance not found
    #[error("Process instance not found: {0}")]
    InstanceNotFound(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Operation against a terminal instance or task
    #[error("Already terminal: {0}")]
    AlreadyTerminal(String),

    /// Bad guard expression or step configuration discovered mid-execution
    #[error("Step configuration error: {0}")]
    StepConfigError(String),

    /// Automatic-step collaborator call failed
    #[error("Collaborator error: {0}")]
    CollaboratorError(String),

    /// Optimistic save targeted a stale instance revision
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// State store failure
    #[error("State store error: {0}")]
    StoreError(String),

    /// Timer scheduling or delivery error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True for errors that terminalize a single instance without
    /// affecting the engine process.
    pub fn is_instance_contained(&self) -> bool {
        matches!(
            self,
            EngineError::StepConfigError(_) | EngineError::CollaboratorError(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::StoreError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
