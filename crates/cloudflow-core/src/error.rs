use thiserror::Error;

/// Core error type for the Cloudflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Flow or task definition rejected before persistence
    #[error("validation error: {0}")]
    Validation(String),

    /// Flow not found
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// Task not found within a flow
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No handler registered under the requested action name
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// Another worker won the atomic claim; benign, skip the task
    #[error("claim lost: {0}")]
    ClaimLost(String),

    /// Handler (business or remote) failure, subject to the task retry policy
    #[error("handler error: {0}")]
    Handler(String),

    /// Store-level failure; the scheduling pass aborts and retries next tick
    #[error("store error: {0}")]
    Store(String),

    /// An asynchronous cloud operation never reached a terminal state in budget
    #[error("poll timed out: {0}")]
    PollTimeout(String),

    /// Attempted status change violating the flow/task state machine
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Claim contention is the one failure a scheduling pass silently skips.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, EngineError::ClaimLost(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
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
