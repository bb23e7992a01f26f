//! Error types for the flow engine

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while building, scheduling or executing a workflow
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node's source was neither resolved nor penetrable
    #[error("Dependency missing for node '{node}': '{dependency}' has no result")]
    DependencyMissing { node: String, dependency: String },

    /// An injected resource was never registered with the engine
    #[error("Resource '{resource}' requested by node '{node}' is not registered")]
    ResourceNotFound { node: String, resource: String },

    /// A task body kept failing after its retry budget was spent
    #[error("Task '{task}' (node '{node}') failed after {attempts} attempt(s): {message}")]
    ExecutionFailure {
        node: String,
        task: String,
        attempts: u32,
        message: String,
    },

    /// Error raised by a task body (wrapped into `ExecutionFailure` by the processor)
    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    /// A control message on the constraints topic could not be applied
    #[error("Malformed control message: {0}")]
    MalformedControlMessage(String),

    /// Fan-out inputs that cannot be zipped together
    #[error("Invalid mapped inputs for node '{node}': {detail}")]
    InvalidMapInputs { node: String, detail: String },

    /// The invocation graph cannot be scheduled
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// The trampoline exceeded its configured generation limit
    #[error("Generation limit reached ({0} generations)")]
    GenerationLimit(u64),

    /// The construct is not supported by the selected execution strategy
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Result store or cache backend failure
    #[error("Store error: {0}")]
    Store(String),

    /// Pub/sub transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled
    #[error("Workflow cancelled")]
    Cancelled,
}

impl EngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Whether a failed attempt may be retried under a retry policy.
    ///
    /// Only task-body errors qualify; structural errors and cancellation
    /// surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed(_) | Self::Store(_))
    }

    /// Whether this error represents a cancelled run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
