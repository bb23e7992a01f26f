//! Event types for streaming workflow progress
//!
//! Events are sent from the engine to any consumer (test harness, channel,
//! log shipper) to report run lifecycle, task state changes and constraint
//! updates. Sending never blocks execution and a failing sink never fails
//! a run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Trait for sending workflow events
///
/// This abstracts over the transport mechanism (mpsc channel, collector, etc.)
/// allowing the engine to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// A run started
    #[serde(rename_all = "camelCase")]
    RunStarted { execution_id: String, target: String },

    /// A run produced its final value
    #[serde(rename_all = "camelCase")]
    RunCompleted {
        execution_id: String,
        generations: u64,
    },

    /// A run failed
    #[serde(rename_all = "camelCase")]
    RunFailed { execution_id: String, error: String },

    /// A run was cancelled through its token
    #[serde(rename_all = "camelCase")]
    RunCancelled { execution_id: String },

    /// A trampoline generation started
    #[serde(rename_all = "camelCase")]
    GenerationStarted {
        execution_id: String,
        generation: u64,
        target: String,
    },

    /// A task started executing
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        task_id: String,
        task_name: String,
        execution_id: String,
    },

    /// A task completed successfully
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        task_name: String,
        execution_id: String,
        duration_ms: u64,
    },

    /// A task failed after exhausting its retries
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        task_name: String,
        execution_id: String,
        error: String,
    },

    /// A task was not executed
    #[serde(rename_all = "camelCase")]
    TaskSkipped {
        task_id: String,
        execution_id: String,
        reason: String,
    },

    /// A failed attempt will be retried
    #[serde(rename_all = "camelCase")]
    TaskRetry {
        task_id: String,
        execution_id: String,
        attempt: u32,
        error: String,
    },

    /// A task is waiting for resource capacity
    #[serde(rename_all = "camelCase")]
    TaskBlocked {
        task_id: String,
        execution_id: String,
        resources: Vec<String>,
    },

    /// A constraint denied admission; the task waits for a wake-up
    #[serde(rename_all = "camelCase")]
    TaskDeferred {
        task_id: String,
        execution_id: String,
    },

    /// A cache policy served the result
    #[serde(rename_all = "camelCase")]
    CacheHit {
        task_id: String,
        execution_id: String,
        policy: String,
    },

    /// A constraint was added or replaced
    #[serde(rename_all = "camelCase")]
    ConstraintUpdated {
        constraint_id: String,
        scope: String,
        kind: String,
    },

    /// A constraint was removed or expired
    #[serde(rename_all = "camelCase")]
    ConstraintRemoved {
        constraint_id: String,
        scope: String,
        kind: String,
    },
}

impl WorkflowEvent {
    /// Create a task skipped event
    pub fn task_skipped(task_id: &str, execution_id: &str, reason: impl ToString) -> Self {
        Self::TaskSkipped {
            task_id: task_id.to_string(),
            execution_id: execution_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a task started event
    pub fn task_started(task_id: &str, task_name: &str, execution_id: &str) -> Self {
        Self::TaskStarted {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            execution_id: execution_id.to_string(),
        }
    }

    /// Node id the event refers to, if it is a task event
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSkipped { task_id, .. }
            | Self::TaskRetry { task_id, .. }
            | Self::TaskBlocked { task_id, .. }
            | Self::TaskDeferred { task_id, .. }
            | Self::CacheHit { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}
