//! Execution strategies
//!
//! A strategy turns a target handle into its final value. Both strategies
//! run as a trampoline: when the final value of a generation is another
//! handle, that handle becomes the next generation's target.

mod binding;
mod graph;
mod vm;

pub use graph::GraphStrategy;
pub use vm::VmStrategy;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::builder::GraphBuilder;
use crate::call::LazyCall;
use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::processor::NodeProcessor;
use crate::store::ResultStore;

/// Collaborators and counters for one run
pub struct RunContext {
    pub builder: Arc<GraphBuilder>,
    pub processor: Arc<NodeProcessor>,
    pub store: Arc<dyn ResultStore>,
    pub events: Arc<dyn EventSink>,
    pub max_generations: Option<u64>,
    generations: AtomicU64,
}

impl RunContext {
    pub fn new(
        builder: Arc<GraphBuilder>,
        processor: Arc<NodeProcessor>,
        store: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        max_generations: Option<u64>,
    ) -> Self {
        Self {
            builder,
            processor,
            store,
            events,
            max_generations,
            generations: AtomicU64::new(0),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.processor.scope().execution_id
    }

    /// Generations started so far
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    /// Yield once, then open the next generation if the run may continue
    pub(crate) async fn next_generation(&self) -> Result<u64> {
        tokio::task::yield_now().await;
        if self.processor.scope().cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.max_generations {
            if generation > limit {
                return Err(EngineError::GenerationLimit(limit));
            }
        }
        Ok(generation)
    }

    pub(crate) fn generation_started(&self, generation: u64, target: &LazyCall) {
        let _ = self.events.send(WorkflowEvent::GenerationStarted {
            execution_id: self.execution_id().to_string(),
            generation,
            target: target.label(),
        });
    }
}

/// How one generation ended
pub(crate) enum Step {
    Done(Value),
    Next(LazyCall),
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive `target` (and any tail calls it returns) to a final value
    async fn run(&self, ctx: &RunContext, target: LazyCall) -> Result<Value>;
}
