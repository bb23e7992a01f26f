//! Pluggable task executors
//!
//! The processor hands every invocation to an [`Executor`]. The default
//! [`LocalExecutor`] runs the task body in-process; other implementations
//! can dispatch remotely or stand in for tasks under test.

use async_trait::async_trait;

use crate::call::{Outcome, TaskArgs};
use crate::error::{EngineError, Result};
use crate::types::Node;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one invocation of `node` with fully resolved arguments
    async fn execute(&self, node: &Node, args: TaskArgs) -> Result<Outcome>;
}

/// Calls the task body directly
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, node: &Node, args: TaskArgs) -> Result<Outcome> {
        match &node.task {
            Some(task) => task.run(args).await,
            None => Err(EngineError::InvalidGraph(format!(
                "node {} has no task to execute",
                node.short_id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::call::TaskDef;
    use crate::recursion::RecursionAnalyzer;
    use crate::registry::NodeRegistry;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_executor_runs_body() {
        let double = Arc::new(TaskDef::new("double", |args| async move {
            Ok(Outcome::value(args.i64_arg(0)? * 2))
        }));
        let graph = GraphBuilder::new(
            Arc::new(NodeRegistry::new()),
            Arc::new(RecursionAnalyzer::new()),
        )
        .build(&double.apply([21]))
        .unwrap();
        let node = graph.node(graph.target()).unwrap();

        let mut args = TaskArgs::new(Arc::clone(&double));
        args.args.push(json!(21));
        let out = LocalExecutor.execute(node, args).await.unwrap();
        assert_eq!(out.into_value(), Some(json!(42)));
    }
}
