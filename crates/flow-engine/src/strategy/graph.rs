//! Graph strategy: build, solve and run stages, once per generation
//!
//! Stage plans are cached under the target node's template hash and reused
//! by position whenever a later graph has the same shape. A plain tail call
//! into a task of a known recursive cycle skips the scheduler altogether and
//! runs as a single quiet invocation of the task's interned node, with the
//! call's literals bound in; only a change of shape interns another node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;

use super::binding::bind_call;
use super::{ExecutionStrategy, RunContext, Step};
use crate::call::{LazyCall, Outcome};
use crate::error::{EngineError, Result};
use crate::events::WorkflowEvent;
use crate::flow::FlowManager;
use crate::processor::BoundInputs;
use crate::solver::{Solver, StagePlan};
use crate::types::{Graph, Node};

pub struct GraphStrategy {
    solver: Arc<dyn Solver>,
    plans: DashMap<String, Arc<StagePlan>>,
    /// Interned node per task name for the hot path
    hot_nodes: DashMap<String, Arc<Node>>,
    plan_cache: bool,
    hot_path: bool,
}

impl GraphStrategy {
    pub fn new(solver: Arc<dyn Solver>) -> Self {
        Self {
            solver,
            plans: DashMap::new(),
            hot_nodes: DashMap::new(),
            plan_cache: true,
            hot_path: true,
        }
    }

    pub fn with_plan_cache(mut self, enabled: bool) -> Self {
        self.plan_cache = enabled;
        self
    }

    pub fn with_hot_path(mut self, enabled: bool) -> Self {
        self.hot_path = enabled;
        self
    }

    /// Number of cached stage plans
    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }

    /// Stage plan for `graph`, rehydrated from the cache when the shape matches
    pub fn plan(&self, graph: &Graph) -> Result<Arc<StagePlan>> {
        if !self.plan_cache {
            return Ok(Arc::new(self.solver.resolve(graph)?));
        }
        let key = graph
            .node(graph.target())
            .map(|n| n.template_id.clone())
            .unwrap_or_default();
        let cached = self.plans.get(&key).map(|p| Arc::clone(p.value()));
        if let Some(plan) = cached {
            if plan.fits(graph) {
                log::debug!("Plan cache hit for template {}", &key[..key.len().min(12)]);
                return Ok(plan);
            }
        }

        log::debug!(
            "Plan cache miss for template {}; solving with {}",
            &key[..key.len().min(12)],
            self.solver.name()
        );
        let plan = Arc::new(self.solver.resolve(graph)?);
        self.plans.insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    fn takes_hot_path(&self, ctx: &RunContext, target: &LazyCall) -> bool {
        self.hot_path
            && target.is_plain()
            && target
                .task()
                .is_some_and(|t| ctx.builder.analyzer().cycle_of(t.name()).is_some())
    }

    /// Node and bound inputs for a hot-path call
    fn hot_node(&self, ctx: &RunContext, target: &LazyCall) -> Result<(Arc<Node>, BoundInputs)> {
        let none = HashMap::new();
        let key = target.label();
        let cached = self.hot_nodes.get(&key).map(|n| Arc::clone(n.value()));
        if let Some(node) = cached {
            if let Some(bound) = bind_call(target, &node, &none) {
                return Ok((node, bound));
            }
        }
        let node = ctx.builder.intern_plain(target)?;
        let bound = bind_call(target, &node, &none).ok_or_else(|| {
            EngineError::InvalidGraph(format!("{:?} does not fit its own node", target))
        })?;
        self.hot_nodes.insert(key, Arc::clone(&node));
        Ok((node, bound))
    }

    async fn run_graph(&self, ctx: &RunContext, graph: Arc<Graph>, plan: &StagePlan) -> Result<Step> {
        let flow = FlowManager::new(Arc::clone(&graph));
        let mut tail = None;

        for stage in &plan.stages {
            if ctx.processor.scope().cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let runs = stage
                .iter()
                .filter_map(|&position| graph.node_at(position))
                .map(|node| self.run_node(ctx, &flow, node));
            let mut first_error = None;
            for result in join_all(runs).await {
                match result {
                    Ok(Some(next)) => tail = Some(next),
                    Ok(None) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        if let Some(next) = tail {
            return Ok(Step::Next(next));
        }
        match ctx.store.get_result(graph.target()).await? {
            Some(value) => Ok(Step::Done(value)),
            None => {
                log::debug!("Target {} was skipped; result is null", graph.target());
                Ok(Step::Done(Value::Null))
            }
        }
    }

    /// Run or skip one node; returns the tail call if the target made one
    async fn run_node(&self, ctx: &RunContext, flow: &FlowManager, node: &Arc<Node>) -> Result<Option<LazyCall>> {
        if let Some(reason) = flow.should_skip(&node.id) {
            ctx.store.mark_skipped(&node.id, &reason.to_string()).await?;
            let _ = ctx
                .events
                .send(WorkflowEvent::task_skipped(&node.id, ctx.execution_id(), &reason));
            return Ok(None);
        }

        match ctx.processor.process(node, flow, ctx.store.as_ref()).await? {
            Outcome::Value(value) => {
                flow.register_result(&node.id, &value);
                ctx.store.put_result(&node.id, value).await?;
                Ok(None)
            }
            Outcome::TailCall(next) if node.id == *flow.graph().target() => Ok(Some(next)),
            Outcome::TailCall(next) => Err(EngineError::Unsupported(format!(
                "{} returned {:?} but only the generation target may tail call",
                node.label(),
                next
            ))),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for GraphStrategy {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn run(&self, ctx: &RunContext, target: LazyCall) -> Result<Value> {
        let mut target = target;
        loop {
            let generation = ctx.next_generation().await?;
            if generation > 1 {
                ctx.store.clear().await?;
            }

            if self.takes_hot_path(ctx, &target) {
                log::debug!("Hot path for {:?} (generation {})", target, generation);
                let (node, bound) = self.hot_node(ctx, &target)?;
                match ctx
                    .processor
                    .execute_bound(&node, &HashMap::new(), &bound, false)
                    .await?
                {
                    Outcome::Value(value) => return Ok(value),
                    Outcome::TailCall(next) => {
                        target = next;
                        continue;
                    }
                }
            }

            ctx.generation_started(generation, &target);
            let graph = Arc::new(ctx.builder.build(&target)?);
            let plan = self.plan(&graph)?;
            match self.run_graph(ctx, graph, &plan).await? {
                Step::Done(value) => return Ok(value),
                Step::Next(next) => target = next,
            }
        }
    }
}
