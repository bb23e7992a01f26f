//! Engine: wires the components together and drives runs
//!
//! An [`Engine`] owns the long-lived pieces (node registry, recursion
//! analysis, resource and constraint managers, the execution strategy and
//! its plan cache). Each run gets its own execution id, result store,
//! cancellation token and parameters.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::builder()
//!     .with_config(EngineConfig::default().with_capacity("gpu", 1))
//!     .build();
//! let value = engine.run(&add.apply([1, 2])).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::GraphBuilder;
use crate::call::LazyCall;
use crate::config::{EngineConfig, SolverKind, StrategyKind};
use crate::constraints::ConstraintManager;
use crate::error::{EngineError, Result};
use crate::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::executor::{Executor, LocalExecutor};
use crate::extensions::Extensions;
use crate::processor::{NodeProcessor, RunScope};
use crate::pubsub::{MessageCallback, PubSubConnector, SubscriptionHandle};
use crate::recursion::RecursionAnalyzer;
use crate::registry::NodeRegistry;
use crate::resources::ResourceManager;
use crate::signal::WakeSignal;
use crate::solver::{LayeredSolver, ResourceAwareSolver, Solver, StagePlan};
use crate::store::{MemoryStore, ResultStore};
use crate::strategy::{ExecutionStrategy, GraphStrategy, RunContext, VmStrategy};
use crate::types::Graph;

/// Per-run options
#[derive(Default)]
pub struct RunOptions {
    pub params: BTreeMap<String, Value>,
    pub cancel: Option<CancellationToken>,
    pub store: Option<Arc<dyn ResultStore>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    executor: Arc<dyn Executor>,
    events: Arc<dyn EventSink>,
    extensions: Extensions,
    connector: Option<Arc<dyn PubSubConnector>>,
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Source of live constraint updates
    pub fn with_connector(mut self, connector: Arc<dyn PubSubConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_capacity(mut self, name: impl Into<String>, capacity: u64) -> Self {
        self.config.capacities.insert(name.into(), capacity);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let registry = Arc::new(NodeRegistry::new());
        let builder = Arc::new(GraphBuilder::new(
            Arc::clone(&registry),
            Arc::new(RecursionAnalyzer::new()),
        ));
        let resources = Arc::new(ResourceManager::with_capacities(&config.capacities));
        let constraints = ConstraintManager::new(
            Arc::clone(&resources),
            Arc::new(WakeSignal::new()),
            Arc::clone(&self.events),
            config.expiry_margin(),
        );
        let solver: Arc<dyn Solver> = match config.solver {
            SolverKind::Layered => Arc::new(LayeredSolver),
            SolverKind::ResourceAware => Arc::new(ResourceAwareSolver::new(
                config.capacities.clone(),
                config.solver_search_budget,
            )),
        };
        let strategy: Arc<dyn ExecutionStrategy> = match config.strategy {
            StrategyKind::Graph => Arc::new(
                GraphStrategy::new(Arc::clone(&solver))
                    .with_plan_cache(config.plan_cache)
                    .with_hot_path(config.hot_path),
            ),
            StrategyKind::Vm => Arc::new(VmStrategy::new()),
        };

        Engine {
            config,
            registry,
            builder,
            resources,
            constraints,
            solver,
            strategy,
            executor: self.executor,
            events: self.events,
            extensions: self.extensions,
            connector: self.connector,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    builder: Arc<GraphBuilder>,
    resources: Arc<ResourceManager>,
    constraints: Arc<ConstraintManager>,
    solver: Arc<dyn Solver>,
    strategy: Arc<dyn ExecutionStrategy>,
    executor: Arc<dyn Executor>,
    events: Arc<dyn EventSink>,
    extensions: Extensions,
    connector: Option<Arc<dyn PubSubConnector>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            executor: Arc::new(LocalExecutor),
            events: Arc::new(NullEventSink),
            extensions: Extensions::new(),
            connector: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn constraints(&self) -> &Arc<ConstraintManager> {
        &self.constraints
    }

    pub fn strategy(&self) -> &Arc<dyn ExecutionStrategy> {
        &self.strategy
    }

    /// Build the graph for `target` without running it
    pub fn build_graph(&self, target: &LazyCall) -> Result<Graph> {
        self.builder.build(target)
    }

    /// Build and solve the first generation of `target`
    pub fn plan(&self, target: &LazyCall) -> Result<(Graph, StagePlan)> {
        let graph = self.builder.build(target)?;
        let plan = self.solver.resolve(&graph)?;
        Ok((graph, plan))
    }

    pub async fn run(&self, target: &LazyCall) -> Result<Value> {
        self.run_with(target, RunOptions::default()).await
    }

    pub async fn run_with(&self, target: &LazyCall, options: RunOptions) -> Result<Value> {
        let execution_id = format!("run-{}", Uuid::new_v4());
        let scope = RunScope {
            execution_id: execution_id.clone(),
            cancel: options.cancel.unwrap_or_default(),
            params: options.params,
        };
        let store = options
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ResultStore>);
        let processor = Arc::new(NodeProcessor::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.resources),
            Arc::clone(&self.constraints),
            Arc::clone(&self.events),
            self.extensions.clone(),
            scope,
        ));
        let ctx = RunContext::new(
            Arc::clone(&self.builder),
            processor,
            store,
            Arc::clone(&self.events),
            self.config.max_generations,
        );

        let subscription = self.subscribe_constraints().await;
        log::info!(
            "Starting run {} for {:?} ({} strategy)",
            execution_id,
            target,
            self.strategy.name()
        );
        let _ = self.events.send(WorkflowEvent::RunStarted {
            execution_id: execution_id.clone(),
            target: target.label(),
        });

        let result = self.strategy.run(&ctx, target.clone()).await;

        match &result {
            Ok(_) => {
                log::info!(
                    "Run {} completed after {} generation(s)",
                    execution_id,
                    ctx.generations()
                );
                let _ = self.events.send(WorkflowEvent::RunCompleted {
                    execution_id: execution_id.clone(),
                    generations: ctx.generations(),
                });
            }
            Err(EngineError::Cancelled) => {
                log::info!("Run {} cancelled", execution_id);
                let _ = self.events.send(WorkflowEvent::RunCancelled {
                    execution_id: execution_id.clone(),
                });
            }
            Err(e) => {
                log::info!("Run {} failed: {}", execution_id, e);
                let _ = self.events.send(WorkflowEvent::RunFailed {
                    execution_id: execution_id.clone(),
                    error: e.to_string(),
                });
            }
        }

        if let (Some(connector), Some(handle)) = (&self.connector, subscription) {
            if let Err(e) = connector.unsubscribe(handle).await {
                log::warn!("Failed to drop constraint subscription: {}", e);
            }
        }
        result
    }

    /// Feed the constraints topic into the constraint manager for this run.
    ///
    /// A failed subscription leaves the current constraint set in force.
    async fn subscribe_constraints(&self) -> Option<SubscriptionHandle> {
        let connector = self.connector.as_ref()?;
        let prefix = self.config.constraint_topic.clone();
        let constraints = Arc::clone(&self.constraints);
        let callback: MessageCallback = Arc::new(move |topic: &str, payload: &[u8]| {
            let _ = constraints.apply_control_message(&prefix, topic, payload);
        });
        match connector
            .subscribe(&self.config.constraint_pattern(), callback)
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Constraint subscription failed: {}", e);
                None
            }
        }
    }
}
