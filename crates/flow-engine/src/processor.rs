//! Node processor: everything between "this node may run" and a value
//!
//! For one node the processor resolves arguments from upstream values,
//! waits for constraint admission, claims resources, consults the cache,
//! calls the executor with retries and finally saves to the cache. Fan-out
//! nodes run one sub-invocation per mapped item, concurrently, and gather
//! the results positionally.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::call::{self, Outcome, RetryPolicy, TaskArgs};
use crate::constraints::ConstraintManager;
use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::executor::Executor;
use crate::extensions::Extensions;
use crate::flow::FlowManager;
use crate::resources::{Requirements, ResourceManager};
use crate::store::ResultStore;
use crate::types::{Binding, EdgeKind, Node, NodeBody, NodeId};

/// Per-run inputs shared by every node of the run
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    pub execution_id: String,
    pub cancel: CancellationToken,
    /// Values for parameter nodes
    pub params: BTreeMap<String, Value>,
}

/// Per-invocation inputs of a handle run through an already compiled node.
///
/// `literals` replace the node's literal arguments in resolution order
/// (positional, then keyword, depth first); `resources` replace its static
/// requirements.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BoundInputs {
    pub(crate) literals: Vec<Value>,
    pub(crate) resources: Requirements,
}

pub struct NodeProcessor {
    executor: Arc<dyn Executor>,
    resources: Arc<ResourceManager>,
    constraints: Arc<ConstraintManager>,
    events: Arc<dyn EventSink>,
    extensions: Extensions,
    scope: RunScope,
}

fn describe(node: &Node) -> String {
    format!("{} ({})", node.label(), node.short_id())
}

struct Resolver<'a> {
    node: &'a Node,
    values: &'a HashMap<NodeId, Value>,
    extensions: &'a Extensions,
    objects: Vec<(String, Arc<dyn Any + Send + Sync>)>,
    literals: Option<std::slice::Iter<'a, Value>>,
}

impl Resolver<'_> {
    fn source(&self, id: &str) -> Result<Value> {
        self.values
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::DependencyMissing {
                node: describe(self.node),
                dependency: id[..id.len().min(12)].to_string(),
            })
    }

    fn resolve(&mut self, binding: &Binding, path: &str) -> Result<Value> {
        Ok(match binding {
            Binding::Literal(v) => match self.literals.as_mut() {
                Some(bound) => bound.next().cloned().ok_or_else(|| {
                    EngineError::InvalidGraph(format!(
                        "{} has more literal arguments than were bound",
                        describe(self.node)
                    ))
                })?,
                None => v.clone(),
            },
            Binding::Unserializable(_) => Value::Null,
            Binding::Node(id) => self.source(id)?,
            Binding::List(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, b)| self.resolve(b, &call::index_path(path, i)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Binding::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, b)| Ok((k.clone(), self.resolve(b, &call::key_path(path, k))?)))
                    .collect::<Result<serde_json::Map<_, _>>>()?,
            ),
            Binding::Router(router) => {
                let selected = self.source(&router.selector)?;
                let branch = router.select(&selected).ok_or_else(|| EngineError::DependencyMissing {
                    node: describe(self.node),
                    dependency: format!("route '{}'", call::route_key(&selected)),
                })?;
                self.source(branch)?
            }
            Binding::Inject(name) => {
                let object =
                    self.extensions
                        .get_any(name)
                        .ok_or_else(|| EngineError::ResourceNotFound {
                            node: describe(self.node),
                            resource: name.clone(),
                        })?;
                self.objects.push((path.to_string(), object));
                Value::Null
            }
            Binding::Opaque(opaque) => {
                self.objects.push((path.to_string(), opaque.value()));
                Value::Null
            }
        })
    }

    fn resolve_map(&mut self, entries: &BTreeMap<String, Binding>) -> Result<BTreeMap<String, Value>> {
        entries
            .iter()
            .map(|(k, b)| Ok((k.clone(), self.resolve(b, k)?)))
            .collect()
    }
}

impl NodeProcessor {
    pub fn new(
        executor: Arc<dyn Executor>,
        resources: Arc<ResourceManager>,
        constraints: Arc<ConstraintManager>,
        events: Arc<dyn EventSink>,
        extensions: Extensions,
        scope: RunScope,
    ) -> Self {
        Self {
            executor,
            resources,
            constraints,
            events,
            extensions,
            scope,
        }
    }

    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    fn emit(&self, enabled: bool, event: WorkflowEvent) {
        if enabled {
            let _ = self.events.send(event);
        }
    }

    /// Process a node of a scheduled graph, reading inputs from the store
    pub async fn process(
        &self,
        node: &Node,
        flow: &FlowManager,
        store: &dyn ResultStore,
    ) -> Result<Outcome> {
        let mut values = HashMap::new();
        for edge in &node.inputs {
            let readable = matches!(
                edge.kind,
                EdgeKind::Data | EdgeKind::RouterRoute | EdgeKind::Constraint | EdgeKind::IterativeJump
            );
            if !readable || values.contains_key(&edge.source) {
                continue;
            }
            let Some(source) = flow.resolve_source(&edge.source) else {
                continue;
            };
            if let Some(value) = store.get_result(&source).await? {
                values.insert(edge.source.clone(), value);
            }
        }
        self.execute(node, &values, true).await
    }

    /// Run a node against already-known source values.
    ///
    /// With `emit` off no events are sent.
    pub async fn execute(
        &self,
        node: &Node,
        values: &HashMap<NodeId, Value>,
        emit: bool,
    ) -> Result<Outcome> {
        self.execute_with(node, values, None, emit).await
    }

    /// Run a compiled node on behalf of another handle of the same shape
    pub(crate) async fn execute_bound(
        &self,
        node: &Node,
        values: &HashMap<NodeId, Value>,
        bound: &BoundInputs,
        emit: bool,
    ) -> Result<Outcome> {
        self.execute_with(node, values, Some(bound), emit).await
    }

    async fn execute_with(
        &self,
        node: &Node,
        values: &HashMap<NodeId, Value>,
        bound: Option<&BoundInputs>,
        emit: bool,
    ) -> Result<Outcome> {
        let task = match (&node.body, &node.task) {
            (NodeBody::Parameter { name, default }, _) => {
                return self
                    .scope
                    .params
                    .get(name)
                    .or(default.as_ref())
                    .cloned()
                    .map(Outcome::Value)
                    .ok_or_else(|| EngineError::DependencyMissing {
                        node: describe(node),
                        dependency: format!("parameter '{}'", name),
                    });
            }
            (_, Some(task)) => Arc::clone(task),
            (_, None) => {
                return Err(EngineError::InvalidGraph(format!(
                    "node {} has no task",
                    node.short_id()
                )))
            }
        };

        let mut resolver = Resolver {
            node,
            values,
            extensions: &self.extensions,
            objects: Vec::new(),
            literals: bound.map(|b| b.literals.iter()),
        };
        let mut reqs: Requirements = match bound {
            Some(b) => b.resources.clone(),
            None => node.static_resources.clone(),
        };
        for (name, source) in &node.dynamic_resources {
            let value = resolver.source(source)?;
            let amount = value.as_u64().ok_or_else(|| {
                EngineError::failed(format!(
                    "resource amount for '{}' on {} must be a non-negative integer, got {}",
                    name,
                    describe(node),
                    value
                ))
            })?;
            *reqs.entry(name.clone()).or_insert(0) += amount;
        }
        let jump = node.jump.as_ref().map(|j| resolver.source(j)).transpose()?;

        match &node.body {
            NodeBody::Task { args, kwargs } => {
                let args = args
                    .iter()
                    .enumerate()
                    .map(|(i, b)| resolver.resolve(b, &i.to_string()))
                    .collect::<Result<Vec<_>>>()?;
                let kwargs = resolver.resolve_map(kwargs)?;

                let mut task_args = TaskArgs::new(task);
                task_args.args = args;
                task_args.kwargs = kwargs;
                task_args.jump = jump;
                for (path, object) in resolver.objects {
                    task_args.insert_object(path, object);
                }
                self.invoke(node, task_args, reqs, emit).await
            }
            NodeBody::Map { mapped, fixed } => {
                let mapped = resolver.resolve_map(mapped)?;
                let fixed = resolver.resolve_map(fixed)?;
                let items = zip_mapped(node, mapped)?;

                let mut base = TaskArgs::new(task);
                base.kwargs = fixed;
                base.jump = jump;
                for (path, object) in resolver.objects {
                    base.insert_object(path, object);
                }

                log::debug!("Fanning out {} over {} items", describe(node), items.len());
                let runs = items.into_iter().enumerate().map(|(i, item)| {
                    let mut args = base.clone();
                    args.kwargs.extend(item);
                    args.map_index = Some(i);
                    self.invoke(node, args, reqs.clone(), emit)
                });
                let mut gathered = Vec::new();
                for outcome in join_all(runs).await {
                    match outcome? {
                        Outcome::Value(v) => gathered.push(v),
                        Outcome::TailCall(_) => {
                            return Err(EngineError::Unsupported(format!(
                                "fan-out item of {} returned a tail call",
                                describe(node)
                            )))
                        }
                    }
                }
                Ok(Outcome::Value(Value::Array(gathered)))
            }
            NodeBody::Parameter { .. } => Err(EngineError::InvalidGraph(format!(
                "parameter node {} carries a task",
                node.short_id()
            ))),
        }
    }

    /// One admitted, resourced, cached and retried execution of `node`
    async fn invoke(
        &self,
        node: &Node,
        args: TaskArgs,
        mut reqs: Requirements,
        emit: bool,
    ) -> Result<Outcome> {
        let task_name = args.task().name().to_string();
        let execution_id = &self.scope.execution_id;

        if !self.constraints.check_permission(&task_name) {
            log::debug!("Deferring {}: admission denied", describe(node));
            self.emit(
                emit,
                WorkflowEvent::TaskDeferred {
                    task_id: node.id.clone(),
                    execution_id: execution_id.clone(),
                },
            );
            self.constraints
                .wake()
                .wait_until(&self.scope.cancel, || {
                    self.constraints.check_permission(&task_name)
                })
                .await?;
        }

        for (name, amount) in self.constraints.extra_requirements(&task_name) {
            *reqs.entry(name).or_insert(0) += amount;
        }
        let _guard = if reqs.is_empty() {
            None
        } else {
            if !self.resources.can_acquire(&reqs) {
                self.emit(
                    emit,
                    WorkflowEvent::TaskBlocked {
                        task_id: node.id.clone(),
                        execution_id: execution_id.clone(),
                        resources: reqs.keys().cloned().collect(),
                    },
                );
            }
            Some(self.resources.acquire(&reqs, &self.scope.cancel).await?)
        };

        let inputs = node.cache.as_ref().map(|_| args.inputs_value());
        if let (Some(cache), Some(inputs)) = (&node.cache, &inputs) {
            if let Some(value) = cache.check(&node.id, inputs).await? {
                log::debug!("Cache hit for {} ({})", describe(node), cache.name());
                self.emit(
                    emit,
                    WorkflowEvent::CacheHit {
                        task_id: node.id.clone(),
                        execution_id: execution_id.clone(),
                        policy: cache.name().to_string(),
                    },
                );
                return Ok(Outcome::Value(value));
            }
        }

        self.emit(
            emit,
            WorkflowEvent::task_started(&node.id, &task_name, execution_id),
        );
        let started = Instant::now();
        let policy = node.retry.clone().unwrap_or_else(|| RetryPolicy::new(1));
        let mut delay = policy.delay;
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.scope.cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.executor.execute(node, args.clone()) => result,
            };
            let error = match result {
                Ok(outcome) => break outcome,
                Err(e) => e,
            };

            if error.is_retryable() && attempt < policy.max_attempts {
                log::debug!(
                    "Attempt {} of {} failed: {}; retrying in {:?}",
                    attempt,
                    describe(node),
                    error,
                    delay
                );
                self.emit(
                    emit,
                    WorkflowEvent::TaskRetry {
                        task_id: node.id.clone(),
                        execution_id: execution_id.clone(),
                        attempt,
                        error: error.to_string(),
                    },
                );
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.scope.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                delay = Duration::try_from_secs_f64(delay.as_secs_f64() * policy.backoff)
                    .unwrap_or(delay);
                continue;
            }

            if error.is_cancelled() {
                return Err(error);
            }
            self.emit(
                emit,
                WorkflowEvent::TaskFailed {
                    task_id: node.id.clone(),
                    task_name: task_name.clone(),
                    execution_id: execution_id.clone(),
                    error: error.to_string(),
                },
            );
            if !error.is_retryable() {
                return Err(error);
            }
            let message = match error {
                EngineError::ExecutionFailed(message) => message,
                other => other.to_string(),
            };
            return Err(EngineError::ExecutionFailure {
                node: describe(node),
                task: task_name,
                attempts: attempt,
                message,
            });
        };

        if let (Some(cache), Some(inputs), Outcome::Value(value)) = (&node.cache, &inputs, &outcome) {
            cache.save(&node.id, inputs, value).await?;
        }
        self.emit(
            emit,
            WorkflowEvent::TaskCompleted {
                task_id: node.id.clone(),
                task_name,
                execution_id: execution_id.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(outcome)
    }
}

/// Zip equal-length mapped lists into per-item keyword arguments
fn zip_mapped(node: &Node, mapped: BTreeMap<String, Value>) -> Result<Vec<BTreeMap<String, Value>>> {
    let invalid = |detail: String| EngineError::InvalidMapInputs {
        node: describe(node),
        detail,
    };
    if mapped.is_empty() {
        return Err(invalid("no mapped inputs".to_string()));
    }

    let mut lists = Vec::with_capacity(mapped.len());
    for (name, value) in mapped {
        match value {
            Value::Array(items) => lists.push((name, items)),
            other => return Err(invalid(format!("'{}' is not a list: {}", name, other))),
        }
    }
    let len = lists[0].1.len();
    if let Some((name, items)) = lists.iter().find(|(_, items)| items.len() != len) {
        return Err(invalid(format!(
            "'{}' has {} items, '{}' has {}",
            name,
            items.len(),
            lists[0].0,
            len
        )));
    }

    let mut per_item: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new(); len];
    for (name, items) in lists {
        for (slot, item) in per_item.iter_mut().zip(items) {
            slot.insert(name.clone(), item);
        }
    }
    Ok(per_item)
}
