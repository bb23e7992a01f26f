//! Node, edge and graph model
//!
//! A [`Node`] is the canonical form of one distinct computation, keyed by its
//! structural hash and shared through the registry. A [`Graph`] is one
//! build's view: the nodes reachable from a target, the typed edges between
//! them, and the map from invocation handles to the nodes they collapsed onto.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::call::{self, Amount, Arg, CallId, CallKind, LazyCall, Opaque, RetryPolicy, TaskDef};
use crate::error::{EngineError, Result};
use crate::hashing::NodeHashes;

/// Unique identifier for a node (its structural hash)
pub type NodeId = String;

/// Route-table key used for a router's default branch
pub const DEFAULT_ROUTE: &str = "*default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Parameter,
    Map,
}

/// Edge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// Source value fills an argument
    Data,
    /// Source gates execution through its truthiness
    Condition,
    /// Source supplies a runtime resource amount
    Constraint,
    /// Ordering only
    Sequence,
    /// Source is one branch of a router
    RouterRoute,
    /// Source is a bound jump selector
    IterativeJump,
    /// Diagnostic: a call the two tasks may make to each other across generations
    Potential,
}

impl EdgeKind {
    /// Whether the solver orders the target after the source
    pub fn is_scheduling(self) -> bool {
        !matches!(self, Self::Potential)
    }
}

/// A router attached to one argument path of a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub selector: NodeId,
    pub routes: BTreeMap<String, NodeId>,
    pub default: Option<NodeId>,
}

impl RouterInfo {
    /// Branch chosen for a selector value
    pub fn select(&self, value: &Value) -> Option<&NodeId> {
        self.routes
            .get(&call::route_key(value))
            .or(self.default.as_ref())
    }

    /// All branch roots, including the default
    pub fn branches(&self) -> impl Iterator<Item = (&str, &NodeId)> {
        self.routes
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(self.default.iter().map(|d| (DEFAULT_ROUTE, d)))
    }
}

/// A directed, typed edge
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    /// Argument path the source fills (`"0"`, `"items[2]"`, `"condition"`, ...)
    pub path: String,
    /// Route key for `RouterRoute` edges
    pub route_key: Option<String>,
    /// Route table for router selector and branch edges
    pub router: Option<Arc<RouterInfo>>,
}

impl Edge {
    fn new(source: &str, target: &str, kind: EdgeKind, path: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            path: path.into(),
            route_key: None,
            router: None,
        }
    }
}

/// An input binding, mirroring an argument with handles replaced by node ids
#[derive(Debug, Clone)]
pub enum Binding {
    Literal(Value),
    Unserializable(&'static str),
    Node(NodeId),
    List(Vec<Binding>),
    Map(BTreeMap<String, Binding>),
    Router(Arc<RouterInfo>),
    Inject(String),
    Opaque(Opaque),
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Task {
        args: Vec<Binding>,
        kwargs: BTreeMap<String, Binding>,
    },
    Map {
        mapped: BTreeMap<String, Binding>,
        fixed: BTreeMap<String, Binding>,
    },
    Parameter {
        name: String,
        default: Option<Value>,
    },
}

/// Canonical, deduplicated computation
pub struct Node {
    pub id: NodeId,
    pub template_id: String,
    pub kind: NodeKind,
    pub task: Option<Arc<TaskDef>>,
    pub body: NodeBody,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<Arc<dyn CachePolicy>>,
    pub static_resources: BTreeMap<String, u64>,
    pub dynamic_resources: BTreeMap<String, NodeId>,
    pub condition: Option<NodeId>,
    pub after: Vec<NodeId>,
    pub jump: Option<NodeId>,
    /// Incoming edges, in argument order
    pub inputs: Vec<Edge>,
    pub has_injected: bool,
    pub has_complex_inputs: bool,
}

impl Node {
    /// Build the canonical node for `call`, whose dependencies are hashed in `deps`
    pub fn from_call(
        call: &LazyCall,
        hashes: NodeHashes,
        deps: &HashMap<CallId, NodeHashes>,
    ) -> Result<Self> {
        let id = hashes.structural;
        let mut lowering = Lowering {
            target: &id,
            deps,
            inputs: Vec::new(),
            has_injected: false,
            has_complex_inputs: false,
        };

        let (kind, task, body) = match call.kind() {
            CallKind::Task { task, args, kwargs } => {
                let args = args
                    .iter()
                    .enumerate()
                    .map(|(i, a)| lowering.bind(a, &i.to_string()))
                    .collect::<Result<Vec<_>>>()?;
                let kwargs = lowering.bind_map(kwargs, "")?;
                (
                    NodeKind::Task,
                    Some(Arc::clone(task)),
                    NodeBody::Task { args, kwargs },
                )
            }
            CallKind::Map {
                task,
                mapped,
                fixed,
            } => {
                let mapped = lowering.bind_map(mapped, "")?;
                let fixed = lowering.bind_map(fixed, "")?;
                lowering.has_complex_inputs = true;
                (
                    NodeKind::Map,
                    Some(Arc::clone(task)),
                    NodeBody::Map { mapped, fixed },
                )
            }
            CallKind::Parameter { name, default } => (
                NodeKind::Parameter,
                None,
                NodeBody::Parameter {
                    name: name.clone(),
                    default: default.clone(),
                },
            ),
        };

        let policy = call.policy();
        let mut static_resources = BTreeMap::new();
        let mut dynamic_resources = BTreeMap::new();
        for (name, amount) in &policy.resources {
            match amount {
                Amount::Static(n) => {
                    static_resources.insert(name.clone(), *n);
                }
                Amount::Dynamic(c) => {
                    let source = lowering.node_of(c)?;
                    lowering.edge(&source, EdgeKind::Constraint, format!("resource:{}", name));
                    dynamic_resources.insert(name.clone(), source);
                }
            }
        }
        let condition = match &policy.condition {
            Some(c) => {
                let source = lowering.node_of(c)?;
                lowering.edge(&source, EdgeKind::Condition, "condition");
                Some(source)
            }
            None => None,
        };
        let mut after = Vec::with_capacity(policy.after.len());
        for (i, c) in policy.after.iter().enumerate() {
            let source = lowering.node_of(c)?;
            lowering.edge(&source, EdgeKind::Sequence, format!("after[{}]", i));
            after.push(source);
        }
        let jump = match &policy.jump {
            Some(c) => {
                let source = lowering.node_of(c)?;
                lowering.edge(&source, EdgeKind::IterativeJump, "jump");
                Some(source)
            }
            None => None,
        };

        let Lowering {
            inputs,
            has_injected,
            has_complex_inputs,
            ..
        } = lowering;

        Ok(Self {
            id,
            template_id: hashes.template,
            kind,
            task,
            body,
            retry: policy.retry.clone(),
            cache: policy.cache.clone(),
            static_resources,
            dynamic_resources,
            condition,
            after,
            jump,
            inputs,
            has_injected,
            has_complex_inputs,
        })
    }

    /// Task name, or `param:<name>` for parameters
    pub fn label(&self) -> String {
        match (&self.task, &self.body) {
            (Some(task), _) => task.name().to_string(),
            (None, NodeBody::Parameter { name, .. }) => format!("param:{}", name),
            (None, _) => self.id.clone(),
        }
    }

    pub fn task_name(&self) -> Option<&str> {
        self.task.as_deref().map(TaskDef::name)
    }

    /// Short id for logs
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.short_id())
            .field("kind", &self.kind)
            .field("label", &self.label())
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

struct Lowering<'a> {
    target: &'a str,
    deps: &'a HashMap<CallId, NodeHashes>,
    inputs: Vec<Edge>,
    has_injected: bool,
    has_complex_inputs: bool,
}

impl Lowering<'_> {
    fn node_of(&self, call: &LazyCall) -> Result<NodeId> {
        self.deps
            .get(&call.id())
            .map(|h| h.structural.clone())
            .ok_or_else(|| {
                EngineError::InvalidGraph(format!("dependency {:?} has no node", call))
            })
    }

    fn edge(&mut self, source: &str, kind: EdgeKind, path: impl Into<String>) {
        self.inputs.push(Edge::new(source, self.target, kind, path));
    }

    fn bind_map(&mut self, entries: &BTreeMap<String, Arg>, parent: &str) -> Result<BTreeMap<String, Binding>> {
        entries
            .iter()
            .map(|(k, a)| {
                let path = if parent.is_empty() {
                    k.clone()
                } else {
                    call::key_path(parent, k)
                };
                Ok((k.clone(), self.bind(a, &path)?))
            })
            .collect()
    }

    fn bind(&mut self, arg: &Arg, path: &str) -> Result<Binding> {
        Ok(match arg {
            Arg::Literal(v) => Binding::Literal(v.clone()),
            Arg::Unserializable(t) => Binding::Unserializable(*t),
            Arg::Call(c) => {
                let source = self.node_of(c)?;
                self.edge(&source, EdgeKind::Data, path);
                Binding::Node(source)
            }
            Arg::List(items) => {
                if arg.has_calls() {
                    self.has_complex_inputs = true;
                }
                Binding::List(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, a)| self.bind(a, &call::index_path(path, i)))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            Arg::Map(entries) => {
                if arg.has_calls() {
                    self.has_complex_inputs = true;
                }
                Binding::Map(self.bind_map(entries, path)?)
            }
            Arg::Router(router) => {
                self.has_complex_inputs = true;
                let info = Arc::new(RouterInfo {
                    selector: self.node_of(&router.selector)?,
                    routes: router
                        .routes
                        .iter()
                        .map(|(k, c)| Ok((k.clone(), self.node_of(c)?)))
                        .collect::<Result<_>>()?,
                    default: router.default.as_ref().map(|c| self.node_of(c)).transpose()?,
                });
                let mut selector = Edge::new(&info.selector, self.target, EdgeKind::Data, path);
                selector.router = Some(Arc::clone(&info));
                self.inputs.push(selector);
                for (key, source) in info.branches() {
                    let mut route = Edge::new(source, self.target, EdgeKind::RouterRoute, path);
                    route.route_key = Some(key.to_string());
                    route.router = Some(Arc::clone(&info));
                    self.inputs.push(route);
                }
                Binding::Router(info)
            }
            Arg::Inject(name) => {
                self.has_injected = true;
                Binding::Inject(name.clone())
            }
            Arg::Opaque(o) => {
                self.has_complex_inputs = true;
                Binding::Opaque(o.clone())
            }
        })
    }
}

/// One build's node and edge set
#[derive(Debug)]
pub struct Graph {
    /// Nodes in dependency-first order
    nodes: Vec<Arc<Node>>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    target: NodeId,
    instance_map: HashMap<CallId, NodeId>,
    cycles: HashMap<NodeId, usize>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            target: NodeId::new(),
            instance_map: HashMap::new(),
            cycles: HashMap::new(),
        }
    }

    /// Add a node and its input edges; returns false if it was already present
    pub(crate) fn add_node(&mut self, node: Arc<Node>) -> Result<bool> {
        if self.index.contains_key(&node.id) {
            return Ok(false);
        }
        if let Some(edge) = node.inputs.iter().find(|e| !self.index.contains_key(&e.source)) {
            return Err(EngineError::InvalidGraph(format!(
                "edge source {} is not in the graph",
                edge.source
            )));
        }
        let position = self.nodes.len();
        self.index.insert(node.id.clone(), position);
        self.incoming.push(Vec::new());
        self.outgoing.push(Vec::new());
        for edge in &node.inputs {
            self.add_edge(edge.clone())?;
        }
        self.nodes.push(node);
        Ok(true)
    }

    pub(crate) fn add_edge(&mut self, edge: Edge) -> Result<()> {
        let source = self.position(&edge.source).ok_or_else(|| {
            EngineError::InvalidGraph(format!("edge source {} is not in the graph", edge.source))
        })?;
        let target = self.position(&edge.target).ok_or_else(|| {
            EngineError::InvalidGraph(format!("edge target {} is not in the graph", edge.target))
        })?;
        let idx = self.edges.len();
        self.edges.push(edge);
        self.outgoing[source].push(idx);
        self.incoming[target].push(idx);
        Ok(())
    }

    pub(crate) fn map_instance(&mut self, call: CallId, node: NodeId) {
        self.instance_map.insert(call, node);
    }

    pub(crate) fn set_target(&mut self, target: NodeId) {
        self.target = target;
    }

    pub(crate) fn set_cycle(&mut self, node: NodeId, cycle: usize) {
        self.cycles.insert(node, cycle);
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_at(&self, position: usize) -> Option<&Arc<Node>> {
        self.nodes.get(position)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Get edges coming into a node
    pub fn in_edges<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.position(id)
            .map(|p| self.incoming[p].as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |&e| &self.edges[e])
    }

    /// Get edges going out of a node
    pub fn out_edges<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.position(id)
            .map(|p| self.outgoing[p].as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |&e| &self.edges[e])
    }

    /// Get the IDs of nodes that this node depends on (upstream nodes)
    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self
            .in_edges(id)
            .filter(|e| e.kind != EdgeKind::Potential)
            .map(|e| e.source.clone())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Get the IDs of nodes that depend on this node (downstream nodes)
    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self
            .out_edges(id)
            .filter(|e| e.kind != EdgeKind::Potential)
            .map(|e| e.target.clone())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Node a handle collapsed onto in this build
    pub fn node_for_call(&self, call: CallId) -> Option<&Arc<Node>> {
        self.instance_map.get(&call).and_then(|id| self.node(id))
    }

    pub fn instance_map(&self) -> &HashMap<CallId, NodeId> {
        &self.instance_map
    }

    /// Recursive cycle a node's task belongs to, if any
    pub fn cycle_of(&self, id: &str) -> Option<usize> {
        self.cycles.get(id).copied()
    }
}
