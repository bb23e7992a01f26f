//! Per-build skip and prune decisions
//!
//! The flow manager answers "should this node run?" for one graph. Skip
//! priority is: an earlier skip or prune, then an unmet or false condition
//! (and skipped ordering dependencies), then skipped data sources that cannot
//! be read through.
//!
//! Pruning is reference counted. Every node starts with a demand equal to
//! its outgoing edges, plus one for the graph target. When a router's
//! selector resolves, each unselected branch root loses the demand of its
//! route edge; a node whose demand reaches zero is pruned and releases the
//! demand it placed on its own sources.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::types::{Edge, EdgeKind, Graph, NodeId};

/// Why a node was not executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No remaining consumer needs the node
    Pruned,
    /// The condition resolved to a falsy value
    ConditionFalse,
    /// The condition itself was skipped
    ConditionUnmet,
    /// A required source was skipped and could not be read through
    UpstreamSkipped(NodeId),
}

impl SkipReason {
    pub fn is_pruned(&self) -> bool {
        matches!(self, Self::Pruned)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pruned => write!(f, "Pruned"),
            Self::ConditionFalse => write!(f, "Condition false"),
            Self::ConditionUnmet => write!(f, "Condition unmet"),
            Self::UpstreamSkipped(id) => {
                write!(f, "Upstream skipped: {}", &id[..id.len().min(12)])
            }
        }
    }
}

/// Truthiness of a task value: null, false, zero, empty string/list/map are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Default)]
struct FlowState {
    demand: HashMap<NodeId, usize>,
    skipped: HashMap<NodeId, SkipReason>,
    resolved: HashSet<NodeId>,
    /// Values of condition sources and router selectors
    decisions: HashMap<NodeId, Value>,
    /// Edges whose unit of demand was already returned
    released: HashSet<EdgeKey>,
}

type EdgeKey = (NodeId, NodeId, EdgeKind, String);

fn edge_key(edge: &Edge) -> EdgeKey {
    (
        edge.source.clone(),
        edge.target.clone(),
        edge.kind,
        edge.path.clone(),
    )
}

/// Skip/prune bookkeeping for one graph
pub struct FlowManager {
    graph: Arc<Graph>,
    state: Mutex<FlowState>,
}

impl FlowManager {
    pub fn new(graph: Arc<Graph>) -> Self {
        let mut state = FlowState::default();
        for node in graph.nodes() {
            let fan_out = graph
                .out_edges(&node.id)
                .filter(|e| e.kind.is_scheduling())
                .count();
            state.demand.insert(node.id.clone(), fan_out);
        }
        if let Some(demand) = state.demand.get_mut(graph.target()) {
            *demand += 1;
        }
        Self {
            graph,
            state: Mutex::new(state),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Decide whether `id` should be skipped, recording the decision
    pub fn should_skip(&self, id: &str) -> Option<SkipReason> {
        let mut state = self.state.lock();
        if let Some(reason) = state.skipped.get(id) {
            return Some(reason.clone());
        }

        let reason = self.evaluate(&state, id)?;
        log::debug!("Skipping node {}: {}", &id[..id.len().min(12)], reason);
        state.skipped.insert(id.to_string(), reason.clone());
        Some(reason)
    }

    fn evaluate(&self, state: &FlowState, id: &str) -> Option<SkipReason> {
        for edge in self.graph.in_edges(id) {
            if edge.kind == EdgeKind::Condition {
                if state.skipped.contains_key(&edge.source) {
                    return Some(SkipReason::ConditionUnmet);
                }
                if let Some(value) = state.decisions.get(&edge.source) {
                    if !is_truthy(value) {
                        return Some(SkipReason::ConditionFalse);
                    }
                }
            }
        }
        for edge in self.graph.in_edges(id) {
            if edge.kind == EdgeKind::Sequence && state.skipped.contains_key(&edge.source) {
                return Some(SkipReason::UpstreamSkipped(edge.source.clone()));
            }
        }
        for edge in self.graph.in_edges(id) {
            let needed = match edge.kind {
                EdgeKind::Data | EdgeKind::Constraint | EdgeKind::IterativeJump => true,
                EdgeKind::RouterRoute => edge
                    .router
                    .as_ref()
                    .and_then(|r| state.decisions.get(&r.selector).and_then(|v| r.select(v)))
                    .is_some_and(|selected| *selected == edge.source),
                EdgeKind::Condition | EdgeKind::Sequence | EdgeKind::Potential => false,
            };
            if needed && Self::penetrate(&self.graph, state, &edge.source).is_none() {
                return Some(SkipReason::UpstreamSkipped(edge.source.clone()));
            }
        }
        None
    }

    /// Follow skipped nodes through their first DATA input to a resolved node
    fn penetrate(graph: &Graph, state: &FlowState, id: &str) -> Option<NodeId> {
        let mut current = id.to_string();
        loop {
            match state.skipped.get(&current) {
                None => return Some(current),
                Some(reason) if reason.is_pruned() => return None,
                Some(_) => {
                    let next = graph
                        .in_edges(&current)
                        .find(|e| e.kind == EdgeKind::Data)?
                        .source
                        .clone();
                    current = next;
                }
            }
        }
    }

    /// Node whose value stands in for `id`: itself, or what it reads through to
    pub fn resolve_source(&self, id: &str) -> Option<NodeId> {
        let state = self.state.lock();
        Self::penetrate(&self.graph, &state, id)
    }

    /// Record a node's value and apply any routing decision it drives
    pub fn register_result(&self, id: &str, value: &Value) {
        let mut state = self.state.lock();
        state.resolved.insert(id.to_string());

        let mut is_decision = false;
        let mut unselected: Vec<&Edge> = Vec::new();
        for edge in self.graph.out_edges(id) {
            match edge.kind {
                EdgeKind::Condition => is_decision = true,
                EdgeKind::Data => {
                    let Some(router) = edge.router.as_ref().filter(|r| r.selector == id) else {
                        continue;
                    };
                    is_decision = true;
                    let selected = router.select(value);
                    for route in self.graph.in_edges(&edge.target) {
                        let same_router = route
                            .router
                            .as_ref()
                            .is_some_and(|r| Arc::ptr_eq(r, router));
                        if route.kind == EdgeKind::RouterRoute
                            && same_router
                            && route.path == edge.path
                            && Some(&route.source) != selected
                        {
                            unselected.push(route);
                        }
                    }
                }
                _ => {}
            }
        }
        if is_decision {
            state.decisions.insert(id.to_string(), value.clone());
        }
        self.release(&mut state, unselected);
    }

    /// Return the demand each edge places on its source, pruning transitively
    /// at zero. An edge is released at most once.
    fn release<'a>(&'a self, state: &mut FlowState, edges: Vec<&'a Edge>) {
        let mut pending = edges;
        while let Some(edge) = pending.pop() {
            if !state.released.insert(edge_key(edge)) {
                continue;
            }
            let id = &edge.source;
            let Some(demand) = state.demand.get_mut(id) else {
                continue;
            };
            *demand = demand.saturating_sub(1);
            if *demand > 0 || state.resolved.contains(id) || state.skipped.contains_key(id) {
                continue;
            }
            log::debug!("Pruned node {}", &id[..id.len().min(12)]);
            state.skipped.insert(id.clone(), SkipReason::Pruned);
            pending.extend(
                self.graph
                    .in_edges(id)
                    .filter(|e| e.kind.is_scheduling()),
            );
        }
    }

    pub fn skip_reason(&self, id: &str) -> Option<SkipReason> {
        self.state.lock().skipped.get(id).cloned()
    }

    /// Remaining demand on a node
    pub fn demand(&self, id: &str) -> usize {
        self.state.lock().demand.get(id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::call::{LazyCall, Outcome, Router, TaskDef};
    use crate::recursion::RecursionAnalyzer;
    use crate::registry::NodeRegistry;
    use serde_json::json;

    fn task(name: &str) -> Arc<TaskDef> {
        Arc::new(TaskDef::new(name, |_args| async { Ok(Outcome::Value(Value::Null)) }))
    }

    fn build(target: &LazyCall) -> Arc<Graph> {
        Arc::new(
            GraphBuilder::new(
                Arc::new(NodeRegistry::new()),
                Arc::new(RecursionAnalyzer::new()),
            )
            .build(target)
            .unwrap(),
        )
    }

    fn id(graph: &Graph, call: &LazyCall) -> NodeId {
        graph.instance_map()[&call.id()].clone()
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_false_condition_skips() {
        let f = task("f");
        let cond = f.apply([0]);
        let gated = f.apply([1]).run_if(&cond);
        let graph = build(&gated);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &cond), &json!(false));
        assert_eq!(
            flow.should_skip(&id(&graph, &gated)),
            Some(SkipReason::ConditionFalse)
        );
        assert_eq!(SkipReason::ConditionFalse.to_string(), "Condition false");
    }

    #[test]
    fn test_router_prunes_transitively() {
        let f = task("f");
        let sel = f.apply(["a"]);
        let a = f.apply([1]);
        let b = f.apply([2]);
        let c = f.call().arg(&b).build();
        let consumer = f
            .call()
            .arg(Router::new(&sel).route("a", &a).route("c", &c))
            .build();
        let graph = build(&consumer);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &sel), &json!("a"));
        assert_eq!(flow.skip_reason(&id(&graph, &c)), Some(SkipReason::Pruned));
        assert_eq!(flow.skip_reason(&id(&graph, &b)), Some(SkipReason::Pruned));
        assert_eq!(flow.should_skip(&id(&graph, &a)), None);
        assert_eq!(flow.should_skip(&id(&graph, &consumer)), None);
    }

    #[test]
    fn test_shared_dependency_survives_pruning() {
        let f = task("f");
        let shared = f.apply([0]);
        let sel = f.apply(["a"]);
        let a = f.call().arg(&shared).arg(1).build();
        let b = f.call().arg(&shared).arg(2).build();
        let consumer = f
            .call()
            .arg(Router::new(&sel).route("a", &a).route("b", &b))
            .build();
        let graph = build(&consumer);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &sel), &json!("a"));
        assert_eq!(flow.skip_reason(&id(&graph, &b)), Some(SkipReason::Pruned));
        assert_eq!(flow.skip_reason(&id(&graph, &shared)), None);
        assert_eq!(flow.demand(&id(&graph, &shared)), 1);
    }

    #[test]
    fn test_data_penetration_through_skipped_node() {
        let f = task("f");
        let a = f.apply([1]);
        let never = f.apply([0]);
        let b = f.call().arg(&a).build().run_if(&never);
        let c = f.call().arg(&b).build();
        let graph = build(&c);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &a), &json!(1));
        flow.register_result(&id(&graph, &never), &json!(0));
        assert_eq!(
            flow.should_skip(&id(&graph, &b)),
            Some(SkipReason::ConditionFalse)
        );
        assert_eq!(flow.should_skip(&id(&graph, &c)), None);
        assert_eq!(flow.resolve_source(&id(&graph, &b)), Some(id(&graph, &a)));
    }

    #[test]
    fn test_skip_without_data_input_propagates() {
        let f = task("f");
        let never = f.apply([0]);
        let b = f.apply([5]).run_if(&never);
        let c = f.call().arg(&b).build();
        let graph = build(&c);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &never), &json!(false));
        assert!(flow.should_skip(&id(&graph, &b)).is_some());
        assert!(matches!(
            flow.should_skip(&id(&graph, &c)),
            Some(SkipReason::UpstreamSkipped(_))
        ));
    }

    #[test]
    fn test_nested_router_keeps_branch_with_other_consumer() {
        let f = task("f");
        let s1 = f.apply(["a"]);
        let s2 = f.call().arg(&s1).build();
        let a = f.apply(["A"]);
        let b = f.apply(["B"]);
        let z = f.apply(["Z"]);
        let x = f.call().arg(Router::new(&s1).route("a", &a).route("b", &b)).build();
        let u = f.call().arg(&b).build();
        let top = f
            .call()
            .arg(Router::new(&s2).route("x", &x).otherwise(&z))
            .arg(&u)
            .build();
        let graph = build(&top);
        let flow = FlowManager::new(Arc::clone(&graph));

        flow.register_result(&id(&graph, &s1), &json!("a"));
        assert_eq!(flow.demand(&id(&graph, &b)), 1);
        flow.register_result(&id(&graph, &s2), &json!("none"));

        assert_eq!(flow.skip_reason(&id(&graph, &x)), Some(SkipReason::Pruned));
        assert_eq!(flow.skip_reason(&id(&graph, &a)), Some(SkipReason::Pruned));
        assert_eq!(flow.skip_reason(&id(&graph, &b)), None);
        assert_eq!(flow.demand(&id(&graph, &b)), 1);
        assert_eq!(flow.should_skip(&id(&graph, &u)), None);
        assert_eq!(flow.should_skip(&id(&graph, &z)), None);
    }
}
