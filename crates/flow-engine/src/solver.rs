//! Stage solvers: graph → ordered concurrent stages
//!
//! Every stage holds nodes whose scheduling predecessors all sit in earlier
//! stages. Scheduling predecessors are the sources of every non-POTENTIAL
//! edge, plus route gating: each node of a router branch that is not itself
//! upstream of the router's selector is ordered after the selector, so the
//! routing decision (and any pruning it triggers) is known before the branch
//! could start.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use crate::error::{EngineError, Result};
use crate::types::{EdgeKind, Graph};

/// Node positions grouped into stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stages: Vec<Vec<usize>>,
    pub node_count: usize,
    signature: u64,
}

impl StagePlan {
    fn new(graph: &Graph, stages: Vec<Vec<usize>>) -> Self {
        Self {
            stages,
            node_count: graph.len(),
            signature: shape_signature(graph),
        }
    }

    /// Whether this plan can be rehydrated by index against `graph`
    pub fn fits(&self, graph: &Graph) -> bool {
        self.node_count == graph.len() && self.signature == shape_signature(graph)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Order-sensitive fingerprint of node templates and edge positions
fn shape_signature(graph: &Graph) -> u64 {
    let mut hasher = DefaultHasher::new();
    for node in graph.nodes() {
        node.template_id.hash(&mut hasher);
    }
    for edge in graph.edges() {
        graph.position(&edge.source).hash(&mut hasher);
        graph.position(&edge.target).hash(&mut hasher);
        edge.kind.hash(&mut hasher);
    }
    hasher.finish()
}

/// Turns a graph into a stage plan
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, graph: &Graph) -> Result<StagePlan>;
}

/// Scheduling predecessors per node position, including route gating
pub(crate) fn scheduling_preds(graph: &Graph) -> Vec<Vec<usize>> {
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); graph.len()];
    let mut routers = Vec::new();

    for edge in graph.edges() {
        if !edge.kind.is_scheduling() {
            continue;
        }
        let (Some(src), Some(dst)) = (graph.position(&edge.source), graph.position(&edge.target))
        else {
            continue;
        };
        if !preds[dst].contains(&src) {
            preds[dst].push(src);
        }
        if edge.kind == EdgeKind::Data {
            if let Some(router) = &edge.router {
                routers.push(router.clone());
            }
        }
    }

    // Gating edges are added one router at a time against the augmented
    // predecessor sets, so a gate never closes a cycle.
    for router in routers {
        let Some(selector) = graph.position(&router.selector) else {
            continue;
        };
        let upstream = ancestors(&preds, selector);
        for (_, branch) in router.branches() {
            let Some(root) = graph.position(branch) else {
                continue;
            };
            let mut closure = ancestors(&preds, root);
            closure.insert(root);
            for node in closure {
                if node != selector && !upstream.contains(&node) && !preds[node].contains(&selector) {
                    preds[node].push(selector);
                }
            }
        }
    }
    preds
}

fn ancestors(preds: &[Vec<usize>], start: usize) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<usize> = preds[start].iter().copied().collect();
    while let Some(n) = queue.pop_front() {
        if seen.insert(n) {
            queue.extend(preds[n].iter().copied());
        }
    }
    seen
}

/// Deterministic in-stage order: task name, then node id
fn sort_stage(graph: &Graph, stage: &mut [usize]) {
    stage.sort_by_cached_key(|&p| {
        graph
            .node_at(p)
            .map(|n| (n.label(), n.id.clone()))
            .unwrap_or_default()
    });
}

/// Layer index of every node (longest path from a source)
fn layers(graph: &Graph, preds: &[Vec<usize>]) -> Result<Vec<usize>> {
    let n = graph.len();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for (dst, ps) in preds.iter().enumerate() {
        in_degree[dst] = ps.len();
        for &src in ps {
            succs[src].push(dst);
        }
    }

    let mut layer = vec![0usize; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &succs[node] {
            layer[next] = layer[next].max(layer[node] + 1);
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        return Err(EngineError::InvalidGraph(
            "cycle detected while ordering stages".to_string(),
        ));
    }
    Ok(layer)
}

fn group_stages(graph: &Graph, assignment: &[usize]) -> Vec<Vec<usize>> {
    let mut by_stage: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (pos, &stage) in assignment.iter().enumerate() {
        by_stage.entry(stage).or_default().push(pos);
    }
    by_stage
        .into_values()
        .map(|mut stage| {
            sort_stage(graph, &mut stage);
            stage
        })
        .collect()
}

/// Layered topological sort
#[derive(Debug, Default, Clone)]
pub struct LayeredSolver;

impl Solver for LayeredSolver {
    fn name(&self) -> &'static str {
        "layered"
    }

    fn resolve(&self, graph: &Graph) -> Result<StagePlan> {
        let preds = scheduling_preds(graph);
        let layer = layers(graph, &preds)?;
        Ok(StagePlan::new(graph, group_stages(graph, &layer)))
    }
}

/// Minimal stage count subject to per-stage static resource capacities.
///
/// Resources without a configured capacity are unlimited. Dynamic amounts
/// cost nothing here; they are enforced when the node runs.
#[derive(Debug, Clone)]
pub struct ResourceAwareSolver {
    capacities: BTreeMap<String, u64>,
    budget: u64,
}

impl ResourceAwareSolver {
    pub fn new(capacities: BTreeMap<String, u64>, budget: u64) -> Self {
        Self { capacities, budget }
    }

    /// Capacity-limited requirements per node, clamped to capacity
    fn requirements(&self, graph: &Graph) -> Vec<Vec<(usize, u64)>> {
        let names: Vec<&String> = self.capacities.keys().collect();
        graph
            .nodes()
            .iter()
            .map(|node| {
                node.static_resources
                    .iter()
                    .filter_map(|(name, &amount)| {
                        let slot = names.iter().position(|n| *n == name)?;
                        let cap = self.capacities[name];
                        if amount > cap {
                            log::warn!(
                                "Node {} needs {} of '{}' but capacity is {}; clamping",
                                node.short_id(),
                                amount,
                                name,
                                cap
                            );
                        }
                        Some((slot, amount.min(cap)))
                    })
                    .collect()
            })
            .collect()
    }
}

struct Search<'a> {
    order: &'a [usize],
    preds: &'a [Vec<usize>],
    tail: &'a [usize],
    reqs: &'a [Vec<(usize, u64)>],
    caps: Vec<u64>,
    stages: usize,
    usage: Vec<Vec<u64>>,
    assignment: Vec<Option<usize>>,
    steps: u64,
    budget: u64,
}

enum SearchOutcome {
    Found,
    Infeasible,
    BudgetExhausted,
}

impl Search<'_> {
    fn assign(&mut self, i: usize) -> SearchOutcome {
        if i == self.order.len() {
            return SearchOutcome::Found;
        }
        let node = self.order[i];
        let earliest = self.preds[node]
            .iter()
            .filter_map(|&p| self.assignment[p])
            .map(|s| s + 1)
            .max()
            .unwrap_or(0);
        let Some(latest) = self.stages.checked_sub(1 + self.tail[node]) else {
            return SearchOutcome::Infeasible;
        };

        for stage in earliest..=latest {
            self.steps += 1;
            if self.steps > self.budget {
                return SearchOutcome::BudgetExhausted;
            }
            let fits = self.reqs[node]
                .iter()
                .all(|&(slot, amount)| self.usage[stage][slot] + amount <= self.caps[slot]);
            if !fits {
                continue;
            }
            for &(slot, amount) in &self.reqs[node] {
                self.usage[stage][slot] += amount;
            }
            self.assignment[node] = Some(stage);
            match self.assign(i + 1) {
                SearchOutcome::Found => return SearchOutcome::Found,
                SearchOutcome::BudgetExhausted => return SearchOutcome::BudgetExhausted,
                SearchOutcome::Infeasible => {}
            }
            self.assignment[node] = None;
            for &(slot, amount) in &self.reqs[node] {
                self.usage[stage][slot] -= amount;
            }
        }
        SearchOutcome::Infeasible
    }
}

impl Solver for ResourceAwareSolver {
    fn name(&self) -> &'static str {
        "resource_aware"
    }

    fn resolve(&self, graph: &Graph) -> Result<StagePlan> {
        let n = graph.len();
        let preds = scheduling_preds(graph);
        let layer = layers(graph, &preds)?;

        // Longest path to a sink, for the latest feasible stage of each node.
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (dst, ps) in preds.iter().enumerate() {
            for &src in ps {
                succs[src].push(dst);
            }
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&p| (layer[p], p));
        let mut tail = vec![0usize; n];
        for &node in order.iter().rev() {
            tail[node] = succs[node].iter().map(|&s| tail[s] + 1).max().unwrap_or(0);
        }

        let reqs = self.requirements(graph);
        let caps: Vec<u64> = self.capacities.values().copied().collect();
        let min_stages = layer.iter().map(|l| l + 1).max().unwrap_or(0);
        let mut steps = 0u64;

        for stages in min_stages..=n {
            let mut search = Search {
                order: &order,
                preds: &preds,
                tail: &tail,
                reqs: &reqs,
                caps: caps.clone(),
                stages,
                usage: vec![vec![0; caps.len()]; stages],
                assignment: vec![None; n],
                steps,
                budget: self.budget,
            };
            match search.assign(0) {
                SearchOutcome::Found => {
                    let assignment: Vec<usize> =
                        search.assignment.iter().map(|s| s.unwrap_or(0)).collect();
                    log::debug!(
                        "Resource-aware solver placed {} nodes in {} stages ({} steps)",
                        n,
                        stages,
                        search.steps
                    );
                    return Ok(StagePlan::new(graph, group_stages(graph, &assignment)));
                }
                SearchOutcome::BudgetExhausted => break,
                SearchOutcome::Infeasible => steps = search.steps,
            }
        }

        log::warn!(
            "Resource-aware solver gave up on a {}-node graph; falling back to layered order",
            n
        );
        LayeredSolver.resolve(graph)
    }
}
