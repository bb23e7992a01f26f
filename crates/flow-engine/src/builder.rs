//! Graph builder: invocation tree → deduplicated DAG
//!
//! The builder walks the handle tree in post-order with an explicit stack,
//! hashes each handle once all of its dependencies are hashed, interns the
//! resulting node through the shared registry and adds the node's input
//! edges to the graph. Building the same shape twice against one registry
//! yields the identical `Arc<Node>` objects.

use std::collections::HashMap;
use std::sync::Arc;

use crate::call::{CallId, LazyCall};
use crate::error::{EngineError, Result};
use crate::hashing::{self, NodeHashes};
use crate::recursion::RecursionAnalyzer;
use crate::registry::NodeRegistry;
use crate::types::{Edge, EdgeKind, Graph, Node};

pub struct GraphBuilder {
    registry: Arc<NodeRegistry>,
    analyzer: Arc<RecursionAnalyzer>,
}

impl GraphBuilder {
    pub fn new(registry: Arc<NodeRegistry>, analyzer: Arc<RecursionAnalyzer>) -> Self {
        Self { registry, analyzer }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn analyzer(&self) -> &Arc<RecursionAnalyzer> {
        &self.analyzer
    }

    /// Intern the node of a call that references no other handle
    pub fn intern_plain(&self, call: &LazyCall) -> Result<Arc<Node>> {
        if !call.is_plain() {
            return Err(EngineError::InvalidGraph(format!(
                "{:?} references other handles",
                call
            )));
        }
        if let Some(task) = call.task() {
            self.analyzer.observe(task);
        }
        let deps = HashMap::new();
        let node_hashes = hashing::hash_call(call, &deps)?;
        let (node, _) = self.registry.get_or_create(&node_hashes.structural, || {
            Node::from_call(call, node_hashes.clone(), &deps)
        })?;
        Ok(node)
    }

    /// Build the graph of everything `target` transitively depends on
    pub fn build(&self, target: &LazyCall) -> Result<Graph> {
        let mut graph = Graph::new();
        let mut hashes: HashMap<CallId, NodeHashes> = HashMap::new();
        let mut stack: Vec<(LazyCall, bool)> = vec![(target.clone(), false)];
        let mut created = 0usize;

        while let Some((call, expanded)) = stack.pop() {
            if hashes.contains_key(&call.id()) {
                continue;
            }
            if !expanded {
                stack.push((call.clone(), true));
                let mut children = Vec::new();
                call.for_each_child(&mut |child| {
                    if !hashes.contains_key(&child.id()) {
                        children.push(child.clone());
                    }
                });
                // Reversed so children are finished in argument order.
                stack.extend(children.into_iter().rev().map(|c| (c, false)));
                continue;
            }

            if let Some(task) = call.task() {
                self.analyzer.observe(task);
            }
            let node_hashes = hashing::hash_call(&call, &hashes)?;
            let (node, is_new) = self.registry.get_or_create(&node_hashes.structural, || {
                Node::from_call(&call, node_hashes.clone(), &hashes)
            })?;
            if is_new {
                created += 1;
            }
            graph.add_node(Arc::clone(&node))?;
            graph.map_instance(call.id(), node.id.clone());
            hashes.insert(call.id(), node_hashes);
        }

        let target_id = graph
            .instance_map()
            .get(&target.id())
            .cloned()
            .unwrap_or_default();
        graph.set_target(target_id);
        self.tag_cycles(&mut graph)?;

        log::debug!(
            "Built graph for {:?}: {} nodes ({} new), {} edges",
            target,
            graph.len(),
            created,
            graph.edges().len()
        );
        Ok(graph)
    }

    /// Tag nodes of recursive tasks and add diagnostic POTENTIAL edges
    fn tag_cycles(&self, graph: &mut Graph) -> Result<()> {
        let mut members: Vec<(String, String, usize)> = Vec::new();
        for node in graph.nodes() {
            if let Some(name) = node.task_name() {
                if let Some(cycle) = self.analyzer.cycle_of(name) {
                    members.push((node.id.clone(), name.to_string(), cycle));
                }
            }
        }

        for (id, _, cycle) in &members {
            graph.set_cycle(id.clone(), *cycle);
        }

        for (from_id, from_task, from_cycle) in &members {
            for (to_id, to_task, to_cycle) in &members {
                if from_id == to_id || from_cycle != to_cycle {
                    continue;
                }
                if self.analyzer.declares(from_task, to_task) {
                    graph.add_edge(Edge {
                        source: from_id.clone(),
                        target: to_id.clone(),
                        kind: EdgeKind::Potential,
                        path: format!("tail:{}", to_task),
                        route_key: None,
                        router: None,
                    })?;
                }
            }
        }
        Ok(())
    }
}
