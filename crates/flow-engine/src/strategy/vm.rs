//! VM strategy: compiled blueprints over indexed registers
//!
//! The first handle of a given task is compiled into a blueprint: one
//! register per node, the registers of its parameter inputs and a flat list
//! of call instructions in dependency order, each reading its operands from
//! earlier registers and writing one output register.
//!
//! Later handles (typically tail calls) are matched against the blueprint
//! by walking their call tree; their literal arguments and static resource
//! amounts are loaded as per-register inputs. The graph is only built again
//! when a handle does not fit.
//!
//! A tail call into the same blueprint clears and reuses the current frame;
//! a tail call into another blueprint starts a fresh frame.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::binding::{bind_call, post_order};
use super::{ExecutionStrategy, RunContext, Step};
use crate::call::{CallId, LazyCall, Outcome};
use crate::error::{EngineError, Result};
use crate::processor::BoundInputs;
use crate::types::{Binding, EdgeKind, Graph, Node, NodeBody, NodeId, NodeKind};

#[derive(Debug)]
struct Instruction {
    output: usize,
    operands: Vec<usize>,
}

#[derive(Debug)]
struct Blueprint {
    /// Compiled node per register
    nodes: Vec<Arc<Node>>,
    /// Register of each handle of the compiled call tree, in post-order
    visits: Vec<usize>,
    inputs: Vec<usize>,
    instructions: Vec<Instruction>,
    result: usize,
}

/// Name of a construct the vm cannot compile
fn unsupported(binding: &Binding) -> Option<&'static str> {
    match binding {
        Binding::Router(_) => Some("a router"),
        Binding::Opaque(_) => Some("an opaque argument"),
        Binding::List(items) => items.iter().find_map(unsupported),
        Binding::Map(entries) => entries.values().find_map(unsupported),
        _ => None,
    }
}

fn reject(node: &Node, construct: &str) -> EngineError {
    EngineError::Unsupported(format!(
        "{} uses {}, which the vm strategy cannot compile; use the graph strategy",
        node.label(),
        construct
    ))
}

impl Blueprint {
    fn compile(graph: &Graph, target: &LazyCall) -> Result<Self> {
        let mut inputs = Vec::new();
        let mut instructions = Vec::new();

        for (register, node) in graph.nodes().iter().enumerate() {
            if node.kind == NodeKind::Map {
                return Err(reject(node, "a fan-out"));
            }
            if node.condition.is_some() {
                return Err(reject(node, "a condition"));
            }
            if !node.after.is_empty() {
                return Err(reject(node, "a sequence dependency"));
            }
            if node.jump.is_some() {
                return Err(reject(node, "a jump binding"));
            }
            if !node.dynamic_resources.is_empty() {
                return Err(reject(node, "a dynamic resource amount"));
            }
            match &node.body {
                NodeBody::Parameter { .. } => {
                    inputs.push(register);
                    continue;
                }
                NodeBody::Task { args, kwargs } => {
                    if let Some(construct) = args.iter().chain(kwargs.values()).find_map(unsupported) {
                        return Err(reject(node, construct));
                    }
                }
                NodeBody::Map { .. } => return Err(reject(node, "a fan-out")),
            }

            let mut operands = BTreeSet::new();
            for edge in &node.inputs {
                if edge.kind != EdgeKind::Data {
                    return Err(reject(node, "a non-data input"));
                }
                let source = graph.position(&edge.source).ok_or_else(|| {
                    EngineError::InvalidGraph(format!("operand {} is not in the graph", edge.source))
                })?;
                operands.insert(source);
            }
            instructions.push(Instruction {
                output: register,
                operands: operands.into_iter().collect(),
            });
        }

        let visits = post_order(target)
            .iter()
            .map(|call| {
                graph
                    .instance_map()
                    .get(&call.id())
                    .and_then(|id| graph.position(id))
                    .ok_or_else(|| {
                        EngineError::InvalidGraph(format!("{:?} is not in the graph", call))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let result = graph
            .position(graph.target())
            .ok_or_else(|| EngineError::InvalidGraph("graph has no target".to_string()))?;
        Ok(Self {
            nodes: graph.nodes().to_vec(),
            visits,
            inputs,
            instructions,
            result,
        })
    }

    /// Per-register inputs of `target`, if it fits this blueprint.
    ///
    /// Handles that collapsed onto one register when compiled must bind
    /// identical inputs.
    fn load(&self, target: &LazyCall) -> Option<Vec<BoundInputs>> {
        let calls = post_order(target);
        if calls.len() != self.visits.len() {
            return None;
        }
        let mut deps: HashMap<CallId, NodeId> = HashMap::with_capacity(calls.len());
        let mut bound: Vec<Option<BoundInputs>> = vec![None; self.nodes.len()];
        for (call, &register) in calls.iter().zip(&self.visits) {
            let node = &self.nodes[register];
            let inputs = bind_call(call, node, &deps)?;
            match &bound[register] {
                Some(existing) if *existing != inputs => return None,
                Some(_) => {}
                None => bound[register] = Some(inputs),
            }
            deps.insert(call.id(), node.id.clone());
        }
        if deps.get(&target.id()) != Some(&self.nodes[self.result].id) {
            return None;
        }
        bound.into_iter().collect()
    }
}

struct Frame {
    blueprint: Arc<Blueprint>,
    registers: Vec<Option<Value>>,
}

impl Frame {
    fn new(blueprint: Arc<Blueprint>) -> Self {
        let registers = vec![None; blueprint.nodes.len()];
        Self {
            blueprint,
            registers,
        }
    }

    fn reset(&mut self) {
        self.registers.iter_mut().for_each(|r| *r = None);
    }
}

#[derive(Default)]
pub struct VmStrategy {
    blueprints: DashMap<String, Arc<Blueprint>>,
}

impl VmStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compiled blueprints
    pub fn compiled(&self) -> usize {
        self.blueprints.len()
    }

    /// Compiled blueprint `target` fits, with its loaded inputs
    fn cached(&self, target: &LazyCall) -> Option<(Arc<Blueprint>, Vec<BoundInputs>)> {
        let blueprint = self
            .blueprints
            .get(&target.label())
            .map(|b| Arc::clone(b.value()))?;
        let bound = blueprint.load(target)?;
        Some((blueprint, bound))
    }

    /// Compile `graph`, built from `target`, and keep it for later handles
    fn install(&self, graph: &Graph, target: &LazyCall) -> Result<(Arc<Blueprint>, Vec<BoundInputs>)> {
        let blueprint = Arc::new(Blueprint::compile(graph, target)?);
        let bound = blueprint.load(target).ok_or_else(|| {
            EngineError::InvalidGraph(format!("{:?} does not fit its own blueprint", target))
        })?;
        log::debug!(
            "Compiled blueprint for {}: {} inputs, {} instructions",
            target.label(),
            blueprint.inputs.len(),
            blueprint.instructions.len()
        );
        self.blueprints.insert(target.label(), Arc::clone(&blueprint));
        Ok((blueprint, bound))
    }

    async fn interpret(&self, ctx: &RunContext, frame: &mut Frame, bound: &[BoundInputs]) -> Result<Step> {
        let blueprint = Arc::clone(&frame.blueprint);
        let none = HashMap::new();
        for &register in &blueprint.inputs {
            let node = &blueprint.nodes[register];
            frame.registers[register] = ctx
                .processor
                .execute_bound(node, &none, &bound[register], true)
                .await?
                .into_value();
        }

        for instruction in &blueprint.instructions {
            let node = &blueprint.nodes[instruction.output];
            let mut operands = HashMap::with_capacity(instruction.operands.len());
            for &register in &instruction.operands {
                if let Some(value) = &frame.registers[register] {
                    operands.insert(blueprint.nodes[register].id.clone(), value.clone());
                }
            }
            let outcome = ctx
                .processor
                .execute_bound(node, &operands, &bound[instruction.output], true)
                .await?;
            match outcome {
                Outcome::Value(value) => frame.registers[instruction.output] = Some(value),
                Outcome::TailCall(next) if instruction.output == blueprint.result => {
                    return Ok(Step::Next(next))
                }
                Outcome::TailCall(next) => {
                    return Err(EngineError::Unsupported(format!(
                        "{} returned {:?} but only the generation target may tail call",
                        node.label(),
                        next
                    )))
                }
            }
        }
        Ok(Step::Done(
            frame.registers[blueprint.result].take().unwrap_or(Value::Null),
        ))
    }
}

#[async_trait]
impl ExecutionStrategy for VmStrategy {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn run(&self, ctx: &RunContext, target: LazyCall) -> Result<Value> {
        let mut target = target;
        let mut frame: Option<Frame> = None;
        loop {
            let generation = ctx.next_generation().await?;
            ctx.generation_started(generation, &target);
            let (blueprint, bound) = match self.cached(&target) {
                Some(hit) => hit,
                None => self.install(&ctx.builder.build(&target)?, &target)?,
            };

            let mut current = match frame.take() {
                Some(mut f) if Arc::ptr_eq(&f.blueprint, &blueprint) => {
                    f.reset();
                    f
                }
                _ => Frame::new(blueprint),
            };
            let step = self.interpret(ctx, &mut current, &bound).await?;
            frame = Some(current);
            match step {
                Step::Done(value) => return Ok(value),
                Step::Next(next) => target = next,
            }
        }
    }
}
