//! Matching handles against already compiled nodes
//!
//! A handle fits a compiled node when it calls the same task with the same
//! argument skeleton and the same policies. Only literal values and static
//! resource amounts may differ; those become the handle's bound inputs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::call::{Amount, Arg, CallId, CallKind, LazyCall};
use crate::processor::BoundInputs;
use crate::types::{Binding, Node, NodeBody, NodeId};

/// Handles reachable from `target`, dependencies first, each handle once.
///
/// Visits in the same order as the graph builder.
pub(crate) fn post_order(target: &LazyCall) -> Vec<LazyCall> {
    let mut order = Vec::new();
    let mut seen: HashSet<CallId> = HashSet::new();
    let mut stack: Vec<(LazyCall, bool)> = vec![(target.clone(), false)];

    while let Some((call, expanded)) = stack.pop() {
        if seen.contains(&call.id()) {
            continue;
        }
        if !expanded {
            stack.push((call.clone(), true));
            let mut children = Vec::new();
            call.for_each_child(&mut |child| {
                if !seen.contains(&child.id()) {
                    children.push(child.clone());
                }
            });
            stack.extend(children.into_iter().rev().map(|c| (c, false)));
            continue;
        }
        seen.insert(call.id());
        order.push(call);
    }
    order
}

/// Bound inputs of `call` if it fits `node`.
///
/// `deps` maps every already matched handle to the compiled node it stands
/// for; a handle argument fits only if it stands for the node the binding
/// names.
pub(crate) fn bind_call(
    call: &LazyCall,
    node: &Node,
    deps: &HashMap<CallId, NodeId>,
) -> Option<BoundInputs> {
    if call.label() != node.label() {
        return None;
    }
    let policy = call.policy();
    if policy.condition.is_some()
        || !policy.after.is_empty()
        || policy.jump.is_some()
        || policy.retry != node.retry
    {
        return None;
    }
    let same_cache = match (&policy.cache, &node.cache) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    };
    if !same_cache {
        return None;
    }

    let mut resources = BTreeMap::new();
    for (name, amount) in &policy.resources {
        match amount {
            Amount::Static(n) => {
                resources.insert(name.clone(), *n);
            }
            Amount::Dynamic(_) => return None,
        }
    }

    let mut literals = Vec::new();
    match (call.kind(), &node.body) {
        (
            CallKind::Task { args, kwargs, .. },
            NodeBody::Task {
                args: bound_args,
                kwargs: bound_kwargs,
            },
        ) => {
            if args.len() != bound_args.len() || !kwargs.keys().eq(bound_kwargs.keys()) {
                return None;
            }
            let pairs = args
                .iter()
                .zip(bound_args)
                .chain(kwargs.values().zip(bound_kwargs.values()));
            for (arg, binding) in pairs {
                bind_arg(arg, binding, deps, &mut literals)?;
            }
        }
        (
            CallKind::Parameter { name, default },
            NodeBody::Parameter {
                name: bound_name,
                default: bound_default,
            },
        ) => {
            if name != bound_name || default != bound_default {
                return None;
            }
        }
        _ => return None,
    }
    Some(BoundInputs {
        literals,
        resources,
    })
}

fn bind_arg(
    arg: &Arg,
    binding: &Binding,
    deps: &HashMap<CallId, NodeId>,
    literals: &mut Vec<Value>,
) -> Option<()> {
    match (arg, binding) {
        (Arg::Literal(value), Binding::Literal(_)) => literals.push(value.clone()),
        (Arg::Unserializable(_), Binding::Unserializable(_)) => {}
        (Arg::Call(call), Binding::Node(id)) => {
            if deps.get(&call.id()) != Some(id) {
                return None;
            }
        }
        (Arg::List(items), Binding::List(bound)) if items.len() == bound.len() => {
            for (item, binding) in items.iter().zip(bound) {
                bind_arg(item, binding, deps, literals)?;
            }
        }
        (Arg::Map(entries), Binding::Map(bound)) if entries.keys().eq(bound.keys()) => {
            for (entry, binding) in entries.values().zip(bound.values()) {
                bind_arg(entry, binding, deps, literals)?;
            }
        }
        (Arg::Inject(name), Binding::Inject(bound)) if name == bound => {}
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::call::{Outcome, RetryPolicy, TaskDef};
    use crate::recursion::RecursionAnalyzer;
    use crate::registry::NodeRegistry;
    use serde_json::json;

    fn task(name: &str) -> Arc<TaskDef> {
        Arc::new(TaskDef::new(name, |_args| async { Ok(Outcome::Value(Value::Null)) }))
    }

    fn node_of(call: &LazyCall) -> Arc<Node> {
        let graph = GraphBuilder::new(
            Arc::new(NodeRegistry::new()),
            Arc::new(RecursionAnalyzer::new()),
        )
        .build(call)
        .unwrap();
        Arc::clone(graph.node(graph.target()).unwrap())
    }

    #[test]
    fn test_post_order_visits_shared_handles_once() {
        let f = task("f");
        let leaf = f.apply([1]);
        let mid = f.call().arg(&leaf).build();
        let top = f.call().arg(&leaf).arg(&mid).build();
        let ids: Vec<CallId> = post_order(&top).iter().map(LazyCall::id).collect();
        assert_eq!(ids, vec![leaf.id(), mid.id(), top.id()]);
    }

    #[test]
    fn test_literals_are_extracted_in_resolution_order() {
        let f = task("f");
        let compiled = node_of(
            &f.call()
                .arg(1)
                .arg(Arg::List(vec![2.into(), 3.into()]))
                .kwarg("k", 4)
                .build(),
        );
        let other = f
            .call()
            .arg(10)
            .arg(Arg::List(vec![20.into(), 30.into()]))
            .kwarg("k", 40)
            .build()
            .with_resource("gpu", 2);

        let bound = bind_call(&other, &compiled, &HashMap::new()).unwrap();
        assert_eq!(bound.literals, vec![json!(10), json!(20), json!(30), json!(40)]);
        assert_eq!(bound.resources.get("gpu"), Some(&2));
    }

    #[test]
    fn test_shape_changes_do_not_fit() {
        let f = task("f");
        let compiled = node_of(&f.apply([1]));
        let none = HashMap::new();

        assert!(bind_call(&f.apply([1, 2]), &compiled, &none).is_none());
        assert!(bind_call(&task("g").apply([1]), &compiled, &none).is_none());
        assert!(bind_call(&f.call().arg(&f.apply([1])).build(), &compiled, &none).is_none());
        assert!(bind_call(&f.apply([1]).with_retry(RetryPolicy::new(3)), &compiled, &none).is_none());
        assert!(bind_call(&f.apply([1]).run_if(&f.apply([true])), &compiled, &none).is_none());
    }
}
