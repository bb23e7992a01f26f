//! Hash-consing node registry
//!
//! Guarantees at most one [`Node`] per structural hash for the registry's
//! lifetime. Builds sharing a registry get the identical `Arc<Node>` for the
//! identical invocation shape.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{Node, NodeId};

/// Non-evicting structural-hash → node map
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(id).cloned()
    }

    /// Return the node for `id`, creating it with `factory` if absent.
    ///
    /// The boolean is true when this call created the node. The factory runs
    /// outside the lock; if two callers race, the first insert wins and the
    /// loser's node is dropped.
    pub fn get_or_create<F>(&self, id: &str, factory: F) -> Result<(Arc<Node>, bool)>
    where
        F: FnOnce() -> Result<Node>,
    {
        if let Some(node) = self.get(id) {
            return Ok((node, false));
        }
        let candidate = Arc::new(factory()?);
        let mut nodes = self.nodes.write();
        match nodes.get(id) {
            Some(existing) => Ok((Arc::clone(existing), false)),
            None => {
                nodes.insert(id.to_string(), Arc::clone(&candidate));
                Ok((candidate, true))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").field("nodes", &self.len()).finish()
    }
}
