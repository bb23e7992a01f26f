//! Content-addressed result caching
//!
//! A cache policy is consulted with the node id and the node's resolved
//! inputs; a hit skips execution entirely.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;
use crate::hashing::hash_value;

#[async_trait]
pub trait CachePolicy: Send + Sync {
    /// Stable name; part of the node's identity
    fn name(&self) -> &str;

    async fn check(&self, node_id: &str, inputs: &Value) -> Result<Option<Value>>;

    async fn save(&self, node_id: &str, inputs: &Value, value: &Value) -> Result<()>;
}

/// In-memory cache keyed by `(node id, hash of inputs)`
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: DashMap<(String, String), Value>,
    hits: AtomicU64,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CachePolicy for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, node_id: &str, inputs: &Value) -> Result<Option<Value>> {
        let key = (node_id.to_string(), hash_value(inputs));
        let hit = self.entries.get(&key).map(|v| v.value().clone());
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    async fn save(&self, node_id: &str, inputs: &Value, value: &Value) -> Result<()> {
        self.entries
            .insert((node_id.to_string(), hash_value(inputs)), value.clone());
        Ok(())
    }
}
