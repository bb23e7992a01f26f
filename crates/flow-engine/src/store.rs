//! Result store interface and the in-memory implementation
//!
//! The trampoline clears the store between generations, so a long recursion
//! keeps only one generation's results alive.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;

/// Where node results and skip decisions are kept during a run
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn has_result(&self, node_id: &str) -> Result<bool>;

    async fn get_result(&self, node_id: &str) -> Result<Option<Value>>;

    async fn put_result(&self, node_id: &str, value: Value) -> Result<()>;

    async fn mark_skipped(&self, node_id: &str, reason: &str) -> Result<()>;

    async fn get_skip_reason(&self, node_id: &str) -> Result<Option<String>>;

    /// Drop everything (called between trampoline generations)
    async fn clear(&self) -> Result<()>;

    /// Number of stored results and skip records
    async fn len(&self) -> Result<usize>;
}

/// Concurrent in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    results: DashMap<String, Value>,
    skipped: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn has_result(&self, node_id: &str) -> Result<bool> {
        Ok(self.results.contains_key(node_id))
    }

    async fn get_result(&self, node_id: &str) -> Result<Option<Value>> {
        Ok(self.results.get(node_id).map(|v| v.value().clone()))
    }

    async fn put_result(&self, node_id: &str, value: Value) -> Result<()> {
        self.results.insert(node_id.to_string(), value);
        Ok(())
    }

    async fn mark_skipped(&self, node_id: &str, reason: &str) -> Result<()> {
        self.skipped.insert(node_id.to_string(), reason.to_string());
        Ok(())
    }

    async fn get_skip_reason(&self, node_id: &str) -> Result<Option<String>> {
        Ok(self.skipped.get(node_id).map(|r| r.value().clone()))
    }

    async fn clear(&self) -> Result<()> {
        self.results.clear();
        self.skipped.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.results.len() + self.skipped.len())
    }
}
