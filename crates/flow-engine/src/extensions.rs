//! Typed extension map for non-serializable dependency injection.
//!
//! `Extensions` lets hosts register runtime objects (API clients, database
//! handles, etc.) under a name. Arguments built with `Arg::inject(name)` are
//! resolved from this map when a node runs and reach the task through
//! `TaskArgs::object`.
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::Extensions;
//!
//! let mut ext = Extensions::new();
//! ext.insert("db", MyPool::new());
//!
//! // In a task body:
//! let db = args.object::<MyPool>("0").unwrap();
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Named map of injectable runtime objects
#[derive(Clone, Default)]
pub struct Extensions {
    inner: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create an empty extension map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a typed value under the given name, replacing any previous one.
    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.inner.insert(name.into(), Arc::new(value));
    }

    /// Insert an already shared value.
    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: Arc<T>) {
        self.inner.insert(name.into(), value);
    }

    /// Get a typed value by name.
    ///
    /// Returns `None` if the name doesn't exist or the type doesn't match.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.inner
            .get(name)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub(crate) fn get_any(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.inner.keys().collect();
        names.sort();
        f.debug_struct("Extensions").field("names", &names).finish()
    }
}
