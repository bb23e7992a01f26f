//! Configuration types for the engine

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default configuration values
pub mod defaults {
    /// Topic prefix for constraint control messages
    pub const CONSTRAINT_TOPIC: &str = "flow/constraints";
    /// Margin added to the expiry wake-up so the sweep lands after the deadline
    pub const EXPIRY_MARGIN_MS: u64 = 10;
    /// Node assignments the resource-aware solver may try before falling back
    pub const SOLVER_SEARCH_BUDGET: u64 = 100_000;
}

/// Which execution strategy drives a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Build/solve/execute per generation, with plan caching
    #[default]
    Graph,
    /// Compile once into register instructions, then interpret
    Vm,
}

/// Which solver orders graph nodes into stages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Layered topological sort
    #[default]
    Layered,
    /// Minimal stage count under static resource capacities
    ResourceAware,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: StrategyKind,
    pub solver: SolverKind,
    /// Initial named resource capacities
    pub capacities: BTreeMap<String, u64>,
    /// The engine subscribes to `<constraint_topic>/#`
    pub constraint_topic: String,
    /// Upper bound on trampoline generations (unbounded when `None`)
    pub max_generations: Option<u64>,
    pub expiry_margin_ms: u64,
    /// Reuse stage plans across generations sharing a template hash
    pub plan_cache: bool,
    /// Bypass the scheduler for plain self-recursive tail calls
    pub hot_path: bool,
    pub solver_search_budget: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            solver: SolverKind::default(),
            capacities: BTreeMap::new(),
            constraint_topic: defaults::CONSTRAINT_TOPIC.to_string(),
            max_generations: None,
            expiry_margin_ms: defaults::EXPIRY_MARGIN_MS,
            plan_cache: true,
            hot_path: true,
            solver_search_budget: defaults::SOLVER_SEARCH_BUDGET,
        }
    }
}

impl EngineConfig {
    /// Load a configuration document; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_capacity(mut self, name: impl Into<String>, capacity: u64) -> Self {
        self.capacities.insert(name.into(), capacity);
        self
    }

    pub fn with_constraint_topic(mut self, topic: impl Into<String>) -> Self {
        self.constraint_topic = topic.into();
        self
    }

    pub fn with_max_generations(mut self, limit: u64) -> Self {
        self.max_generations = Some(limit);
        self
    }

    pub fn with_plan_cache(mut self, enabled: bool) -> Self {
        self.plan_cache = enabled;
        self
    }

    pub fn with_hot_path(mut self, enabled: bool) -> Self {
        self.hot_path = enabled;
        self
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_millis(self.expiry_margin_ms)
    }

    /// Subscription pattern covering every scope under the constraint topic
    pub fn constraint_pattern(&self) -> String {
        format!("{}/#", self.constraint_topic.trim_end_matches('/'))
    }
}
