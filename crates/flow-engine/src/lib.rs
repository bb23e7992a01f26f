//! Flow Engine - deferred-computation workflows with live admission policies
//!
//! Tasks are invoked lazily: calling a task produces a [`LazyCall`] handle
//! instead of a value. Handles compose into an invocation tree that the
//! engine turns into a deduplicated graph, orders into concurrent stages and
//! executes. It supports:
//!
//! - Hash-consed nodes (structural and template fingerprints)
//! - Routers, conditions, ordering dependencies and fan-out
//! - Tail calls as a trampoline with bounded memory
//! - Named resources and live constraints (pause, concurrency, rate)
//!   fed from a pub/sub topic
//!
//! # Architecture
//!
//! - `GraphBuilder`: invocation tree → graph, nodes interned in `NodeRegistry`
//! - `Solver`: graph → stage plan (`LayeredSolver`, `ResourceAwareSolver`)
//! - `FlowManager`: skip and prune decisions for one graph
//! - `NodeProcessor`: admission, resources, cache and retries for one node
//! - `GraphStrategy` / `VmStrategy`: drive generations to a final value
//! - `Engine`: wires everything together
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{Engine, Outcome, TaskDef};
//! use std::sync::Arc;
//!
//! let add = Arc::new(TaskDef::new("add", |args| async move {
//!     Ok(Outcome::value(args.i64_arg(0)? + args.i64_arg(1)?))
//! }));
//! let engine = Engine::builder().build();
//! let three = engine.run(&add.apply([1, 2])).await?;
//! ```

pub mod builder;
pub mod cache;
pub mod call;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod extensions;
pub mod flow;
pub mod hashing;
pub mod processor;
pub mod pubsub;
pub mod recursion;
pub mod registry;
pub mod resources;
pub mod signal;
pub mod solver;
pub mod store;
pub mod strategy;
pub mod types;

// Re-export key types
pub use builder::GraphBuilder;
pub use cache::{CachePolicy, MemoryCache};
pub use call::{Amount, Arg, LazyCall, Outcome, RetryPolicy, Router, TaskArgs, TaskDef};
pub use config::{EngineConfig, SolverKind, StrategyKind};
pub use constraints::{Constraint, ConstraintHandler, ConstraintManager, ControlMessage};
pub use engine::{Engine, EngineBuilder, RunOptions};
pub use error::{EngineError, Result};
pub use events::{ChannelEventSink, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use executor::{Executor, LocalExecutor};
pub use extensions::Extensions;
pub use flow::{FlowManager, SkipReason};
pub use pubsub::{LocalBroker, PubSubConnector};
pub use resources::{ResourceGuard, ResourceManager};
pub use solver::{LayeredSolver, ResourceAwareSolver, Solver, StagePlan};
pub use store::{MemoryStore, ResultStore};
pub use strategy::{ExecutionStrategy, GraphStrategy, VmStrategy};
pub use types::{EdgeKind, Graph, Node, NodeId, NodeKind};
