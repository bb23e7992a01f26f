//! Lazy invocation handles
//!
//! A [`LazyCall`] is an opaque, process-unique reference to "call task T with
//! these arguments". Arguments may themselves be other handles, forming a
//! tree that the graph builder later turns into a deduplicated DAG. Nothing
//! runs when a handle is created.
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{Outcome, TaskDef};
//! use std::sync::Arc;
//!
//! let add = Arc::new(TaskDef::new("add", |args| async move {
//!     Ok(Outcome::value(args.i64_arg(0)? + args.i64_arg(1)?))
//! }));
//!
//! let one_plus_two = add.apply([1, 2]);
//! let nested = add.call().arg(&one_plus_two).arg(10).build();
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::error::{EngineError, Result};

/// Process-unique identifier of an invocation handle
pub type CallId = u64;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

fn next_call_id() -> CallId {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Boxed future returned by task bodies
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Outcome>> + Send>>;

type TaskBody = dyn Fn(TaskArgs) -> TaskFuture + Send + Sync;

/// What a task body produced
pub enum Outcome {
    /// A plain value
    Value(Value),
    /// Another invocation to run as the next trampoline generation
    TailCall(LazyCall),
}

impl Outcome {
    /// Wrap anything convertible into a JSON value
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Consume the outcome, keeping only a plain value
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::TailCall(_) => None,
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<LazyCall> for Outcome {
    fn from(call: LazyCall) -> Self {
        Self::TailCall(call)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::TailCall(c) => f.debug_tuple("TailCall").field(c).finish(),
        }
    }
}

/// Retry policy: up to `max_attempts` tries, sleeping `delay` between them
/// and multiplying the delay by `backoff` after each failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    /// Create a policy with no delay and no backoff
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::ZERO,
            backoff: 1.0,
        }
    }

    /// Set the delay before the second attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the delay multiplier
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn summary(&self) -> String {
        format!(
            "retry({},{}ms,{})",
            self.max_attempts,
            self.delay.as_millis(),
            self.backoff
        )
    }
}

/// A named task with an async body.
///
/// Task-level retry and resource defaults are copied onto every handle
/// created from the task and can be overridden per handle.
pub struct TaskDef {
    name: String,
    body: Box<TaskBody>,
    retry: Option<RetryPolicy>,
    resources: BTreeMap<String, u64>,
    tail_calls: Vec<String>,
}

impl TaskDef {
    /// Create a task from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(move |args| Box::pin(body(args))),
            retry: None,
            resources: BTreeMap::new(),
            tail_calls: Vec::new(),
        }
    }

    /// Default retry policy for handles of this task
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Default static resource requirement for handles of this task
    pub fn with_resource(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    /// Declare the tasks this body may return as a tail call.
    ///
    /// Task bodies are opaque closures, so the recursion analysis works from
    /// this declared call set.
    pub fn with_tail_calls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tail_calls = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn resources(&self) -> &BTreeMap<String, u64> {
        &self.resources
    }

    pub fn tail_calls(&self) -> &[String] {
        &self.tail_calls
    }

    /// Run the body directly
    pub async fn run(&self, args: TaskArgs) -> Result<Outcome> {
        (self.body)(args).await
    }

    /// Start building an invocation of this task
    pub fn call(self: &Arc<Self>) -> CallBuilder {
        CallBuilder {
            task: Arc::clone(self),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Invoke with positional arguments only
    pub fn apply<I>(self: &Arc<Self>, args: I) -> LazyCall
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        let mut builder = self.call();
        for arg in args {
            builder = builder.arg(arg);
        }
        builder.build()
    }

    /// Start building a fan-out invocation of this task
    pub fn map(self: &Arc<Self>) -> MapBuilder {
        MapBuilder {
            task: Arc::clone(self),
            mapped: BTreeMap::new(),
            fixed: BTreeMap::new(),
        }
    }

    fn default_policy(&self) -> CallPolicy {
        CallPolicy {
            retry: self.retry.clone(),
            resources: self
                .resources
                .iter()
                .map(|(k, v)| (k.clone(), Amount::Static(*v)))
                .collect(),
            ..CallPolicy::default()
        }
    }
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("resources", &self.resources)
            .field("tail_calls", &self.tail_calls)
            .finish()
    }
}

/// A value that cannot be serialized deterministically.
///
/// Opaque values reach the task through [`TaskArgs::object`]; for hashing
/// they collapse onto a per-type placeholder, so two handles differing only
/// in an opaque value share one node.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn value(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.value)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

/// Routes a consumer argument to one of several handles based on the value
/// a selector handle resolves to.
#[derive(Clone, Debug)]
pub struct Router {
    pub(crate) selector: LazyCall,
    pub(crate) routes: BTreeMap<String, LazyCall>,
    pub(crate) default: Option<LazyCall>,
}

impl Router {
    pub fn new(selector: &LazyCall) -> Self {
        Self {
            selector: selector.clone(),
            routes: BTreeMap::new(),
            default: None,
        }
    }

    /// Add a route taken when the selector resolves to `key`
    pub fn route(mut self, key: impl Into<Value>, call: &LazyCall) -> Self {
        self.routes.insert(route_key(&key.into()), call.clone());
        self
    }

    /// Route taken when no key matches
    pub fn otherwise(mut self, call: &LazyCall) -> Self {
        self.default = Some(call.clone());
        self
    }
}

/// Route-table key for a selector value: strings as-is, anything else as JSON text
pub fn route_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One argument of an invocation
#[derive(Clone, Debug)]
pub enum Arg {
    /// A JSON literal
    Literal(Value),
    /// A literal whose serialization failed; delivered as `null`
    Unserializable(&'static str),
    /// The result of another invocation
    Call(LazyCall),
    /// A list whose items may contain handles
    List(Vec<Arg>),
    /// A map whose values may contain handles
    Map(BTreeMap<String, Arg>),
    /// A value chosen at runtime from a route table
    Router(Router),
    /// A runtime object registered in the engine's extensions
    Inject(String),
    /// A non-serializable value passed through to the task
    Opaque(Opaque),
}

impl Arg {
    /// Convert any serializable value, failing closed to `Unserializable`
    pub fn literal<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::Literal(v),
            Err(e) => {
                log::warn!(
                    "Argument of type {} is not serializable ({}); hashing it as a placeholder",
                    std::any::type_name::<T>(),
                    e
                );
                Self::Unserializable(std::any::type_name::<T>())
            }
        }
    }

    /// Reference an injected resource by name
    pub fn inject(name: impl Into<String>) -> Self {
        Self::Inject(name.into())
    }

    /// Wrap a non-serializable value
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Opaque::new(value))
    }

    /// Whether any handle or router is reachable from this argument
    pub fn has_calls(&self) -> bool {
        match self {
            Self::Call(_) | Self::Router(_) => true,
            Self::List(items) => items.iter().any(Arg::has_calls),
            Self::Map(entries) => entries.values().any(Arg::has_calls),
            Self::Literal(_) | Self::Unserializable(_) | Self::Inject(_) | Self::Opaque(_) => false,
        }
    }

    fn for_each_call(&self, f: &mut dyn FnMut(&LazyCall)) {
        match self {
            Self::Call(c) => f(c),
            Self::List(items) => items.iter().for_each(|a| a.for_each_call(f)),
            Self::Map(entries) => entries.values().for_each(|a| a.for_each_call(f)),
            Self::Router(r) => {
                f(&r.selector);
                r.routes.values().for_each(|c| f(c));
                if let Some(d) = &r.default {
                    f(d);
                }
            }
            Self::Literal(_) | Self::Unserializable(_) | Self::Inject(_) | Self::Opaque(_) => {}
        }
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg {
            fn from(value: $ty) -> Self {
                Self::Literal(Value::from(value))
            }
        })*
    };
}

literal_from!(i32, i64, u32, u64, f64, bool, &str, String);

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<LazyCall> for Arg {
    fn from(call: LazyCall) -> Self {
        Self::Call(call)
    }
}

impl From<&LazyCall> for Arg {
    fn from(call: &LazyCall) -> Self {
        Self::Call(call.clone())
    }
}

impl From<Router> for Arg {
    fn from(router: Router) -> Self {
        Self::Router(router)
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Arg>> for Arg {
    fn from(entries: BTreeMap<String, Arg>) -> Self {
        Self::Map(entries)
    }
}

/// A resource amount: fixed, or computed by another handle at runtime
#[derive(Clone, Debug)]
pub enum Amount {
    Static(u64),
    Dynamic(LazyCall),
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self::Static(value)
    }
}

impl From<&LazyCall> for Amount {
    fn from(call: &LazyCall) -> Self {
        Self::Dynamic(call.clone())
    }
}

#[derive(Clone, Default)]
pub(crate) struct CallPolicy {
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) cache: Option<Arc<dyn CachePolicy>>,
    pub(crate) resources: BTreeMap<String, Amount>,
    pub(crate) condition: Option<LazyCall>,
    pub(crate) after: Vec<LazyCall>,
    pub(crate) jump: Option<LazyCall>,
}

#[derive(Clone)]
pub(crate) enum CallKind {
    Task {
        task: Arc<TaskDef>,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    },
    Map {
        task: Arc<TaskDef>,
        mapped: BTreeMap<String, Arg>,
        fixed: BTreeMap<String, Arg>,
    },
    Parameter {
        name: String,
        default: Option<Value>,
    },
}

struct CallInner {
    id: CallId,
    kind: CallKind,
    policy: CallPolicy,
}

/// Handle to a deferred invocation.
///
/// Cloning is cheap and keeps the same identity; policy chaining returns a
/// new handle with a new identity that shares the arguments.
#[derive(Clone)]
pub struct LazyCall(Arc<CallInner>);

impl LazyCall {
    fn from_parts(kind: CallKind, policy: CallPolicy) -> Self {
        Self(Arc::new(CallInner {
            id: next_call_id(),
            kind,
            policy,
        }))
    }

    /// A workflow parameter, resolved from the run's parameters
    pub fn param(name: impl Into<String>, default: Option<Value>) -> Self {
        Self::from_parts(
            CallKind::Parameter {
                name: name.into(),
                default,
            },
            CallPolicy::default(),
        )
    }

    pub fn id(&self) -> CallId {
        self.0.id
    }

    /// Task name, or `param:<name>` for parameters
    pub fn label(&self) -> String {
        match &self.0.kind {
            CallKind::Task { task, .. } | CallKind::Map { task, .. } => task.name().to_string(),
            CallKind::Parameter { name, .. } => format!("param:{}", name),
        }
    }

    pub fn task(&self) -> Option<&Arc<TaskDef>> {
        match &self.0.kind {
            CallKind::Task { task, .. } | CallKind::Map { task, .. } => Some(task),
            CallKind::Parameter { .. } => None,
        }
    }

    pub(crate) fn kind(&self) -> &CallKind {
        &self.0.kind
    }

    pub(crate) fn policy(&self) -> &CallPolicy {
        &self.0.policy
    }

    fn with_policy(&self, update: impl FnOnce(&mut CallPolicy)) -> Self {
        let mut policy = self.0.policy.clone();
        update(&mut policy);
        Self::from_parts(self.0.kind.clone(), policy)
    }

    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        self.with_policy(|p| p.retry = Some(retry))
    }

    pub fn with_cache(&self, cache: Arc<dyn CachePolicy>) -> Self {
        self.with_policy(|p| p.cache = Some(cache))
    }

    /// Require `amount` of a named resource while this invocation runs
    pub fn with_resource(&self, name: impl Into<String>, amount: impl Into<Amount>) -> Self {
        let name = name.into();
        let amount = amount.into();
        self.with_policy(|p| {
            p.resources.insert(name, amount);
        })
    }

    /// Only run when `condition` resolves to a truthy value
    pub fn run_if(&self, condition: &LazyCall) -> Self {
        self.with_policy(|p| p.condition = Some(condition.clone()))
    }

    /// Run strictly after `dep`, without consuming its value
    pub fn after(&self, dep: &LazyCall) -> Self {
        self.with_policy(|p| p.after.push(dep.clone()))
    }

    /// Bind an iterative jump selector; its value reaches the task as `TaskArgs::jump`
    pub fn jump_to(&self, selector: &LazyCall) -> Self {
        self.with_policy(|p| p.jump = Some(selector.clone()))
    }

    /// A task call whose arguments and policies reference no other handle
    pub fn is_plain(&self) -> bool {
        let policy = &self.0.policy;
        let plain_policy = policy.condition.is_none()
            && policy.after.is_empty()
            && policy.jump.is_none()
            && policy
                .resources
                .values()
                .all(|a| matches!(a, Amount::Static(_)));
        match &self.0.kind {
            CallKind::Task { args, kwargs, .. } => {
                plain_policy
                    && !args.iter().any(Arg::has_calls)
                    && !kwargs.values().any(Arg::has_calls)
            }
            CallKind::Map { .. } | CallKind::Parameter { .. } => false,
        }
    }

    /// Visit every directly referenced handle
    pub(crate) fn for_each_child(&self, f: &mut dyn FnMut(&LazyCall)) {
        match &self.0.kind {
            CallKind::Task { args, kwargs, .. } => {
                args.iter().for_each(|a| a.for_each_call(f));
                kwargs.values().for_each(|a| a.for_each_call(f));
            }
            CallKind::Map { mapped, fixed, .. } => {
                mapped.values().for_each(|a| a.for_each_call(f));
                fixed.values().for_each(|a| a.for_each_call(f));
            }
            CallKind::Parameter { .. } => {}
        }
        let policy = &self.0.policy;
        for amount in policy.resources.values() {
            if let Amount::Dynamic(c) = amount {
                f(c);
            }
        }
        if let Some(c) = &policy.condition {
            f(c);
        }
        policy.after.iter().for_each(|c| f(c));
        if let Some(c) = &policy.jump {
            f(c);
        }
    }
}

impl fmt::Debug for LazyCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyCall(#{} {})", self.0.id, self.label())
    }
}

/// Fluent builder for task invocations
pub struct CallBuilder {
    task: Arc<TaskDef>,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Arg>,
}

impl CallBuilder {
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.insert(name.into(), arg.into());
        self
    }

    pub fn build(self) -> LazyCall {
        let policy = self.task.default_policy();
        LazyCall::from_parts(
            CallKind::Task {
                task: self.task,
                args: self.args,
                kwargs: self.kwargs,
            },
            policy,
        )
    }
}

/// Fluent builder for fan-out invocations.
///
/// Every `over` argument must resolve to a list; all lists must have the
/// same length. Sub-invocation `i` receives item `i` of each list as a
/// keyword argument, plus every `fixed` argument.
pub struct MapBuilder {
    task: Arc<TaskDef>,
    mapped: BTreeMap<String, Arg>,
    fixed: BTreeMap<String, Arg>,
}

impl MapBuilder {
    pub fn over(mut self, name: impl Into<String>, items: impl Into<Arg>) -> Self {
        self.mapped.insert(name.into(), items.into());
        self
    }

    pub fn fixed(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.fixed.insert(name.into(), arg.into());
        self
    }

    pub fn build(self) -> LazyCall {
        let policy = self.task.default_policy();
        LazyCall::from_parts(
            CallKind::Map {
                task: self.task,
                mapped: self.mapped,
                fixed: self.fixed,
            },
            policy,
        )
    }
}

/// Resolved arguments handed to a task body
#[derive(Clone)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Value of the bound jump selector, if any
    pub jump: Option<Value>,
    /// Position within a fan-out, if this is a mapped sub-invocation
    pub map_index: Option<usize>,
    objects: HashMap<String, Arc<dyn Any + Send + Sync>>,
    task: Arc<TaskDef>,
}

impl TaskArgs {
    pub fn new(task: Arc<TaskDef>) -> Self {
        Self {
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            jump: None,
            map_index: None,
            objects: HashMap::new(),
            task,
        }
    }

    /// The task being invoked (handy for self tail calls)
    pub fn task(&self) -> &Arc<TaskDef> {
        &self.task
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument as an integer
    pub fn i64_arg(&self, index: usize) -> Result<i64> {
        self.arg(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::failed(format!("argument {} is not an integer", index)))
    }

    /// Keyword argument as an integer
    pub fn i64_kwarg(&self, name: &str) -> Result<i64> {
        self.kwarg(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::failed(format!("argument '{}' is not an integer", name)))
    }

    /// Injected or opaque object at an argument path (`"0"`, `"db"`, `"cfg.client"`, `"1[2]"`)
    pub fn object<T: Any + Send + Sync>(&self, path: &str) -> Option<Arc<T>> {
        self.objects
            .get(path)
            .and_then(|o| Arc::clone(o).downcast::<T>().ok())
    }

    pub(crate) fn insert_object(&mut self, path: String, object: Arc<dyn Any + Send + Sync>) {
        self.objects.insert(path, object);
    }

    /// Serializable view of the inputs, used for content-addressed caching
    pub(crate) fn inputs_value(&self) -> Value {
        serde_json::json!({
            "args": self.args,
            "kwargs": self.kwargs,
            "jump": self.jump,
        })
    }
}

pub(crate) fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

pub(crate) fn key_path(parent: &str, key: &str) -> String {
    format!("{}.{}", parent, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Arc<TaskDef> {
        Arc::new(TaskDef::new(name, |_args| async { Ok(Outcome::Value(Value::Null)) }))
    }

    #[test]
    fn test_handles_are_unique() {
        let f = noop("f");
        let a = f.apply([1]);
        let b = f.apply([1]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_policy_chaining_creates_new_handle() {
        let f = noop("f");
        let a = f.apply([1]);
        let retried = a.with_retry(RetryPolicy::new(3));
        assert_ne!(a.id(), retried.id());
        assert!(a.policy().retry.is_none());
        assert_eq!(retried.policy().retry.as_ref().map(|r| r.max_attempts), Some(3));
    }

    #[test]
    fn test_task_defaults_copied_to_handles() {
        let f = Arc::new(
            TaskDef::new("gpu_job", |_args| async { Ok(Outcome::Value(Value::Null)) })
                .with_resource("gpu", 2)
                .with_retry(RetryPolicy::new(2)),
        );
        let call = f.apply([1]);
        assert!(matches!(call.policy().resources.get("gpu"), Some(Amount::Static(2))));
        assert!(call.policy().retry.is_some());
    }

    #[test]
    fn test_children_visit_routers_and_policies() {
        let f = noop("f");
        let sel = f.apply([0]);
        let a = f.apply([1]);
        let b = f.apply([2]);
        let cond = f.apply([3]);
        let consumer = f
            .call()
            .arg(Router::new(&sel).route("a", &a).route("b", &b))
            .build()
            .run_if(&cond);

        let mut seen = Vec::new();
        consumer.for_each_child(&mut |c| seen.push(c.id()));
        assert_eq!(seen, vec![sel.id(), a.id(), b.id(), cond.id()]);
    }

    #[test]
    fn test_is_plain() {
        let f = noop("f");
        let leaf = f.apply([1, 2]);
        assert!(leaf.is_plain());
        let nested = f.call().arg(&leaf).build();
        assert!(!nested.is_plain());
        assert!(!LazyCall::param("x", None).is_plain());
    }

    #[test]
    fn test_route_key() {
        assert_eq!(route_key(&Value::from("a")), "a");
        assert_eq!(route_key(&Value::from(true)), "true");
        assert_eq!(route_key(&Value::from(3)), "3");
    }

    #[test]
    fn test_unserializable_literal_fails_closed() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "tuple keys cannot become JSON object keys");
        assert!(matches!(Arg::literal(&map), Arg::Unserializable(_)));
    }

    #[test]
    fn test_task_args_objects() {
        let f = noop("f");
        let mut args = TaskArgs::new(f);
        args.insert_object("db".to_string(), Arc::new(42u32));
        assert_eq!(args.object::<u32>("db").as_deref(), Some(&42));
        assert!(args.object::<String>("db").is_none());
    }
}
