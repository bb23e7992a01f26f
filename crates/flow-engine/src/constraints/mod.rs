//! Live admission policies
//!
//! A [`Constraint`] is `(id, scope, type, params, expiry)`. The manager keeps
//! at most one constraint per `(scope, type)` and dispatches on the type
//! string to a registered [`ConstraintHandler`]. Scopes are `global` or
//! `task:<name>`.
//!
//! Every mutation notifies the shared [`WakeSignal`], so a task waiting on
//! admission re-checks its permission immediately.

mod handlers;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::resources::{Requirements, ResourceManager};
use crate::signal::WakeSignal;

pub use handlers::{parse_rate, ConcurrencyHandler, PauseHandler, RateLimitHandler};

/// Scope matching every task
pub const GLOBAL_SCOPE: &str = "global";

/// Scope string for a single task
pub fn task_scope(task_name: &str) -> String {
    format!("task:{}", task_name)
}

/// A live policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub id: String,
    pub scope: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip)]
    pub expires_at: Option<Instant>,
}

impl Constraint {
    pub fn new(scope: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            id: format!("constraint-{}", uuid::Uuid::new_v4()),
            scope: scope.into(),
            kind: kind.into(),
            params,
            expires_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Expire `ttl` from now
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    pub fn applies_to(&self, task_name: &str) -> bool {
        self.scope == GLOBAL_SCOPE
            || self
                .scope
                .strip_prefix("task:")
                .is_some_and(|name| name == task_name)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Deserialize)]
struct ControlPayload {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Value,
    ttl_secs: Option<f64>,
}

/// A parsed message from the constraints topic
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Remove every constraint in a scope
    Clear { scope: String },
    /// Add or replace a constraint
    Update(Constraint),
}

impl ControlMessage {
    /// Parse a message published on `<prefix>/<scope>`; an empty payload clears the scope
    pub fn parse(prefix: &str, topic: &str, payload: &[u8]) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/');
        let scope = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                EngineError::MalformedControlMessage(format!(
                    "topic '{}' is not under '{}'",
                    topic, prefix
                ))
            })?;
        let valid_scope = scope == GLOBAL_SCOPE
            || scope
                .strip_prefix("task:")
                .is_some_and(|name| !name.is_empty() && !name.contains('/'));
        if !valid_scope {
            return Err(EngineError::MalformedControlMessage(format!(
                "invalid scope '{}'",
                scope
            )));
        }

        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::Clear {
                scope: scope.to_string(),
            });
        }

        let parsed: ControlPayload = serde_json::from_slice(payload)
            .map_err(|e| EngineError::MalformedControlMessage(e.to_string()))?;
        let mut constraint = Constraint::new(scope, parsed.kind, parsed.params);
        if let Some(id) = parsed.id {
            constraint.id = id;
        }
        if let Some(ttl) = parsed.ttl_secs {
            if !ttl.is_finite() || ttl < 0.0 {
                return Err(EngineError::MalformedControlMessage(format!(
                    "invalid ttl_secs {}",
                    ttl
                )));
            }
            constraint = constraint.with_ttl(Duration::from_secs_f64(ttl));
        }
        Ok(Self::Update(constraint))
    }
}

/// Shared collaborators handed to handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub resources: Arc<ResourceManager>,
    pub wake: Arc<WakeSignal>,
}

/// Behaviour for one constraint type
pub trait ConstraintHandler: Send + Sync {
    /// Type discriminator this handler is registered under
    fn kind(&self) -> &'static str;

    /// Evaluation order; lower runs first
    fn priority(&self) -> u32 {
        50
    }

    /// Reject bad params before the constraint replaces anything
    fn validate(&self, _constraint: &Constraint) -> Result<()> {
        Ok(())
    }

    fn on_add(&self, _constraint: &Constraint, _ctx: &HandlerContext) {}

    fn on_remove(&self, _constraint: &Constraint, _ctx: &HandlerContext) {}

    fn on_replace(&self, old: &Constraint, new: &Constraint, ctx: &HandlerContext) {
        self.on_remove(old, ctx);
        self.on_add(new, ctx);
    }

    fn check_permission(&self, _constraint: &Constraint, _task: &str, _ctx: &HandlerContext) -> bool {
        true
    }

    fn append_requirements(&self, _constraint: &Constraint, _task: &str, _reqs: &mut Requirements) {}
}

type ConstraintKey = (String, String);

/// Holds the live constraint set and dispatches to handlers
pub struct ConstraintManager {
    handlers: RwLock<HashMap<String, Arc<dyn ConstraintHandler>>>,
    constraints: RwLock<BTreeMap<ConstraintKey, Constraint>>,
    ctx: HandlerContext,
    events: Arc<dyn EventSink>,
    expiry_margin: Duration,
    next_expiry_wake: Mutex<Option<Instant>>,
    this: Weak<ConstraintManager>,
}

impl ConstraintManager {
    /// Create a manager with the pause, concurrency and rate handlers registered
    pub fn new(
        resources: Arc<ResourceManager>,
        wake: Arc<WakeSignal>,
        events: Arc<dyn EventSink>,
        expiry_margin: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            handlers: RwLock::new(HashMap::new()),
            constraints: RwLock::new(BTreeMap::new()),
            ctx: HandlerContext { resources, wake },
            events,
            expiry_margin,
            next_expiry_wake: Mutex::new(None),
            this: this.clone(),
        });
        manager.register_handler(Arc::new(PauseHandler));
        manager.register_handler(Arc::new(ConcurrencyHandler));
        manager.register_handler(Arc::new(RateLimitHandler::new()));
        manager
    }

    pub fn register_handler(&self, handler: Arc<dyn ConstraintHandler>) {
        self.handlers
            .write()
            .insert(handler.kind().to_string(), handler);
    }

    fn handler(&self, kind: &str) -> Option<Arc<dyn ConstraintHandler>> {
        self.handlers.read().get(kind).cloned()
    }

    pub fn wake(&self) -> &Arc<WakeSignal> {
        &self.ctx.wake
    }

    /// Add a constraint, replacing any other with the same scope and type
    pub fn update_constraint(&self, constraint: Constraint) -> Result<()> {
        let handler = self.handler(&constraint.kind).ok_or_else(|| {
            EngineError::MalformedControlMessage(format!(
                "unknown constraint type '{}'",
                constraint.kind
            ))
        })?;
        handler.validate(&constraint)?;

        let key = (constraint.scope.clone(), constraint.kind.clone());
        let previous = self.constraints.write().insert(key, constraint.clone());
        match &previous {
            Some(old) => handler.on_replace(old, &constraint, &self.ctx),
            None => handler.on_add(&constraint, &self.ctx),
        }

        log::info!(
            "Constraint {} ({} on {}) {}",
            constraint.id,
            constraint.kind,
            constraint.scope,
            if previous.is_some() { "replaced" } else { "added" }
        );
        let _ = self.events.send(WorkflowEvent::ConstraintUpdated {
            constraint_id: constraint.id.clone(),
            scope: constraint.scope.clone(),
            kind: constraint.kind.clone(),
        });

        if let Some(at) = constraint.expires_at {
            self.schedule_expiry(at);
        }
        self.ctx.wake.notify();
        Ok(())
    }

    /// Remove one constraint by scope and type
    pub fn remove(&self, scope: &str, kind: &str) -> bool {
        let removed = self
            .constraints
            .write()
            .remove(&(scope.to_string(), kind.to_string()));
        match removed {
            Some(constraint) => {
                self.finish_removal(&constraint);
                self.ctx.wake.notify();
                true
            }
            None => false,
        }
    }

    /// Remove every constraint in a scope; returns how many were removed
    pub fn remove_by_scope(&self, scope: &str) -> usize {
        let removed: Vec<Constraint> = {
            let mut constraints = self.constraints.write();
            let keys: Vec<ConstraintKey> = constraints
                .keys()
                .filter(|(s, _)| s == scope)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| constraints.remove(k)).collect()
        };
        for constraint in &removed {
            self.finish_removal(constraint);
        }
        if !removed.is_empty() {
            log::info!("Cleared {} constraint(s) on {}", removed.len(), scope);
        }
        self.ctx.wake.notify();
        removed.len()
    }

    fn finish_removal(&self, constraint: &Constraint) {
        if let Some(handler) = self.handler(&constraint.kind) {
            handler.on_remove(constraint, &self.ctx);
        }
        let _ = self.events.send(WorkflowEvent::ConstraintRemoved {
            constraint_id: constraint.id.clone(),
            scope: constraint.scope.clone(),
            kind: constraint.kind.clone(),
        });
    }

    /// Constraints applying to a task, in handler priority order
    fn applicable(&self, task: &str) -> Vec<(Arc<dyn ConstraintHandler>, Constraint)> {
        let now = Instant::now();
        let mut matched: Vec<_> = self
            .constraints
            .read()
            .values()
            .filter(|c| c.applies_to(task) && !c.is_expired(now))
            .filter_map(|c| self.handler(&c.kind).map(|h| (h, c.clone())))
            .collect();
        matched.sort_by_key(|(h, _)| h.priority());
        matched
    }

    /// Whether every applicable constraint admits the task now
    pub fn check_permission(&self, task: &str) -> bool {
        self.applicable(task)
            .iter()
            .all(|(handler, constraint)| handler.check_permission(constraint, task, &self.ctx))
    }

    /// Resources the live constraints add to a task's requirements
    pub fn extra_requirements(&self, task: &str) -> Requirements {
        let mut reqs = Requirements::new();
        for (handler, constraint) in self.applicable(task) {
            handler.append_requirements(&constraint, task, &mut reqs);
        }
        reqs
    }

    /// Remove expired constraints and re-arm the wake-up for the next expiry
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Constraint> = {
            let mut constraints = self.constraints.write();
            let keys: Vec<ConstraintKey> = constraints
                .iter()
                .filter(|(_, c)| c.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| constraints.remove(k)).collect()
        };
        for constraint in &expired {
            log::info!(
                "Constraint {} ({} on {}) expired",
                constraint.id,
                constraint.kind,
                constraint.scope
            );
            self.finish_removal(constraint);
        }

        let next = self
            .constraints
            .read()
            .values()
            .filter_map(|c| c.expires_at)
            .min();
        if let Some(at) = next {
            self.schedule_expiry(at);
        }
        if !expired.is_empty() {
            self.ctx.wake.notify();
        }
        expired.len()
    }

    /// Arm a single timer for the earliest outstanding expiry
    fn schedule_expiry(&self, at: Instant) {
        {
            let mut next = self.next_expiry_wake.lock();
            if next.is_some_and(|scheduled| scheduled <= at) {
                return;
            }
            *next = Some(at);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No async runtime; constraint expiry will only be swept on demand");
            return;
        };
        let this = self.this.clone();
        let wake_at = at + self.expiry_margin;
        runtime.spawn(async move {
            tokio::time::sleep_until(wake_at).await;
            if let Some(manager) = this.upgrade() {
                {
                    let mut next = manager.next_expiry_wake.lock();
                    if *next == Some(at) {
                        *next = None;
                    }
                }
                manager.cleanup_expired();
            }
        });
    }

    /// Apply a raw message from the constraints topic.
    ///
    /// Malformed messages are logged and discarded; the current constraint
    /// set stays in force.
    pub fn apply_control_message(&self, prefix: &str, topic: &str, payload: &[u8]) -> Result<()> {
        let result = ControlMessage::parse(prefix, topic, payload).and_then(|message| match message {
            ControlMessage::Clear { scope } => {
                self.remove_by_scope(&scope);
                Ok(())
            }
            ControlMessage::Update(constraint) => self.update_constraint(constraint),
        });
        if let Err(e) = &result {
            log::warn!("Discarding control message on '{}': {}", topic, e);
        }
        result
    }

    /// Snapshot of the live constraints
    pub fn constraints(&self) -> Vec<Constraint> {
        self.constraints.read().values().cloned().collect()
    }
}
