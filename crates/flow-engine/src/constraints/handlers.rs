//! Built-in constraint handlers: pause, concurrency and rate

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Constraint, ConstraintHandler, HandlerContext};
use crate::error::{EngineError, Result};
use crate::resources::Requirements;

/// Denies every task in scope
pub struct PauseHandler;

impl ConstraintHandler for PauseHandler {
    fn kind(&self) -> &'static str {
        "pause"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn check_permission(&self, _constraint: &Constraint, _task: &str, _ctx: &HandlerContext) -> bool {
        false
    }
}

/// Caps in-flight tasks per scope through a `concurrency:<scope>` resource
pub struct ConcurrencyHandler;

impl ConcurrencyHandler {
    pub fn resource_name(scope: &str) -> String {
        format!("concurrency:{}", scope)
    }

    fn limit(constraint: &Constraint) -> Result<u64> {
        constraint
            .params
            .get("limit")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                EngineError::MalformedControlMessage(format!(
                    "concurrency constraint {} needs a non-negative integer 'limit'",
                    constraint.id
                ))
            })
    }
}

impl ConstraintHandler for ConcurrencyHandler {
    fn kind(&self) -> &'static str {
        "concurrency"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn validate(&self, constraint: &Constraint) -> Result<()> {
        Self::limit(constraint).map(|_| ())
    }

    fn on_add(&self, constraint: &Constraint, ctx: &HandlerContext) {
        if let Ok(limit) = Self::limit(constraint) {
            ctx.resources
                .set_capacity(&Self::resource_name(&constraint.scope), limit);
        }
    }

    fn on_remove(&self, constraint: &Constraint, ctx: &HandlerContext) {
        ctx.resources
            .remove_capacity(&Self::resource_name(&constraint.scope));
    }

    // Resizing keeps the claims of tasks already running.
    fn on_replace(&self, _old: &Constraint, new: &Constraint, ctx: &HandlerContext) {
        self.on_add(new, ctx);
    }

    fn append_requirements(&self, constraint: &Constraint, _task: &str, reqs: &mut Requirements) {
        *reqs
            .entry(Self::resource_name(&constraint.scope))
            .or_insert(0) += 1;
    }
}

/// Parse a rate like `"10/m"` into `(burst capacity, tokens per second)`
pub fn parse_rate(rate: &str) -> Result<(f64, f64)> {
    let malformed = || EngineError::MalformedControlMessage(format!("invalid rate '{}'", rate));
    let (count, unit) = rate.trim().split_once('/').ok_or_else(malformed)?;
    let count: f64 = count.trim().parse().map_err(|_| malformed())?;
    if !count.is_finite() || count <= 0.0 {
        return Err(malformed());
    }
    let seconds = match unit.trim() {
        "s" | "sec" | "second" => 1.0,
        "m" | "min" | "minute" => 60.0,
        "h" | "hour" => 3600.0,
        "d" | "day" => 86_400.0,
        _ => return Err(malformed()),
    };
    Ok((count, count / seconds))
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
    wake_at: Option<Instant>,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last: Instant::now(),
            wake_at: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    /// Time until one token is available
    fn wait_for_token(&self) -> Duration {
        Duration::from_secs_f64(((1.0 - self.tokens) / self.refill_per_sec).max(0.0))
    }
}

/// Per-scope token bucket; a denial schedules exactly one wake-up for the refill
pub struct RateLimitHandler {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl RateLimitHandler {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn rate(constraint: &Constraint) -> Result<(f64, f64)> {
        let rate = constraint
            .params
            .get("rate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::MalformedControlMessage(format!(
                    "rate constraint {} needs a 'rate' such as \"10/m\"",
                    constraint.id
                ))
            })?;
        parse_rate(rate)
    }

    fn schedule_wake(&self, scope: &str, at: Instant, ctx: &HandlerContext) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let buckets = Arc::clone(&self.buckets);
        let wake = Arc::clone(&ctx.wake);
        let scope = scope.to_string();
        runtime.spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(bucket) = buckets.lock().get_mut(&scope) {
                if bucket.wake_at == Some(at) {
                    bucket.wake_at = None;
                }
            }
            wake.notify();
        });
    }
}

impl Default for RateLimitHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstraintHandler for RateLimitHandler {
    fn kind(&self) -> &'static str {
        "rate"
    }

    // Runs last so a token is only spent when nothing else denies.
    fn priority(&self) -> u32 {
        100
    }

    fn validate(&self, constraint: &Constraint) -> Result<()> {
        Self::rate(constraint).map(|_| ())
    }

    fn on_add(&self, constraint: &Constraint, _ctx: &HandlerContext) {
        if let Ok((capacity, refill)) = Self::rate(constraint) {
            self.buckets
                .lock()
                .insert(constraint.scope.clone(), TokenBucket::new(capacity, refill));
        }
    }

    fn on_remove(&self, constraint: &Constraint, _ctx: &HandlerContext) {
        self.buckets.lock().remove(&constraint.scope);
    }

    // Keeps the current token level; the manager's wake-up makes waiters
    // re-check against the new refill rate.
    fn on_replace(&self, _old: &Constraint, new: &Constraint, _ctx: &HandlerContext) {
        let Ok((capacity, refill)) = Self::rate(new) else {
            return;
        };
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(new.scope.clone())
            .or_insert_with(|| TokenBucket::new(capacity, refill));
        bucket.refill(now);
        bucket.capacity = capacity;
        bucket.refill_per_sec = refill;
        bucket.tokens = bucket.tokens.min(capacity);
        bucket.wake_at = None;
    }

    fn check_permission(&self, constraint: &Constraint, _task: &str, ctx: &HandlerContext) -> bool {
        let now = Instant::now();
        let at = {
            let mut buckets = self.buckets.lock();
            let Some(bucket) = buckets.get_mut(&constraint.scope) else {
                return true;
            };
            bucket.refill(now);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return true;
            }
            let at = now + bucket.wait_for_token();
            if bucket.wake_at.is_some_and(|scheduled| scheduled <= at) {
                return false;
            }
            bucket.wake_at = Some(at);
            at
        };
        log::debug!(
            "Rate limit on {} denied admission; waking in {:?}",
            constraint.scope,
            at.saturating_duration_since(now)
        );
        self.schedule_wake(&constraint.scope, at, ctx);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceManager;
    use crate::signal::WakeSignal;
    use serde_json::json;

    fn ctx() -> HandlerContext {
        HandlerContext {
            resources: Arc::new(ResourceManager::new()),
            wake: Arc::new(WakeSignal::new()),
        }
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("10/s").unwrap(), (10.0, 10.0));
        assert_eq!(parse_rate("60/m").unwrap(), (60.0, 1.0));
        assert!(parse_rate("10").is_err());
        assert!(parse_rate("0/s").is_err());
        assert!(parse_rate("5/fortnight").is_err());
    }

    #[tokio::test]
    async fn test_bucket_allows_burst_then_denies() {
        let handler = RateLimitHandler::new();
        let ctx = ctx();
        let c = Constraint::new("task:f", "rate", json!({"rate": "2/s"}));
        handler.on_add(&c, &ctx);

        assert!(handler.check_permission(&c, "f", &ctx));
        assert!(handler.check_permission(&c, "f", &ctx));
        assert!(!handler.check_permission(&c, "f", &ctx));
    }

    #[tokio::test]
    async fn test_denial_schedules_single_wake() {
        let handler = RateLimitHandler::new();
        let ctx = ctx();
        let c = Constraint::new("task:f", "rate", json!({"rate": "1/s"}));
        handler.on_add(&c, &ctx);
        assert!(handler.check_permission(&c, "f", &ctx));
        assert!(!handler.check_permission(&c, "f", &ctx));
        let first = handler.buckets.lock()["task:f"].wake_at;
        assert!(!handler.check_permission(&c, "f", &ctx));
        assert_eq!(handler.buckets.lock()["task:f"].wake_at, first);
    }

    #[tokio::test]
    async fn test_faster_rate_takes_effect() {
        let handler = RateLimitHandler::new();
        let ctx = ctx();
        let slow = Constraint::new("global", "rate", json!({"rate": "1/m"}));
        handler.on_add(&slow, &ctx);
        assert!(handler.check_permission(&slow, "f", &ctx));
        assert!(!handler.check_permission(&slow, "f", &ctx));

        let fast = Constraint::new("global", "rate", json!({"rate": "1000/s"}));
        handler.on_replace(&slow, &fast, &ctx);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handler.check_permission(&fast, "f", &ctx));
    }

    #[test]
    fn test_concurrency_validation() {
        let bad = Constraint::new("global", "concurrency", json!({"limit": -1}));
        assert!(ConcurrencyHandler.validate(&bad).is_err());
        let good = Constraint::new("global", "concurrency", json!({"limit": 4}));
        assert!(ConcurrencyHandler.validate(&good).is_ok());
    }
}
