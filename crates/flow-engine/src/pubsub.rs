//! Pub/sub connector interface and an in-memory broker
//!
//! Topics are `/`-separated. In subscription patterns `+` matches exactly one
//! level and a trailing `#` matches any remaining levels (including none).
//! Retained messages are replayed to new subscribers exactly like live ones;
//! publishing an empty retained payload clears the retained message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{EngineError, Result};

/// Callback invoked with `(topic, payload)` for each delivered message
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identifies one subscription for `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[async_trait]
pub trait PubSubConnector: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

/// Whether `topic` matches a subscription `pattern`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    pattern: String,
    callback: MessageCallback,
}

/// Single-process broker for tests and embedded use
pub struct LocalBroker {
    connected: AtomicBool,
    subscriptions: DashMap<u64, Subscription>,
    retained: DashMap<String, Vec<u8>>,
    next_id: AtomicU64,
}

impl LocalBroker {
    /// A broker that is already connected
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            subscriptions: DashMap::new(),
            retained: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Transport("broker is disconnected".to_string()))
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubConnector for LocalBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.ensure_connected()?;
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        // Collect first so callbacks never run under a map shard lock.
        let targets: Vec<MessageCallback> = self
            .subscriptions
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in targets {
            callback(topic, payload);
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<SubscriptionHandle> {
        self.ensure_connected()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                pattern: pattern.to_string(),
                callback: Arc::clone(&callback),
            },
        );

        let mut replay: Vec<(String, Vec<u8>)> = self
            .retained
            .iter()
            .filter(|r| topic_matches(pattern, r.key()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        replay.sort();
        for (topic, payload) in replay {
            callback(&topic, &payload);
        }
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.subscriptions.remove(&handle.0);
        Ok(())
    }
}
