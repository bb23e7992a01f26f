//! Named-capacity resource pools
//!
//! `acquire` is all-or-wait: a request is debited only when every named
//! capacity can cover it at once, so no task ever holds a partial claim
//! while waiting for the rest. Claims are released by dropping the returned
//! [`ResourceGuard`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Resource name → amount
pub type Requirements = BTreeMap<String, u64>;

#[derive(Debug, Clone, Copy)]
struct Pool {
    capacity: u64,
    in_use: u64,
}

/// Capacity table with atomic debit and credit.
///
/// Names without a registered capacity are unlimited.
#[derive(Debug, Default)]
pub struct ResourceManager {
    pools: Mutex<HashMap<String, Pool>>,
    released: Notify,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacities(capacities: &BTreeMap<String, u64>) -> Self {
        let manager = Self::new();
        for (name, capacity) in capacities {
            manager.set_capacity(name, *capacity);
        }
        manager
    }

    /// Create or resize a pool; outstanding claims are kept
    pub fn set_capacity(&self, name: &str, capacity: u64) {
        {
            let mut pools = self.pools.lock();
            pools
                .entry(name.to_string())
                .and_modify(|p| p.capacity = capacity)
                .or_insert(Pool {
                    capacity,
                    in_use: 0,
                });
        }
        log::debug!("Resource '{}' capacity set to {}", name, capacity);
        self.released.notify_waiters();
    }

    /// Remove a pool, making the name unlimited
    pub fn remove_capacity(&self, name: &str) {
        self.pools.lock().remove(name);
        self.released.notify_waiters();
    }

    pub fn capacity(&self, name: &str) -> Option<u64> {
        self.pools.lock().get(name).map(|p| p.capacity)
    }

    pub fn in_use(&self, name: &str) -> u64 {
        self.pools.lock().get(name).map_or(0, |p| p.in_use)
    }

    /// Whether `reqs` could be debited right now
    pub fn can_acquire(&self, reqs: &Requirements) -> bool {
        let pools = self.pools.lock();
        reqs.iter().all(|(name, &amount)| match pools.get(name) {
            Some(pool) => pool.in_use + amount.min(pool.capacity) <= pool.capacity,
            None => true,
        })
    }

    /// Debit `reqs` if every pool can cover it, returning what was debited.
    ///
    /// Amounts above a pool's capacity are clamped to the capacity so an
    /// oversized request waits for an idle pool instead of forever.
    pub fn try_acquire(&self, reqs: &Requirements) -> Option<Requirements> {
        let mut pools = self.pools.lock();
        let mut debit = Requirements::new();
        for (name, &amount) in reqs {
            if let Some(pool) = pools.get(name) {
                let need = amount.min(pool.capacity);
                if pool.in_use + need > pool.capacity {
                    return None;
                }
                if need > 0 {
                    debit.insert(name.clone(), need);
                }
            }
        }
        for (name, need) in &debit {
            if let Some(pool) = pools.get_mut(name) {
                pool.in_use += need;
            }
        }
        Some(debit)
    }

    /// Wait until all of `reqs` can be debited at once
    pub async fn acquire(
        self: &Arc<Self>,
        reqs: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<ResourceGuard> {
        for (name, &amount) in reqs {
            if let Some(capacity) = self.capacity(name) {
                if amount > capacity {
                    log::warn!(
                        "Request for {} of '{}' exceeds capacity {}; clamping",
                        amount,
                        name,
                        capacity
                    );
                }
            }
        }

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(debit) = self.try_acquire(reqs) {
                return Ok(ResourceGuard {
                    manager: Arc::clone(self),
                    debit,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = &mut released => {}
            }
        }
    }

    /// Credit back a previous debit and wake waiters
    pub fn release(&self, debit: &Requirements) {
        if debit.is_empty() {
            return;
        }
        {
            let mut pools = self.pools.lock();
            for (name, amount) in debit {
                if let Some(pool) = pools.get_mut(name) {
                    pool.in_use = pool.in_use.saturating_sub(*amount);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Scoped claim; dropping it releases the resources
#[derive(Debug)]
pub struct ResourceGuard {
    manager: Arc<ResourceManager>,
    debit: Requirements,
}

impl ResourceGuard {
    pub fn debit(&self) -> &Requirements {
        &self.debit
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.manager.release(&self.debit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reqs(pairs: &[(&str, u64)]) -> Requirements {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let manager = Arc::new(ResourceManager::new());
        manager.set_capacity("gpu", 2);
        let cancel = CancellationToken::new();

        let guard = manager.acquire(&reqs(&[("gpu", 2)]), &cancel).await.unwrap();
        assert_eq!(manager.in_use("gpu"), 2);
        assert!(!manager.can_acquire(&reqs(&[("gpu", 1)])));
        drop(guard);
        assert_eq!(manager.in_use("gpu"), 0);
    }

    #[test]
    fn test_all_or_nothing() {
        let manager = ResourceManager::new();
        manager.set_capacity("gpu", 1);
        manager.set_capacity("ram", 4);
        let _held = manager.try_acquire(&reqs(&[("gpu", 1)])).unwrap();

        assert!(manager.try_acquire(&reqs(&[("gpu", 1), ("ram", 2)])).is_none());
        assert_eq!(manager.in_use("ram"), 0);
    }

    #[test]
    fn test_unknown_names_are_unlimited() {
        let manager = ResourceManager::new();
        let debit = manager.try_acquire(&reqs(&[("anything", 100)])).unwrap();
        assert!(debit.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let manager = Arc::new(ResourceManager::new());
        manager.set_capacity("slot", 1);
        let cancel = CancellationToken::new();
        let first = manager.acquire(&reqs(&[("slot", 1)]), &cancel).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .acquire(&reqs(&[("slot", 1)]), &cancel)
                    .await
                    .map(|g| g.debit().clone())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);

        let debit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(debit.get("slot"), Some(&1));
    }

    #[tokio::test]
    async fn test_capacity_increase_wakes_waiter() {
        let manager = Arc::new(ResourceManager::new());
        manager.set_capacity("slot", 1);
        let cancel = CancellationToken::new();
        let _held = manager.acquire(&reqs(&[("slot", 1)]), &cancel).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.acquire(&reqs(&[("slot", 1)]), &cancel).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.set_capacity("slot", 2);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let manager = Arc::new(ResourceManager::new());
        manager.set_capacity("slot", 1);
        let cancel = CancellationToken::new();
        let _held = manager.acquire(&reqs(&[("slot", 1)]), &cancel).await.unwrap();
        cancel.cancel();
        let result = manager.acquire(&reqs(&[("slot", 1)]), &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
