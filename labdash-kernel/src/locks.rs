//! Per-target mutual exclusion shared by scheduled jobs and ad-hoc requests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a command runs against the target; dropping it releases the lock.
pub type TargetGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct TargetLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, target: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Returns `None` when another job is already running on the target.
    pub fn try_acquire(&self, target: &str) -> Option<TargetGuard> {
        self.slot(target).try_lock_owned().ok()
    }

    /// Waits for the target to become free.
    pub async fn acquire(&self, target: &str) -> TargetGuard {
        self.slot(target).lock_owned().await
    }

    pub fn is_busy(&self, target: &str) -> bool {
        self.locks
            .lock()
            .get(target)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_is_exclusive_per_target() {
        let locks = TargetLocks::new();
        let guard = locks.try_acquire("dut-1").unwrap();
        assert!(locks.try_acquire("dut-1").is_none());
        assert!(locks.is_busy("dut-1"));
        // other targets unaffected
        assert!(locks.try_acquire("dut-2").is_some());
        drop(guard);
        assert!(!locks.is_busy("dut-1"));
        assert!(locks.try_acquire("dut-1").is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_holder() {
        let locks = TargetLocks::new();
        let guard = locks.acquire("dut-1").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("dut-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
