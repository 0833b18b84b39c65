//! Per-device single-flight locks
//!
//! Pull, push and reset for the same (user, device) run one at a time so two
//! overlapping requests from one device cannot interleave cursor updates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

type SessionKey = (String, String);

/// Registry of per-session async mutexes
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the session of `(user_id, device_id)`
    pub async fn acquire(&self, user_id: &str, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry((user_id.to_string(), device_id.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on; returns how many were removed
    pub async fn prune_idle(&self) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - map.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_device_is_serialized() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("user-1", "device-a").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("user-1", "device-a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_devices_do_not_wait() {
        let locks = SessionLocks::new();
        let _guard = locks.acquire("user-1", "device-a").await;

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire("user-1", "device-b"),
        )
        .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = SessionLocks::new();
        let held = locks.acquire("user-1", "device-a").await;
        drop(locks.acquire("user-1", "device-b").await);

        assert_eq!(locks.prune_idle().await, 1);
        assert_eq!(locks.len().await, 1);

        drop(held);
        assert_eq!(locks.prune_idle().await, 1);
        assert_eq!(locks.len().await, 0);
    }
}
