//! Per-user serialization of pipeline runs.
//!
//! A run holds its user's lock from validation to result. Runs for
//! different users never contend. Entries are pruned when the last
//! holder releases and nobody is queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type Slots = HashMap<String, Arc<AsyncMutex<()>>>;

/// Keyed async mutex over user identifiers.
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    slots: Arc<Mutex<Slots>>,
}

/// Held for the duration of one run.
#[derive(Debug)]
pub struct UserGuard {
    user_id: String,
    slots: Arc<Mutex<Slots>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`.
    pub async fn acquire(&self, user_id: &str) -> UserGuard {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            slots.entry(user_id.to_string()).or_default().clone()
        };
        if slot.try_lock().is_err() {
            debug!(user = %user_id, "waiting for in-flight run of the same user");
        }
        let guard = slot.lock_owned().await;
        UserGuard {
            user_id: user_id.to_string(),
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Number of users with a held or queued lock.
    pub fn active(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

impl UserGuard {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get(&self.user_id) {
            // The map and this guard hold the only references: nobody is queued.
            if Arc::strong_count(slot) == 2 {
                slots.remove(&self.user_id);
            }
        }
        self.guard.take();
    }
}

fn lock_slots(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn different_users_do_not_contend() {
        let locks = UserLocks::new();
        let a = locks.acquire("alice").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("bob"))
            .await
            .expect("bob must not wait for alice");
        assert_eq!(locks.active(), 2);
        drop(a);
        drop(b);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_user_is_serialized() {
        let locks = UserLocks::new();
        let first = locks.acquire("alice").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("alice").await;
                tokio::time::Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        let released_at = tokio::time::Instant::now();
        drop(first);

        let acquired_at = waiter.await.unwrap();
        assert!(acquired_at >= released_at);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn queued_waiter_keeps_entry() {
        let locks = UserLocks::new();
        let first = locks.acquire("alice").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("alice").await })
        };
        // Let the waiter register.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(first);
        assert_eq!(locks.active(), 1);

        let second = waiter.await.unwrap();
        assert_eq!(second.user_id(), "alice");
        drop(second);
        assert_eq!(locks.active(), 0);
    }
}
