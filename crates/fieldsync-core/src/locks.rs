//! Per-aggregate serialization of the resolve/materialize/append sequence.

use crate::delta::AggregateKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by aggregate.
///
/// Holding the guard for a key excludes every other task processing a delta
/// for the same `(aggregate type, aggregate id)`. Different keys never
/// contend.
#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<AggregateKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &AggregateKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            // Drop slots nobody holds or waits on.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let key = AggregateKey::new("Agreement", Uuid::new_v4());

        let guard = locks.acquire(&key).await;
        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyLocks::new();
        let _a = locks
            .acquire(&AggregateKey::new("Agreement", Uuid::new_v4()))
            .await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&AggregateKey::new("Agreement", Uuid::new_v4())),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = KeyLocks::new();
        for _ in 0..5 {
            let _guard = locks
                .acquire(&AggregateKey::new("Party", Uuid::new_v4()))
                .await;
        }
        let _last = locks.acquire(&AggregateKey::new("Party", Uuid::new_v4())).await;
        assert_eq!(locks.tracked().await, 1);
    }
}
