use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// How widely reconciliation is serialized.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockGranularity {
    /// One lock per order; unrelated orders proceed in parallel.
    #[default]
    PerOrder,
    /// A single process-wide lock.
    Global,
}

/// Registry of async mutexes keyed by order id.
///
/// Guards are owned, so they release on drop along every exit path,
/// including early returns and unwinding.
pub struct OrderLocks {
    granularity: LockGranularity,
    global: Arc<Mutex<()>>,
    slots: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    pub fn new(granularity: LockGranularity) -> Self {
        Self {
            granularity,
            global: Arc::new(Mutex::new(())),
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn granularity(&self) -> LockGranularity {
        self.granularity
    }

    pub async fn acquire(&self, order_id: Uuid) -> OwnedMutexGuard<()> {
        let slot = match self.granularity {
            LockGranularity::Global => self.global.clone(),
            LockGranularity::PerOrder => {
                let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
                // drop slots nobody holds or waits on
                slots.retain(|_, m| Arc::strong_count(m) > 1);
                slots.entry(order_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            }
        };
        slot.lock_owned().await
    }

    /// Number of orders with a live lock slot.
    pub fn tracked(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl Default for OrderLocks {
    fn default() -> Self {
        Self::new(LockGranularity::PerOrder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_order_is_serialized() {
        let locks = Arc::new(OrderLocks::default());
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_orders_do_not_block() {
        let locks = OrderLocks::default();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_global_blocks_everything() {
        let locks = OrderLocks::new(LockGranularity::Global);
        let _a = locks.acquire(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(Uuid::new_v4())).await;
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let locks = OrderLocks::default();
        for _ in 0..5 {
            let _g = locks.acquire(Uuid::new_v4()).await;
        }
        let _g = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 1);
    }
}
