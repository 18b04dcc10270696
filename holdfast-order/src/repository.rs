use async_trait::async_trait;
use holdfast_shared::EscrowEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{EscrowResult, StoreError};
use crate::models::OrderAggregate;

/// Persistence of whole order aggregates.
///
/// `save` is the single commit point of a unit of work: it succeeds only if
/// the stored version still equals `agg.version`, then bumps it. A failed save
/// leaves the stored aggregate exactly as it was.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, agg: &mut OrderAggregate) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<Option<OrderAggregate>, StoreError>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<OrderAggregate>, StoreError>;

    async fn save(&self, agg: &mut OrderAggregate) -> Result<(), StoreError>;

    /// Orders the buyer has received but not yet inspected, still open.
    async fn awaiting_inspection(&self) -> Result<Vec<OrderAggregate>, StoreError>;

    async fn list_for_merchant(&self, merchant_id: &str) -> Result<Vec<OrderAggregate>, StoreError>;
}

/// Ends a unit of work: checks cross-phase invariants, saves, then publishes
/// the events the aggregate queued. Nothing is published if the save fails.
pub async fn commit(
    repo: &dyn OrderRepository,
    events: &broadcast::Sender<EscrowEvent>,
    agg: &mut OrderAggregate,
) -> EscrowResult<()> {
    agg.check_invariants()?;
    repo.save(agg).await?;
    for event in agg.take_events() {
        // no subscribers is fine
        let _ = events.send(event);
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryOrderRepository {
    orders: RwLock<HashMap<Uuid, OrderAggregate>>,
    failing: AtomicBool,
}

impl MemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every save fail with a backend error, for rollback tests.
    pub fn fail_saves(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

/// Stored copies never carry unpublished events.
fn snapshot(agg: &OrderAggregate) -> OrderAggregate {
    let mut copy = agg.clone();
    copy.take_events();
    copy
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn insert(&self, agg: &mut OrderAggregate) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&agg.id()) {
            return Err(StoreError::Duplicate(agg.id()));
        }
        if orders.values().any(|o| o.reference() == agg.reference()) {
            return Err(StoreError::Backend(format!("reference {} already in use", agg.reference())));
        }
        agg.version = 1;
        orders.insert(agg.id(), snapshot(agg));
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<OrderAggregate>, StoreError> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<OrderAggregate>, StoreError> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.reference() == reference)
            .cloned())
    }

    async fn save(&self, agg: &mut OrderAggregate) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated write failure".into()));
        }
        let mut orders = self.orders.write().await;
        let stored = orders.get_mut(&agg.id()).ok_or(StoreError::Missing(agg.id()))?;
        if stored.version != agg.version {
            return Err(StoreError::Conflict {
                id: agg.id(),
                expected: agg.version,
                found: stored.version,
            });
        }
        agg.version += 1;
        *stored = snapshot(agg);
        Ok(())
    }

    async fn awaiting_inspection(&self) -> Result<Vec<OrderAggregate>, StoreError> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .filter(|o| {
                o.order.delivery.buyer_confirmed() && !o.order.inspection.inspected() && !o.order.is_closed()
            })
            .cloned()
            .collect())
    }

    async fn list_for_merchant(&self, merchant_id: &str) -> Result<Vec<OrderAggregate>, StoreError> {
        let mut found: Vec<OrderAggregate> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.order.merchant_id == merchant_id)
            .cloned()
            .collect();
        found.sort_by_key(|o| o.order.created_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_aggregate;

    #[tokio::test]
    async fn test_insert_load_and_find() {
        let repo = MemoryOrderRepository::new();
        let mut agg = sample_aggregate();
        repo.insert(&mut agg).await.unwrap();
        assert_eq!(agg.version, 1);

        let loaded = repo.load(agg.id()).await.unwrap().unwrap();
        assert_eq!(loaded.reference(), agg.reference());
        assert!(repo.find_by_reference(agg.reference()).await.unwrap().is_some());
        assert!(repo.find_by_reference("missing").await.unwrap().is_none());
        assert!(matches!(repo.insert(&mut agg).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repo = MemoryOrderRepository::new();
        let mut agg = sample_aggregate();
        repo.insert(&mut agg).await.unwrap();

        let mut first = repo.load(agg.id()).await.unwrap().unwrap();
        let mut second = first.clone();

        first.order.product.name = "first writer".into();
        repo.save(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.order.product.name = "second writer".into();
        let err = repo.save(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));

        let stored = repo.load(agg.id()).await.unwrap().unwrap();
        assert_eq!(stored.order.product.name, "first writer");
    }

    #[tokio::test]
    async fn test_failed_save_leaves_store_untouched() {
        let repo = MemoryOrderRepository::new();
        let mut agg = sample_aggregate();
        repo.insert(&mut agg).await.unwrap();

        repo.fail_saves(true);
        agg.order.product.name = "lost".into();
        assert!(repo.save(&mut agg).await.is_err());
        assert_eq!(agg.version, 1);

        let stored = repo.load(agg.id()).await.unwrap().unwrap();
        assert_ne!(stored.order.product.name, "lost");
    }

    #[tokio::test]
    async fn test_list_for_merchant() {
        let repo = MemoryOrderRepository::new();
        let mut a = sample_aggregate();
        let mut b = sample_aggregate();
        b.order.merchant_id = "someone-else".into();
        repo.insert(&mut a).await.unwrap();
        repo.insert(&mut b).await.unwrap();

        let mine = repo.list_for_merchant(&a.order.merchant_id).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id(), a.id());
    }
}
