use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::{CoreError, CoreResult};

/// Side-channel key-value store holding pending transfers and in-flight
/// provider references until they are reconciled.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// `ttl = None` keeps the value until it is deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()>;

    /// Returns whether a value was removed.
    async fn delete(&self, key: &str) -> CoreResult<bool>;
}

pub async fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> CoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn store_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

/// Process-local store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, to exercise store outages.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expiry)| expiry.map_or(true, |e| e > now))
            .count()
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::StoreError("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, expiry)| match expiry {
            Some(at) if *at <= Instant::now() => None,
            _ => Some(value.clone()),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        self.check_available()?;
        let expiry = ttl.map(|t| Instant::now() + t);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        self.check_available()?;
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryKeyValueStore::new();
        store.set("transfer:abc", "{}", None).await.unwrap();
        assert_eq!(store.get("transfer:abc").await.unwrap().as_deref(), Some("{}"));

        assert!(store.delete("transfer:abc").await.unwrap());
        assert!(!store.delete("transfer:abc").await.unwrap());
        assert!(store.get("transfer:abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryKeyValueStore::new();
        store.set("charge:1", "x", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("charge:1").await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_json_helpers_and_outage() {
        let store = MemoryKeyValueStore::new();
        store_json(&store, "k", &vec![1, 2, 3], None).await.unwrap();
        let back: Option<Vec<i32>> = load_json(&store, "k").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(CoreError::StoreError(_))));
    }
}
