//! Keyed TTL cache for venue responses.
//!
//! Backs the market-detail and order-book caches in the real venue client.
//! Entries expire after a fixed TTL; a hit returns the cached value without
//! a network call. Writers are serialized by the inner lock, readers purge
//! expired entries lazily.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// A TTL'd value map keyed by `K`.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a live entry, if present and unexpired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// Insert or refresh an entry, evicting any expired neighbors.
    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, (inserted, _)| inserted.elapsed() < ttl);
        entries.insert(key, (Instant::now(), value));
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_within_ttl_miss_after() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(50));
        cache.insert("k".to_string(), 7).await;
        assert_eq!(cache.get(&"k".to_string()).await, Some(7));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn insert_evicts_expired_entries() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(30));
        cache.insert("old".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.insert("new".to_string(), 2).await;
        assert_eq!(cache.len().await, 1);
    }
}
