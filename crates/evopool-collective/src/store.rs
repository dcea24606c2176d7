//! Per-domain pool store.

use crate::pool::DomainPool;
use crate::types::Domain;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// A pool behind its own lock. Holding the lock serializes score
/// recording, reranking and evolution for that domain.
pub type SharedPool = Arc<Mutex<DomainPool>>;

/// All domain pools, keyed by domain. Pools of different domains are
/// locked independently.
#[derive(Debug, Default)]
pub struct PoolStore {
    pools: RwLock<HashMap<Domain, SharedPool>>,
}

impl PoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<SharedPool> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .cloned()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(domain)
    }

    /// Insert a pool, replacing any existing pool for the same domain.
    pub fn insert(&self, pool: DomainPool) -> SharedPool {
        let domain = pool.domain.clone();
        let shared = Arc::new(Mutex::new(pool));
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain, shared.clone());
        shared
    }

    pub fn remove(&self, domain: &str) -> Option<SharedPool> {
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(domain)
    }

    /// Domain names, sorted.
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone every pool, taking each lock in turn.
    pub async fn snapshot(&self) -> Vec<DomainPool> {
        let mut out = Vec::new();
        for domain in self.domains() {
            if let Some(pool) = self.get(&domain) {
                out.push(pool.lock().await.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = PoolStore::new();
        store.insert(DomainPool::new("support", 3, 8));
        store.insert(DomainPool::new("billing", 3, 8));

        assert_eq!(store.domains(), vec!["billing".to_string(), "support".to_string()]);
        let pool = store.get("support").unwrap();
        assert_eq!(pool.lock().await.domain, "support");
        assert!(store.get("legal").is_none());
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_domains_lock_independently() {
        let store = PoolStore::new();
        store.insert(DomainPool::new("support", 3, 8));
        store.insert(DomainPool::new("billing", 3, 8));

        let support = store.get("support").unwrap();
        let _held = support.lock().await;
        let billing = store.get("billing").unwrap();
        assert!(billing.try_lock().is_ok());
        assert!(support.try_lock().is_err());
    }
}
