//! Resolver cache
//!
//! Multi-key cache of resolved tenants. One tenant is typically stored under
//! several keys (`id_7`, `code_acme`, ...). Entries use a sliding expiration:
//! every hit pushes the expiry forward. Expiry is measured on the injected
//! [`Clock`], so tests can fast-forward past it.

use crate::clock::Clock;
use crate::code::TenantCode;
use crate::tenant::{Tenant, TenantId};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn id(id: TenantId) -> Self {
        Self(format!("id_{id}"))
    }

    pub fn code(code: &TenantCode) -> Self {
        Self(format!("code_{}", code.cache_form()))
    }

    pub fn user(email: &str) -> Self {
        Self(format!("user_{}", email.trim().to_ascii_lowercase()))
    }

    pub fn domain(domain: &str) -> Self {
        Self(format!("domain_{}", domain.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retention priority when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CachePriority {
    Low,
    Normal,
    #[default]
    High,
    /// Only removed by expiry or explicit eviction
    NeverRemove,
}

#[derive(Debug, Clone)]
struct Entry {
    tenant: Arc<Tenant>,
    last_access: DateTime<Utc>,
    priority: CachePriority,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Tenant cache with sliding expiration
#[derive(Debug)]
pub struct ResolverCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    clock: Arc<dyn Clock>,
    sliding_expiration: TimeDelta,
    capacity: usize,
    priority: CachePriority,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolverCache {
    /// Default sliding expiration in minutes.
    pub const DEFAULT_EXPIRATION_MINUTES: i64 = 30;

    /// Default maximum number of keys.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            sliding_expiration: TimeDelta::minutes(Self::DEFAULT_EXPIRATION_MINUTES),
            capacity: Self::DEFAULT_CAPACITY,
            priority: CachePriority::High,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_sliding_expiration(mut self, expiration: TimeDelta) -> Self {
        self.sliding_expiration = expiration;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Priority given to new entries.
    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn sliding_expiration(&self) -> TimeDelta {
        self.sliding_expiration
    }

    fn is_expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.last_access >= self.sliding_expiration
    }

    /// Look up `key`, refreshing its expiry on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Tenant>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.tenant));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `tenant` under every key in `keys`.
    pub fn insert(&self, keys: &[CacheKey], tenant: Arc<Tenant>) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        for key in keys {
            if !entries.contains_key(key) && entries.len() >= self.capacity {
                self.make_room(&mut entries, now);
            }
            entries.insert(
                key.clone(),
                Entry {
                    tenant: Arc::clone(&tenant),
                    last_access: now,
                    priority: self.priority,
                },
            );
        }
    }

    /// Drop expired entries, then the least recently used entry of the
    /// lowest evictable priority.
    fn make_room(&self, entries: &mut HashMap<CacheKey, Entry>, now: DateTime<Utc>) {
        entries.retain(|_, e| !self.is_expired(e, now));
        if entries.len() < self.capacity {
            return;
        }

        let victim = entries
            .iter()
            .filter(|(_, e)| e.priority != CachePriority::NeverRemove)
            .min_by_key(|(_, e)| (e.priority, e.last_access))
            .map(|(k, _)| k.clone());
        if let Some(victim) = victim {
            entries.remove(&victim);
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every key pointing at tenant `id`. Returns the number removed.
    pub fn evict_tenant(&self, id: TenantId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.tenant.id() != id);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tenant::AuditStamp;

    fn tenant(id: TenantId, code: &str) -> Arc<Tenant> {
        Arc::new(
            Tenant::new(
                id,
                "Test",
                TenantCode::parse(code).unwrap(),
                &AuditStamp::system(Utc::now()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_keys() {
        let code = TenantCode::parse("ACME").unwrap();
        assert_eq!(CacheKey::id(7).as_str(), "id_7");
        assert_eq!(CacheKey::code(&code).as_str(), "code_acme");
        assert_eq!(CacheKey::user(" Jane@Acme.com ").as_str(), "user_jane@acme.com");
        assert_eq!(CacheKey::domain("Portal.Acme.com").to_string(), "domain_portal.acme.com");
    }

    #[test]
    fn test_multi_key_insert_shares_snapshot() {
        let cache = ResolverCache::new(Arc::new(ManualClock::starting_now()));
        let acme = tenant(7, "ACME");
        let keys = [CacheKey::id(7), CacheKey::code(acme.code())];
        cache.insert(&keys, Arc::clone(&acme));

        let by_id = cache.get(&keys[0]).unwrap();
        let by_code = cache.get(&keys[1]).unwrap();
        assert!(Arc::ptr_eq(&by_id, &by_code));
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_sliding_expiration() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResolverCache::new(clock.clone());
        cache.insert(&[CacheKey::id(1)], tenant(1, "ACME"));

        clock.advance(TimeDelta::minutes(20));
        assert!(cache.get(&CacheKey::id(1)).is_some());

        // The hit above slid the window forward.
        clock.advance(TimeDelta::minutes(20));
        assert!(cache.get(&CacheKey::id(1)).is_some());

        clock.advance(TimeDelta::minutes(30));
        assert!(cache.get(&CacheKey::id(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_tenant_removes_all_keys() {
        let cache = ResolverCache::new(Arc::new(ManualClock::starting_now()));
        let acme = tenant(7, "ACME");
        cache.insert(&[CacheKey::id(7), CacheKey::code(acme.code()), CacheKey::user("a@acme.com")], acme);
        cache.insert(&[CacheKey::id(8)], tenant(8, "GLOBEX"));

        assert_eq!(cache.evict_tenant(7), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_lowest_priority_lru() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResolverCache::new(clock.clone())
            .with_capacity(2)
            .with_priority(CachePriority::Normal);

        cache.insert(&[CacheKey::id(1)], tenant(1, "AAA"));
        clock.advance(TimeDelta::seconds(1));
        cache.insert(&[CacheKey::id(2)], tenant(2, "BBB"));
        clock.advance(TimeDelta::seconds(1));
        cache.get(&CacheKey::id(1));
        cache.insert(&[CacheKey::id(3)], tenant(3, "CCC"));

        assert!(cache.get(&CacheKey::id(1)).is_some());
        assert!(cache.get(&CacheKey::id(2)).is_none());
        assert!(cache.get(&CacheKey::id(3)).is_some());
    }
}
