//! Compiled plan caching
//!
//! Uses moka for thread-safe concurrent caching. Concurrent misses on the same
//! key are coalesced, so one plan per key is ever retained.

use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ast::QueryId;
use crate::data::BoundKind;
use crate::translate::{CompiledPlan, DistinctMode, PlanShape};

/// Cache key for compiled plans
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PlanKey {
    pub query: QueryId,
    pub mode: DistinctMode,
    pub shape: PlanShape,
    /// Kinds of the external names the query uses
    pub signature: Vec<(String, BoundKind)>,
}

/// Plan cache with hit/miss accounting and per-query invalidation
pub struct PlanCache {
    cache: Cache<PlanKey, Arc<CompiledPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl: Option<Duration>,
}

impl PlanCache {
    pub fn new(max_entries: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_entries);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn get(&self, key: &PlanKey) -> Option<Arc<CompiledPlan>> {
        self.cache.get(key)
    }

    /// Return the cached plan for `key` or build it with `compile`
    ///
    /// A failed compilation is not cached.
    pub fn get_or_compile<E, F>(&self, key: PlanKey, compile: F) -> Result<Arc<CompiledPlan>, E>
    where
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<Arc<CompiledPlan>, E>,
    {
        if let Some(plan) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(plan);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(query = %key.query, mode = ?key.mode, shape = ?key.shape, "plan cache miss");

        self.cache
            .try_get_with(key, compile)
            .map_err(|e: Arc<E>| (*e).clone())
    }

    /// Invalidate every plan compiled from one query tree
    pub fn invalidate_query(&self, query: QueryId) {
        let keys: Vec<PlanKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.query == query)
            .map(|(key, _)| (*key).clone())
            .collect();

        tracing::info!(query = %query, plans = keys.len(), "invalidating cached plans");
        for key in keys {
            self.cache.invalidate(&key);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Number of cached plans, after pending maintenance has run
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.entry_count(),
            ttl_secs: self.ttl.map(|ttl| ttl.as_secs()),
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(1000, None)
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub entry_count: u64,
    pub ttl_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::QueryTree;
    use crate::translate::sql::Select;

    fn plan(query: QueryId) -> Arc<CompiledPlan> {
        Arc::new(CompiledPlan {
            query,
            mode: DistinctMode::Auto,
            shape: PlanShape::Rows,
            sql: "SELECT 1".to_string(),
            params: Vec::new(),
            distinct: false,
            columns: vec!["1".to_string()],
            decoders: Vec::new(),
            tuple: false,
            positions: Vec::new(),
            select: Select::default(),
        })
    }

    fn key(query: QueryId, mode: DistinctMode) -> PlanKey {
        PlanKey {
            query,
            mode,
            shape: PlanShape::Rows,
            signature: Vec::new(),
        }
    }

    fn query_id() -> QueryId {
        QueryTree::parse("s for s in Student").unwrap().id()
    }

    #[test]
    fn test_hit_returns_same_plan() {
        let cache = PlanCache::default();
        let id = query_id();

        let first = cache
            .get_or_compile::<String, _>(key(id, DistinctMode::Auto), || Ok(plan(id)))
            .unwrap();
        let second = cache
            .get_or_compile::<String, _>(key(id, DistinctMode::Auto), || {
                Err("must not recompile".to_string())
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_modes_are_separate_entries() {
        let cache = PlanCache::default();
        let id = query_id();
        cache
            .get_or_compile::<String, _>(key(id, DistinctMode::Auto), || Ok(plan(id)))
            .unwrap();
        cache
            .get_or_compile::<String, _>(key(id, DistinctMode::WithoutDistinct), || Ok(plan(id)))
            .unwrap();
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = PlanCache::default();
        let id = query_id();
        let err = cache
            .get_or_compile::<String, _>(key(id, DistinctMode::Auto), || Err("boom".to_string()))
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.get(&key(id, DistinctMode::Auto)).is_none());
    }

    #[test]
    fn test_invalidate_query() {
        let cache = PlanCache::default();
        let (a, b) = (query_id(), query_id());
        for id in [a, b] {
            cache
                .get_or_compile::<String, _>(key(id, DistinctMode::Auto), || Ok(plan(id)))
                .unwrap();
        }

        cache.invalidate_query(a);

        assert!(cache.get(&key(a, DistinctMode::Auto)).is_none());
        assert!(cache.get(&key(b, DistinctMode::Auto)).is_some());
    }
}
