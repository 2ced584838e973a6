//! Process-wide cache of derived read-only aggregates.
//!
//! Entries are keyed by (cache name, scope) where the scope is either a
//! single source namespace or `None` for the all-sources aggregate. The
//! aggregates are not incrementally maintainable without risking drift, so
//! invalidation is whole-namespace: every catalog mutation invalidates all
//! entries for the mutated record's namespace plus every all-sources entry,
//! synchronously, before the mutating call returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Scope generation at compute time. An entry whose generation lags the
    /// scope's current generation was computed against pre-mutation state
    /// and is never served.
    generation: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(String, Option<String>), Entry>,
    generations: HashMap<Option<String>, u64>,
}

#[derive(Default)]
pub struct AggregateCache {
    inner: RwLock<CacheInner>,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation for a scope. Bumped on every invalidation.
    fn generation(&self, scope: Option<&str>) -> u64 {
        let inner = self.inner.read().unwrap();
        inner
            .generations
            .get(&scope.map(str::to_string))
            .copied()
            .unwrap_or(0)
    }

    pub fn get(&self, name: &str, scope: Option<&str>) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        let key = (name.to_string(), scope.map(str::to_string));
        let current = inner.generations.get(&key.1).copied().unwrap_or(0);
        inner
            .entries
            .get(&key)
            .filter(|e| e.generation == current)
            .map(|e| e.value.clone())
    }

    pub fn put(&self, name: &str, scope: Option<&str>, value: Value, generation: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.insert(
            (name.to_string(), scope.map(str::to_string)),
            Entry { value, generation },
        );
    }

    /// Serve the cached value, or run `compute` and cache its result. If an
    /// invalidation races the computation, the result is stored with the
    /// pre-invalidation generation and the next read recomputes.
    pub async fn get_or_compute<F, Fut>(
        &self,
        name: &str,
        scope: Option<&str>,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(hit) = self.get(name, scope) {
            return Ok(hit);
        }
        let generation = self.generation(scope);
        let value = compute().await?;
        self.put(name, scope, value.clone(), generation);
        Ok(value)
    }

    /// Invalidate every entry scoped to `namespace` and every all-sources
    /// entry. Called by the catalog store inside its mutation critical
    /// section — never lazily, never on a timer.
    pub fn invalidate_namespace(&self, namespace: &str) {
        let mut inner = self.inner.write().unwrap();
        for scope in [Some(namespace.to_string()), None] {
            *inner.generations.entry(scope.clone()).or_insert(0) += 1;
            inner.entries.retain(|(_, s), _| *s != scope);
        }
        debug!(namespace, "Invalidated aggregate caches");
    }

    /// Drop everything. Used by administrative bulk resets.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write().unwrap();
        let scopes: Vec<Option<String>> = inner
            .entries
            .keys()
            .map(|(_, s)| s.clone())
            .chain(inner.generations.keys().cloned())
            .collect();
        for scope in scopes {
            *inner.generations.entry(scope).or_insert(0) += 1;
        }
        inner.entries.clear();
    }
}
