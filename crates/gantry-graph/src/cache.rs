//! Memoizes compiled graphs per configuration fingerprint.
//!
//! Eviction is lazy (checked at access time) with an explicit [`sweep`]
//! available for a full pass. There is deliberately no per-fingerprint build
//! lock: concurrent misses for the same fingerprint may each invoke the
//! builder and the last successful build wins. A failed build is never
//! cached and is retried on the next access.
//!
//! [`sweep`]: GraphBuildCache::sweep

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, instrument};

use gantry_core::ids::GraphId;

use crate::fingerprint::fingerprint;
use crate::{CompiledGraph, GraphError, GraphFactory};

/// Fallback TTL when no (or an invalid) override is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Env var carrying the TTL override, in milliseconds.
pub const TTL_ENV_VAR: &str = "GANTRY_GRAPH_CACHE_TTL_MS";

/// Resolve the cache TTL from an optional raw override string.
/// Non-numeric or non-positive values fall back to the five-minute default.
pub fn ttl_from_override(raw: Option<&str>) -> Duration {
    match raw.and_then(|s| s.trim().parse::<i64>().ok()) {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => DEFAULT_TTL,
    }
}

/// Resolve the cache TTL from the environment.
pub fn ttl_from_env() -> Duration {
    ttl_from_override(std::env::var(TTL_ENV_VAR).ok().as_deref())
}

struct Entry {
    graph: Arc<dyn CompiledGraph>,
    graph_id: GraphId,
    description: String,
    built_at: Instant,
    last_access: Instant,
    hits: u64,
}

/// Per-entry view exposed for operability.
#[derive(Clone, Debug)]
pub struct CacheEntryInfo {
    pub fingerprint: String,
    pub graph_id: GraphId,
    pub description: String,
    pub age: Duration,
    pub hits: u64,
}

/// Aggregate cache counters.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub entries: Vec<CacheEntryInfo>,
}

pub struct GraphBuildCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GraphBuildCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached graph for (graph id, config), building it on miss.
    #[instrument(skip(self, config, factory), fields(graph_id = %graph_id))]
    pub async fn get_or_build(
        &self,
        graph_id: &GraphId,
        config: &Value,
        factory: &dyn GraphFactory,
    ) -> Result<Arc<dyn CompiledGraph>, GraphError> {
        let key = fingerprint(graph_id, config);

        if let Some(graph) = self.lookup(&key) {
            return Ok(graph);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %key, "cache miss, building graph");

        // Concurrent misses for the same key race to this insert; the last
        // successful build wins. Errors propagate uncached.
        let graph = factory.build(graph_id, config).await?;
        let now = Instant::now();
        self.entries.insert(
            key,
            Entry {
                graph: graph.clone(),
                graph_id: graph_id.clone(),
                description: describe(graph_id, config),
                built_at: now,
                last_access: now,
                hits: 0,
            },
        );

        Ok(graph)
    }

    /// Live lookup with lazy eviction: an expired entry is removed and
    /// reported as absent.
    fn lookup(&self, key: &str) -> Option<Arc<dyn CompiledGraph>> {
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.built_at.elapsed() < self.ttl {
                    entry.hits += 1;
                    entry.last_access = Instant::now();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.graph.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Remove all expired entries at once. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.built_at.elapsed() < ttl);
        before - self.entries.len()
    }

    /// Drop every entry regardless of age.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .iter()
            .map(|entry| CacheEntryInfo {
                fingerprint: entry.key().clone(),
                graph_id: entry.graph_id.clone(),
                description: entry.description.clone(),
                age: entry.built_at.elapsed(),
                hits: entry.hits,
            })
            .collect();

        CacheStats {
            size: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

fn describe(graph_id: &GraphId, config: &Value) -> String {
    match config.get("model").and_then(Value::as_str) {
        Some(model) => format!("{graph_id} ({model})"),
        None => graph_id.to_string(),
    }
}
