use async_trait::async_trait;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

use crate::{error::Result, utils::TimeSource};

/// Default number of keys the local store keeps before evicting the least recently used
pub const DEFAULT_CACHE_SIZE: usize = 5000;

/// Counter state returned by a store after one increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Hits recorded in the current window, including this one
    pub current: u64,
    /// Milliseconds until the window resets
    pub ttl_ms: u64,
}

/// Parameters of one increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrRequest {
    pub time_window_ms: u64,
    pub max: u64,
}

/// Options for a route-scoped view of a store
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    /// Appended to the parent's key prefix
    pub scope: String,
    /// Overrides the parent's setting when present
    pub continue_exceeding: Option<bool>,
}

/// Backend holding per-key hit counters.
///
/// `incr` must be atomic per key: concurrent increments of the same key each
/// observe a distinct `current`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit against `key` and report the window state
    async fn incr(&self, key: &str, request: IncrRequest) -> Result<Counter>;

    /// A view of the same backend whose keys live under an extended prefix
    fn child(&self, options: &ChildOptions) -> Arc<dyn CounterStore>;

    /// Check the backend is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    current: u64,
    window_start_ms: u64,
    window_ms: u64,
}

impl LocalEntry {
    fn expires_at(&self) -> u64 {
        self.window_start_ms.saturating_add(self.window_ms)
    }
}

type Entries = Mutex<LruCache<String, LocalEntry>>;

/// In-process store backed by a bounded LRU map.
///
/// Children share the parent's map and differ only in key prefix, so every
/// route of a limiter is bounded by the same cache size.
pub struct LocalStore {
    entries: Arc<Entries>,
    prefix: String,
    continue_exceeding: bool,
    time_source: TimeSource,
}

impl LocalStore {
    pub fn new(cache_size: usize) -> Self {
        Self::with_time_source(cache_size, TimeSource::new())
    }

    pub fn with_time_source(cache_size: usize, time_source: TimeSource) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            prefix: String::new(),
            continue_exceeding: false,
            time_source,
        }
    }

    /// Number of tracked keys, including expired ones not yet swept
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry and return how many were removed
    pub async fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.time_source.now_ms()).await
    }

    /// Sweep expired entries every `period` until the store is dropped
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let entries: Weak<Entries> = Arc::downgrade(&self.entries);
        let time_source = self.time_source;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let evicted = sweep_entries(&entries, time_source.now_ms()).await;
                if evicted > 0 {
                    debug!(evicted, "Swept expired local counters");
                }
            }
        })
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

async fn sweep_entries(entries: &Entries, now: u64) -> usize {
    let mut entries = entries.lock().await;
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.expires_at() <= now)
        .map(|(key, _)| key.clone())
        .collect();

    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn incr(&self, key: &str, request: IncrRequest) -> Result<Counter> {
        let key = format!("{}{}", self.prefix, key);
        let now = self.time_source.now_ms();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            if entry.expires_at() > now {
                entry.current = entry.current.saturating_add(1);
                if self.continue_exceeding && entry.current > request.max {
                    entry.window_start_ms = now;
                    entry.window_ms = request.time_window_ms;
                }
                return Ok(Counter {
                    current: entry.current,
                    ttl_ms: entry.expires_at() - now,
                });
            }
        }

        entries.put(
            key,
            LocalEntry {
                current: 1,
                window_start_ms: now,
                window_ms: request.time_window_ms,
            },
        );
        Ok(Counter {
            current: 1,
            ttl_ms: request.time_window_ms,
        })
    }

    fn child(&self, options: &ChildOptions) -> Arc<dyn CounterStore> {
        Arc::new(LocalStore {
            entries: self.entries.clone(),
            prefix: format!("{}{}", self.prefix, options.scope),
            continue_exceeding: options
                .continue_exceeding
                .unwrap_or(self.continue_exceeding),
            time_source: self.time_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: IncrRequest = IncrRequest {
        time_window_ms: 1000,
        max: 2,
    };

    #[tokio::test(start_paused = true)]
    async fn test_window_counting_and_reset() {
        let store = LocalStore::default();

        assert_eq!(store.incr("k", WINDOW).await.unwrap(), Counter { current: 1, ttl_ms: 1000 });
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(store.incr("k", WINDOW).await.unwrap(), Counter { current: 2, ttl_ms: 700 });
        assert_eq!(store.incr("k", WINDOW).await.unwrap().current, 3);

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(store.incr("k", WINDOW).await.unwrap(), Counter { current: 1, ttl_ms: 1000 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_exceeding_rearms_window() {
        let store = LocalStore::default().child(&ChildOptions {
            scope: "route-".to_string(),
            continue_exceeding: Some(true),
        });

        store.incr("k", WINDOW).await.unwrap();
        store.incr("k", WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;

        let counter = store.incr("k", WINDOW).await.unwrap();
        assert_eq!(counter, Counter { current: 3, ttl_ms: 1000 });

        tokio::time::advance(Duration::from_millis(600)).await;
        let counter = store.incr("k", WINDOW).await.unwrap();
        assert_eq!(counter, Counter { current: 4, ttl_ms: 1000 });
    }

    #[tokio::test]
    async fn test_children_are_isolated_by_prefix() {
        let root = LocalStore::default();
        let a = root.child(&ChildOptions {
            scope: "GET/a-".to_string(),
            ..Default::default()
        });
        let b = root.child(&ChildOptions {
            scope: "GET/b-".to_string(),
            ..Default::default()
        });

        a.incr("k", WINDOW).await.unwrap();
        a.incr("k", WINDOW).await.unwrap();
        assert_eq!(b.incr("k", WINDOW).await.unwrap().current, 1);
        assert_eq!(root.incr("k", WINDOW).await.unwrap().current, 1);
        assert_eq!(root.len().await, 3);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = LocalStore::new(2);

        store.incr("a", WINDOW).await.unwrap();
        store.incr("b", WINDOW).await.unwrap();
        store.incr("c", WINDOW).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.incr("a", WINDOW).await.unwrap().current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_entries() {
        let store = LocalStore::default();
        store.incr("short", IncrRequest { time_window_ms: 100, max: 1 }).await.unwrap();
        store.incr("long", IncrRequest { time_window_ms: 10_000, max: 1 }).await.unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let store = LocalStore::default();
        let handle = store.spawn_sweeper(Duration::from_millis(500));
        store.incr("k", IncrRequest { time_window_ms: 100, max: 1 }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.is_empty().await);

        drop(store);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_distinct() {
        let store = Arc::new(LocalStore::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.incr("k", WINDOW).await.unwrap().current
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }
}
