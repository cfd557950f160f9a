//! Deduplicating loader
//!
//! A single-flight cache keyed by resource identity. For a given key at most
//! one producer runs at a time; every caller that arrives while it runs
//! receives the same result. Successful values are kept for the lifetime of
//! the loader. A failed entry is removed before its failure reaches any
//! waiter, so the next call starts over with a fresh producer.

use crate::fault::Fault;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, Fault>>>;

enum CacheEntry<V> {
    Pending {
        generation: u64,
        result: SharedResult<V>,
    },
    Resolved(V),
}

struct LoaderInner<V> {
    name: &'static str,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    generations: AtomicU64,
}

/// Single-flight, memoizing loader
///
/// Cloning is cheap; clones share the same cache.
pub struct Loader<V> {
    inner: Arc<LoaderInner<V>>,
}

impl<V> Clone for Loader<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Loader<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty loader; `name` labels its log lines
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                name,
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Get the value for `key`, running `producer` only if no entry exists
    ///
    /// The producer's future is driven by whichever callers are awaiting it.
    /// If every caller goes away before it settles, the entry stays pending
    /// and the next caller resumes it.
    pub async fn get<F, Fut>(&self, key: impl Into<String>, producer: F) -> Result<V, Fault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Fault>> + Send + 'static,
    {
        let key = key.into();

        let pending = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get(&key) {
                Some(CacheEntry::Resolved(value)) => {
                    tracing::trace!(loader = self.inner.name, key = %key, "Cache hit");
                    return Ok(value.clone());
                }
                Some(CacheEntry::Pending { result, .. }) => {
                    tracing::trace!(loader = self.inner.name, key = %key, "Joining in-flight load");
                    result.clone()
                }
                None => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                    let work = producer();
                    let result = settle(Arc::downgrade(&self.inner), key.clone(), generation, work)
                        .boxed()
                        .shared();
                    entries.insert(
                        key.clone(),
                        CacheEntry::Pending {
                            generation,
                            result: result.clone(),
                        },
                    );
                    result
                }
            }
        };

        pending.await
    }

    /// True if `key` is cached or in flight
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().await.contains_key(key)
    }

    /// The cached value for `key`, if it has resolved
    pub async fn peek(&self, key: &str) -> Option<V> {
        match self.inner.entries.lock().await.get(key) {
            Some(CacheEntry::Resolved(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Forget `key` so the next call runs its producer again
    ///
    /// Callers already awaiting an in-flight load still receive its result.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.inner.entries.lock().await.remove(key).is_some()
    }

    /// Number of cached or in-flight entries
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// True if nothing is cached or in flight
    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }
}

/// Run the producer and settle its entry before anyone sees the result
async fn settle<V, Fut>(
    inner: Weak<LoaderInner<V>>,
    key: String,
    generation: u64,
    work: Fut,
) -> Result<V, Fault>
where
    V: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<V, Fault>> + Send + 'static,
{
    let result = work.await;

    let Some(inner) = inner.upgrade() else {
        return result;
    };
    let mut entries = inner.entries.lock().await;
    let owns_entry = matches!(
        entries.get(&key),
        Some(CacheEntry::Pending { generation: g, .. }) if *g == generation
    );
    if owns_entry {
        match &result {
            Ok(value) => {
                entries.insert(key, CacheEntry::Resolved(value.clone()));
            }
            Err(fault) => {
                entries.remove(&key);
                tracing::debug!(
                    loader = inner.name,
                    key = %key,
                    error = %fault,
                    "Load failed, entry evicted"
                );
            }
        }
    }

    result
}
