//! Thread-safe TTL cache with background eviction
//!
//! Passive service used by the quota tracker and the context pack
//! builder. Entries expire at insert time + TTL; a background task
//! sweeps expired entries so memory does not grow with dead keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Default sweep period for the eviction task
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL key/value store
///
/// Values are cloned out on `get`; callers never observe internal
/// references. `close` stops the eviction task and is idempotent.
pub struct Cache<K, V> {
    inner: Arc<RwLock<HashMap<K, Entry<V>>>>,
    token: CancellationToken,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache and spawn its eviction task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(eviction_interval: Duration) -> Self {
        let inner: Arc<RwLock<HashMap<K, Entry<V>>>> = Arc::new(RwLock::new(HashMap::new()));
        let token = CancellationToken::new();

        let sweep_inner = Arc::clone(&inner);
        let sweep_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(eviction_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let mut map = sweep_inner.write().unwrap_or_else(|e| e.into_inner());
                        map.retain(|_, entry| entry.expires_at > now);
                    }
                }
            }
        });

        Self { inner, token }
    }

    /// Insert a value expiring after `ttl`
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
    }

    /// Get a clone of the value iff it has not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Remove a key, returning its value if it was present and live
    #[allow(dead_code)] // Part of the cache contract; exercised in tests
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value)
    }

    /// Number of live entries
    #[allow(dead_code)] // Part of the cache contract; exercised in tests
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|e| e.expires_at > now).count()
    }

    #[allow(dead_code)] // Part of the cache contract; exercised in tests
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries
    #[allow(dead_code)] // Part of the cache contract; exercised in tests
    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Stop the eviction task; safe to call more than once
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl<K, V> Drop for Cache<K, V> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
