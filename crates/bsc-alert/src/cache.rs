//! Tiered cache layer: hot LRU, warm TTL maps, persistent Redis.
//!
//! Reads try hot → warm → Redis → source; writes populate every cheaper
//! tier. Entries are only ever published fully populated. Concurrent misses
//! for the same key serialize through a per-key single-flight lock: the
//! winner re-checks the cache under the lock, resolves upstream once, and
//! publishes through the cache for every waiter.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use lru::LruCache;
use redis::AsyncCommands;
use tokio::sync::OwnedMutexGuard;

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::types::{PairMeta, ReceiptRecord};

/// Deadline for every Redis round-trip.
const KV_TIMEOUT: Duration = Duration::from_secs(1);

/// Hot tier capacity (most-accessed pair metadata).
const HOT_PAIR_CAPACITY: usize = 1024;

// Warm tier TTLs per kind.
const RECEIPT_TTL: Duration = Duration::from_secs(300);
const PAIR_META_TTL: Duration = Duration::from_secs(3600);
const TOKEN_META_TTL: Duration = Duration::from_secs(3600);
const NO_DATA_TTL: Duration = Duration::from_secs(600);

// Persistent tier TTLs (seconds).
pub const KV_TOKEN_META_TTL_SECS: u64 = 86_400;
pub const KV_FOURMEME_TTL_SECS: u64 = 7 * 86_400;
pub const KV_NO_DATA_TTL_SECS: u64 = 600;
pub const KV_RETRY_TTL_SECS: u64 = 3600;

/// Redis key naming, kept in one place.
pub mod keys {
    use alloy::primitives::Address;

    pub const FOURMEME_SET: &str = "bsc:fourmeme_tokens";
    pub const NON_FOURMEME_SET: &str = "bsc:non_fourmeme_tokens";
    pub const THRESHOLDS: &str = "bsc:monitor:config:thresholds";

    pub fn cooldown(token: &Address) -> String {
        format!("bsc:cooldown:{token}")
    }

    pub fn no_data_pair(pair: &Address) -> String {
        format!("bsc:no_data_pair:{pair}")
    }

    pub fn retry(token: &Address) -> String {
        format!("bsc:retry:{token}")
    }

    pub const RETRY_PREFIX: &str = "bsc:retry:";

    pub fn pair_tokens(pair: &Address) -> String {
        format!("bsc:pair:{pair}:tokens")
    }

    pub fn token_decimals(token: &Address) -> String {
        format!("bsc:token:{token}:decimals")
    }

    pub fn token_symbol(token: &Address) -> String {
        format!("bsc:token:{token}:symbol")
    }
}

// ---------------------------------------------------------------------------
// Persistent tier: Redis
// ---------------------------------------------------------------------------

/// Thin async Redis wrapper with a hard per-op deadline.
#[derive(Clone)]
pub struct KvStore {
    conn: redis::aio::MultiplexedConnection,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(
            Duration::from_secs(5),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| EngineError::Transient("redis connect timed out".into()))??;
        Ok(Self { conn })
    }

    async fn bounded<T>(
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(KV_TIMEOUT, fut)
            .await
            .map_err(|_| EngineError::Transient("redis op timed out".into()))?
            .map_err(EngineError::from)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.conn.clone();
        Self::bounded(async move { conn.get(key).await }).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let (key, value) = (key.to_string(), value.to_string());
        Self::bounded(async move { conn.set_ex(key, value, ttl_secs).await }).await
    }

    pub async fn del(&self, key: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        Self::bounded(async move { conn.del(key).await }).await
    }

    /// Atomic `SET key value NX EX ttl`. Returns true iff the key was created.
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        let (key, value) = (key.to_string(), value.to_string());
        let reply: Option<String> = Self::bounded(async move {
            redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await
        })
        .await?;
        Ok(reply.is_some())
    }

    pub async fn sadd_with_ttl(
        &self,
        set_key: &str,
        member: &str,
        ttl_secs: u64,
    ) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let (set_key, member) = (set_key.to_string(), member.to_string());
        Self::bounded(async move {
            let _: () = conn.sadd(&set_key, &member).await?;
            conn.expire(&set_key, ttl_secs as i64).await
        })
        .await
    }

    pub async fn sismember(&self, set_key: &str, member: &str) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        let (set_key, member) = (set_key.to_string(), member.to_string());
        Self::bounded(async move { conn.sismember(set_key, member).await }).await
    }

    /// Collect keys matching `pattern` via cursor SCAN. Bounded result sets
    /// only; used for the retry queue namespace.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.clone();
        let pattern = pattern.to_string();
        Self::bounded(async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            Ok(keys)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Warm tier: sharded TTL map
// ---------------------------------------------------------------------------

/// Bounded TTL map over a sharded concurrent hash map.
///
/// Expired entries are dropped on read; a full sweep runs when an insert
/// finds the map over capacity.
pub struct TtlMap<K: Eq + Hash + Clone, V: Clone> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlMap<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (inserted, value) = entry.value();
                if now.duration_since(*inserted) < self.ttl {
                    return Some(value.clone());
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

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub(crate) fn insert_at(&self, key: K, value: V, now: Instant) {
        if self.entries.len() >= self.max_entries {
            self.sweep(now);
        }
        self.entries.insert(key, (now, value));
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self, now: Instant) {
        self.entries
            .retain(|_, (inserted, _)| now.duration_since(*inserted) < self.ttl);
    }
}

// ---------------------------------------------------------------------------
// Cache manager
// ---------------------------------------------------------------------------

pub struct CacheManager {
    pub kv: KvStore,
    hot_pairs: Mutex<LruCache<Address, PairMeta>>,
    warm_pairs: TtlMap<Address, PairMeta>,
    pub receipts: TtlMap<B256, Arc<ReceiptRecord>>,
    pub token_decimals: TtlMap<Address, u8>,
    pub token_symbols: TtlMap<Address, String>,
    pub no_data_pairs: TtlMap<Address, ()>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    metrics: Arc<EngineMetrics>,
}

impl CacheManager {
    pub fn new(kv: KvStore, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            kv,
            hot_pairs: Mutex::new(LruCache::new(
                NonZeroUsize::new(HOT_PAIR_CAPACITY).expect("nonzero capacity"),
            )),
            warm_pairs: TtlMap::new(PAIR_META_TTL, 50_000),
            receipts: TtlMap::new(RECEIPT_TTL, 20_000),
            token_decimals: TtlMap::new(TOKEN_META_TTL, 50_000),
            token_symbols: TtlMap::new(TOKEN_META_TTL, 50_000),
            no_data_pairs: TtlMap::new(NO_DATA_TTL, 20_000),
            flights: DashMap::new(),
            metrics,
        }
    }

    // -- Pair metadata ------------------------------------------------------

    /// Read pair metadata from the in-memory tiers, promoting warm hits.
    pub fn pair_meta(&self, pair: &Address) -> Option<PairMeta> {
        {
            let mut hot = self.hot_pairs.lock().expect("hot pair lock poisoned");
            if let Some(meta) = hot.get(pair) {
                self.metrics.cache_hits.with_label_values(&["pair"]).inc();
                return Some(meta.clone());
            }
        }
        if let Some(meta) = self.warm_pairs.get(pair) {
            self.metrics.cache_hits.with_label_values(&["pair"]).inc();
            self.hot_pairs
                .lock()
                .expect("hot pair lock poisoned")
                .put(*pair, meta.clone());
            return Some(meta);
        }
        self.metrics.cache_misses.with_label_values(&["pair"]).inc();
        None
    }

    /// Publish fully resolved pair metadata to the hot and warm tiers.
    pub fn store_pair_meta(&self, meta: PairMeta) {
        self.warm_pairs.insert(meta.pair, meta.clone());
        self.hot_pairs
            .lock()
            .expect("hot pair lock poisoned")
            .put(meta.pair, meta);
    }

    // -- Single-flight ------------------------------------------------------

    /// Acquire the per-key resolution lock.
    ///
    /// The caller must re-check the cache after acquiring: a waiter that
    /// blocked here will usually find the winner's result already published.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop a resolution lock once the result is published. Late waiters
    /// take a fresh lock and hit the cache immediately.
    pub fn release_key(&self, key: &str) {
        self.flights.remove(key);
    }

    // -- Gauges -------------------------------------------------------------

    /// Refresh the per-kind size gauges (called from the health loop).
    pub fn update_size_gauges(&self) {
        let m = &self.metrics;
        m.cache_size
            .with_label_values(&["pair_warm"])
            .set(self.warm_pairs.len() as i64);
        m.cache_size
            .with_label_values(&["receipt"])
            .set(self.receipts.len() as i64);
        m.cache_size
            .with_label_values(&["token_decimals"])
            .set(self.token_decimals.len() as i64);
        m.cache_size
            .with_label_values(&["token_symbols"])
            .set(self.token_symbols.len() as i64);
        m.cache_size
            .with_label_values(&["no_data_pair"])
            .set(self.no_data_pairs.len() as i64);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_map_expiry() {
        let map: TtlMap<u32, &'static str> = TtlMap::new(Duration::from_secs(60), 100);
        let t0 = Instant::now();
        map.insert_at(1, "a", t0);

        assert_eq!(map.get_at(&1, t0 + Duration::from_secs(30)), Some("a"));
        assert_eq!(map.get_at(&1, t0 + Duration::from_secs(61)), None);
        // Expired entry was removed on read.
        assert!(map.is_empty());
    }

    #[test]
    fn test_ttl_map_sweep_on_capacity() {
        let map: TtlMap<u32, u32> = TtlMap::new(Duration::from_secs(60), 4);
        let t0 = Instant::now();
        for i in 0..4 {
            map.insert_at(i, i, t0);
        }
        // All four live; the next insert past the TTL horizon sweeps them.
        map.insert_at(99, 99, t0 + Duration::from_secs(120));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_at(&99, t0 + Duration::from_secs(121)), Some(99));
    }

    #[tokio::test]
    async fn test_single_flight_serializes_resolution() {
        use std::sync::atomic::{AtomicU32, Ordering};

        // A CacheManager without Redis is not constructible; exercise the
        // flight table directly through the same lock-table pattern.
        let flights: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>> = Arc::new(DashMap::new());
        let resolved = Arc::new(AtomicU32::new(0));
        let cache: Arc<TtlMap<String, u32>> = Arc::new(TtlMap::new(Duration::from_secs(60), 16));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let resolved = resolved.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = "k".to_string();
                if cache.get(&key).is_some() {
                    return;
                }
                let lock = flights
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone();
                let _guard = lock.lock().await;
                // Re-check under the lock: only the winner resolves.
                if cache.get(&key).is_none() {
                    resolved.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    cache.insert(key.clone(), 42);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(42));
    }

    #[test]
    fn test_key_naming() {
        let addr: Address = "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c"
            .parse()
            .unwrap();
        assert_eq!(keys::cooldown(&addr), format!("bsc:cooldown:{addr}"));
        assert!(keys::cooldown(&addr).starts_with("bsc:cooldown:0x"));
        assert!(keys::retry(&addr).starts_with(keys::RETRY_PREFIX));
        assert_eq!(keys::THRESHOLDS, "bsc:monitor:config:thresholds");
    }
}
