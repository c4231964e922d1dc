//! Per-token cooldown and transaction dedup.
//!
//! A cooldown claim is one atomic `SET key v NX EX ttl`, never
//! read-then-write. Release is one unconditional `DEL`, safe to call any
//! number of times. Dedup is an in-memory `(tx_hash, log_index)` set with a
//! 10-minute horizon, swept opportunistically.

use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use crate::cache::{keys, KvStore};
use crate::error::EngineError;

/// Dedup horizon for `(tx_hash, log_index)`.
const DEDUP_TTL: Duration = Duration::from_secs(600);
/// Sweep the dedup set at most this often.
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Cooldown
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CooldownControl {
    kv: KvStore,
}

impl CooldownControl {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Claim the per-token cooldown slot.
    ///
    /// Returns true iff the key was created. The caller now owns the alert
    /// for this token and must release on every post-claim failure path.
    pub async fn claim(
        &self,
        token: &Address,
        base_seconds: u64,
        jitter_seconds: u64,
    ) -> Result<bool, EngineError> {
        let ttl = jittered_ttl(base_seconds, jitter_seconds);
        let created = self
            .kv
            .set_nx_ex(&keys::cooldown(token), &ttl.to_string(), ttl)
            .await?;
        if created {
            debug!(token = %token, ttl_seconds = ttl, "cooldown claimed");
        }
        Ok(created)
    }

    /// Release a claimed cooldown. Unconditional delete; idempotent.
    pub async fn release(&self, token: &Address) -> Result<(), EngineError> {
        self.kv.del(&keys::cooldown(token)).await?;
        debug!(token = %token, "cooldown released");
        Ok(())
    }
}

/// TTL = base + U(0, jitter), whole seconds.
pub fn jittered_ttl(base_seconds: u64, jitter_seconds: u64) -> u64 {
    if jitter_seconds == 0 {
        return base_seconds.max(1);
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_seconds);
    (base_seconds + jitter).max(1)
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Time-bounded set of processed `(tx_hash, log_index)` pairs.
pub struct SeenTxSet {
    entries: DashMap<(B256, u64), Instant>,
    ttl: Duration,
    last_sweep: std::sync::Mutex<Instant>,
}

impl SeenTxSet {
    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            last_sweep: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Record an event. Returns true iff this is the first sighting within
    /// the dedup horizon.
    pub fn insert(&self, tx_hash: B256, log_index: u64) -> bool {
        self.insert_at(tx_hash, log_index, Instant::now())
    }

    pub(crate) fn insert_at(&self, tx_hash: B256, log_index: u64, now: Instant) -> bool {
        self.maybe_sweep(now);

        let key = (tx_hash, log_index);
        match self.entries.get(&key) {
            Some(seen) if now.duration_since(*seen) < self.ttl => false,
            _ => {
                self.entries.insert(key, now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self, now: Instant) {
        let mut last = self.last_sweep.lock().expect("sweep lock poisoned");
        if now.duration_since(*last) < DEDUP_SWEEP_INTERVAL {
            return;
        }
        *last = now;
        drop(last);
        self.entries
            .retain(|_, seen| now.duration_since(*seen) < self.ttl);
    }
}

impl Default for SeenTxSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    #[test]
    fn test_jittered_ttl_bounds() {
        for _ in 0..100 {
            let ttl = jittered_ttl(180, 30);
            assert!((180..=210).contains(&ttl), "ttl out of range: {ttl}");
        }
    }

    #[test]
    fn test_jittered_ttl_zero_jitter() {
        assert_eq!(jittered_ttl(180, 0), 180);
        // Never produce a zero TTL, Redis would reject it.
        assert_eq!(jittered_ttl(0, 0), 1);
    }

    #[test]
    fn test_dedup_first_sighting_only() {
        let seen = SeenTxSet::new();
        assert!(seen.insert(tx(1), 0));
        assert!(!seen.insert(tx(1), 0));
        // A different log index of the same transaction is a new event.
        assert!(seen.insert(tx(1), 1));
        assert!(seen.insert(tx(2), 0));
    }

    #[test]
    fn test_dedup_expires_after_horizon() {
        let seen = SeenTxSet::with_ttl(Duration::from_secs(600));
        let t0 = Instant::now();

        assert!(seen.insert_at(tx(1), 0, t0));
        assert!(!seen.insert_at(tx(1), 0, t0 + Duration::from_secs(599)));
        assert!(seen.insert_at(tx(1), 0, t0 + Duration::from_secs(601)));
    }

    #[test]
    fn test_sweep_prunes_expired_entries() {
        let seen = SeenTxSet::with_ttl(Duration::from_secs(600));
        let t0 = Instant::now();

        for n in 0..10 {
            seen.insert_at(tx(n), 0, t0);
        }
        assert_eq!(seen.len(), 10);

        // Past the horizon and past the sweep interval, one insert cleans up.
        seen.insert_at(tx(99), 0, t0 + Duration::from_secs(700));
        assert_eq!(seen.len(), 1);
    }
}
