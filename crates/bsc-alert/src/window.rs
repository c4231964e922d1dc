//! Per-token cumulative rolling windows for the Layer-1 filter.
//!
//! Events below the per-event USD threshold accumulate here; once the
//! rolling sum crosses the cumulative minimum the token is admitted anyway.
//! Entries older than the window are evicted before every read, so the sum
//! always equals the arithmetic sum of retained values.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use dashmap::DashMap;
use rust_decimal::Decimal;

pub struct CumulativeWindows {
    windows: DashMap<Address, TokenWindow>,
    window: Duration,
}

#[derive(Debug, Default)]
struct TokenWindow {
    events: VecDeque<(Instant, Decimal)>,
    sum: Decimal,
}

impl TokenWindow {
    fn prune(&mut self, cutoff: Instant) {
        while let Some(&(ts, usd)) = self.events.front() {
            if ts < cutoff {
                self.events.pop_front();
                self.sum -= usd;
            } else {
                break;
            }
        }
    }
}

impl CumulativeWindows {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
        }
    }

    /// Record a below-threshold event and return the rolling sum including it.
    pub fn record(&self, token: Address, usd_value: Decimal) -> Decimal {
        self.record_at(token, usd_value, Instant::now())
    }

    pub(crate) fn record_at(&self, token: Address, usd_value: Decimal, now: Instant) -> Decimal {
        let mut entry = self.windows.entry(token).or_default();
        if let Some(cutoff) = now.checked_sub(self.window) {
            entry.prune(cutoff);
        }
        entry.events.push_back((now, usd_value));
        entry.sum += usd_value;
        entry.sum
    }

    /// Current rolling sum for a token, after eviction.
    pub fn sum(&self, token: &Address) -> Decimal {
        self.sum_at(token, Instant::now())
    }

    pub(crate) fn sum_at(&self, token: &Address, now: Instant) -> Decimal {
        match self.windows.get_mut(token) {
            Some(mut entry) => {
                if let Some(cutoff) = now.checked_sub(self.window) {
                    entry.prune(cutoff);
                }
                entry.sum
            }
            None => Decimal::ZERO,
        }
    }

    /// A token's window is cleared once it admits an event, so the same
    /// accumulation cannot admit twice.
    pub fn reset(&self, token: &Address) {
        self.windows.remove(token);
    }

    /// Drop tokens whose whole window has aged out. Called from the health
    /// loop to keep the map bounded on long-tail tokens.
    pub fn prune_idle(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        self.windows.retain(|_, w| {
            w.prune(cutoff);
            !w.events.is_empty()
        });
    }

    pub fn tracked_tokens(&self) -> usize {
        self.windows.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn token() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    #[test]
    fn test_cumulative_sum_within_window() {
        // Three $250 swaps within 5 minutes accumulate to $750.
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let t0 = Instant::now();

        assert_eq!(windows.record_at(token(), dec!(250), t0), dec!(250));
        assert_eq!(
            windows.record_at(token(), dec!(250), t0 + Duration::from_secs(60)),
            dec!(500)
        );
        assert_eq!(
            windows.record_at(token(), dec!(250), t0 + Duration::from_secs(120)),
            dec!(750)
        );
    }

    #[test]
    fn test_old_entries_evicted_before_read() {
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let t0 = Instant::now();

        windows.record_at(token(), dec!(250), t0);
        windows.record_at(token(), dec!(100), t0 + Duration::from_secs(250));

        // At t0+301 the first entry has aged out.
        assert_eq!(
            windows.sum_at(&token(), t0 + Duration::from_secs(301)),
            dec!(100)
        );
        // At t0+551 everything has aged out.
        assert_eq!(
            windows.sum_at(&token(), t0 + Duration::from_secs(551)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_reset_clears_accumulation() {
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let t0 = Instant::now();

        windows.record_at(token(), dec!(500), t0);
        windows.reset(&token());
        assert_eq!(windows.sum_at(&token(), t0), Decimal::ZERO);
        assert_eq!(
            windows.record_at(token(), dec!(50), t0 + Duration::from_secs(1)),
            dec!(50)
        );
    }

    #[test]
    fn test_tokens_are_independent() {
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let other: Address = "0x2222222222222222222222222222222222222222"
            .parse()
            .unwrap();
        let t0 = Instant::now();

        windows.record_at(token(), dec!(300), t0);
        windows.record_at(other, dec!(10), t0);

        assert_eq!(windows.sum_at(&token(), t0), dec!(300));
        assert_eq!(windows.sum_at(&other, t0), dec!(10));
    }

    #[test]
    fn test_prune_idle_drops_empty_windows() {
        let windows = CumulativeWindows::new(Duration::from_millis(1));
        windows.record(token(), dec!(10));
        std::thread::sleep(Duration::from_millis(5));
        windows.prune_idle();
        assert_eq!(windows.tracked_tokens(), 0);
    }
}
