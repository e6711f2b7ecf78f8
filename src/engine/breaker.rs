//! Per-tranche circuit breaker.
//!
//! Shared between the protection manager and the fast-path monitor so that
//! repeated venue rejects (reduce-only rejected, margin insufficient,
//! unexpected param) cannot drive an infinite cancel/place or market-order
//! loop against one tranche.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::models::PositionKey;

pub type BreakerKey = (PositionKey, u64);

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    entries: Mutex<HashMap<BreakerKey, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allows(&self, key: &PositionKey, tranche_id: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&(key.clone(), tranche_id)) else {
            return true;
        };
        match entry.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown elapsed: half-open, allow one attempt.
                entry.open_until = None;
                true
            }
            None => true,
        }
    }

    /// Returns true when this failure tripped the breaker open.
    pub fn record_failure(&self, key: &PositionKey, tranche_id: u64) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry((key.clone(), tranche_id)).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold && entry.open_until.is_none() {
            entry.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                key = %key,
                tranche_id,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "protection circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn record_success(&self, key: &PositionKey, tranche_id: u64) {
        self.entries.lock().remove(&(key.clone(), tranche_id));
    }

    /// Drop state for a destroyed tranche.
    pub fn clear(&self, key: &PositionKey, tranche_id: u64) {
        self.entries.lock().remove(&(key.clone(), tranche_id));
    }

    pub fn open_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| matches!(e.open_until, Some(until) if now < until))
            .count()
    }
}
