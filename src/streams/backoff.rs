//! Exponential backoff with jitter for stream reconnect loops.

use std::time::Duration;

use rand::Rng;

/// Backoff calculator with jitter so mass reconnects don't thundering-herd
/// the venue.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        // 500ms base, 2x multiplier, 30s cap, ±30% jitter.
        Self::new(500, 30_000, 2.0, 0.3)
    }
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, multiplier: f64, jitter_factor: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            multiplier,
            jitter_factor,
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let final_ms = (capped + jitter).max(self.base_ms as f64);

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(final_ms as u64)
    }

    /// Reset after a healthy connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
