//! Rolling liquidation-volume aggregator.
//!
//! Per `(symbol, liquidated_side)` a deque of `(event_time, usdt_value)` with
//! an incrementally maintained sum. Queries are O(1) after head eviction.
//! The store is only consulted on startup to rebuild the deques.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::models::{LiquidationEvent, Side};

#[derive(Debug, Default)]
struct SideWindow {
    points: VecDeque<(i64, f64)>,
    sum: f64,
}

impl SideWindow {
    fn evict(&mut self, cutoff_ms: i64) {
        while let Some(&(at, v)) = self.points.front() {
            // Strictly older than the cutoff; an event exactly at the window
            // edge still counts.
            if at < cutoff_ms {
                self.sum -= v;
                self.points.pop_front();
            } else {
                break;
            }
        }
        if self.points.is_empty() {
            self.sum = 0.0;
        }
    }
}

pub struct VolumeWindow {
    window_ms: i64,
    inner: Mutex<HashMap<(String, Side), SideWindow>>,
}

impl VolumeWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms as i64,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, event: &LiquidationEvent) {
        let mut inner = self.inner.lock();
        let w = inner
            .entry((event.symbol.clone(), event.liquidated_side))
            .or_default();
        w.points.push_back((event.event_time_ms, event.usdt_value));
        w.sum += event.usdt_value;
        w.evict(event.event_time_ms - self.window_ms);
    }

    /// Current window sum in USDT for `(symbol, side)` as of `now_ms`.
    pub fn current(&self, symbol: &str, side: Side, now_ms: i64) -> f64 {
        let mut inner = self.inner.lock();
        match inner.get_mut(&(symbol.to_string(), side)) {
            Some(w) => {
                w.evict(now_ms - self.window_ms);
                w.sum
            }
            None => 0.0,
        }
    }

    /// Rebuild from stored events after a restart.
    pub fn rebuild(&self, events: &[LiquidationEvent]) {
        let mut inner = self.inner.lock();
        inner.clear();
        drop(inner);
        for e in events {
            self.record(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(symbol: &str, side: Side, value: f64, at: i64) -> LiquidationEvent {
        LiquidationEvent {
            event_id: format!("{symbol}-{at}-{value}"),
            symbol: symbol.to_string(),
            liquidated_side: side,
            qty: 1.0,
            price: value,
            usdt_value: value,
            event_time_ms: at,
            received_time_ms: at,
        }
    }

    #[test]
    fn sums_within_window() {
        let w = VolumeWindow::new(5_000);
        w.record(&ev("BTCUSDT", Side::Sell, 40_000.0, 1_000));
        w.record(&ev("BTCUSDT", Side::Sell, 80_000.0, 3_000));
        assert!((w.current("BTCUSDT", Side::Sell, 3_000) - 120_000.0).abs() < 1e-9);
    }

    #[test]
    fn evicts_strictly_older_than_cutoff() {
        let w = VolumeWindow::new(5_000);
        w.record(&ev("BTCUSDT", Side::Sell, 40_000.0, 1_000));
        w.record(&ev("BTCUSDT", Side::Sell, 80_000.0, 3_000));
        // At t=6000 the cutoff is 1000: the first event sits exactly on the
        // edge and still counts.
        assert!((w.current("BTCUSDT", Side::Sell, 6_000) - 120_000.0).abs() < 1e-9);
        // One ms later it ages out.
        assert!((w.current("BTCUSDT", Side::Sell, 6_001) - 80_000.0).abs() < 1e-9);
        // Everything gone.
        assert!(w.current("BTCUSDT", Side::Sell, 60_000).abs() < 1e-9);
    }

    #[test]
    fn sides_and_symbols_are_independent() {
        let w = VolumeWindow::new(5_000);
        w.record(&ev("BTCUSDT", Side::Sell, 10_000.0, 1_000));
        w.record(&ev("BTCUSDT", Side::Buy, 20_000.0, 1_000));
        w.record(&ev("ETHUSDT", Side::Sell, 30_000.0, 1_000));
        assert!((w.current("BTCUSDT", Side::Sell, 1_000) - 10_000.0).abs() < 1e-9);
        assert!((w.current("BTCUSDT", Side::Buy, 1_000) - 20_000.0).abs() < 1e-9);
        assert!((w.current("ETHUSDT", Side::Sell, 1_000) - 30_000.0).abs() < 1e-9);
        assert!(w.current("ETHUSDT", Side::Buy, 1_000).abs() < 1e-9);
    }

    #[test]
    fn rebuild_replays_history() {
        let w = VolumeWindow::new(5_000);
        let events = vec![
            ev("BTCUSDT", Side::Sell, 40_000.0, 1_000),
            ev("BTCUSDT", Side::Sell, 80_000.0, 3_000),
        ];
        w.rebuild(&events);
        assert!((w.current("BTCUSDT", Side::Sell, 3_000) - 120_000.0).abs() < 1e-9);
    }
}
