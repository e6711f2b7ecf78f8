//! Symbol specification cache.
//!
//! Price tick, quantity step, minimum notional and display precisions are
//! fetched once from `exchange_info`, cached, and invalidated either on a
//! refresh interval or when the venue rejects an order with a lot/tick
//! complaint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::venue::wire::{ExchangeInfoResponse, SymbolFilter};

#[derive(Debug, Clone, Copy)]
pub struct SymbolSpec {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
}

impl SymbolSpec {
    /// Round a price down/up to the symbol tick. `floor` is the less
    /// aggressive direction for a BUY limit, `ceil` for a SELL limit.
    pub fn round_price(&self, price: f64, up: bool) -> f64 {
        round_to_increment(price, self.tick_size, up)
    }

    /// Quantities always round down; rounding up could exceed balance or the
    /// position being reduced.
    pub fn round_qty(&self, qty: f64) -> f64 {
        round_to_increment(qty, self.step_size, false)
    }

    pub fn fmt_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_precision as usize, price)
    }

    pub fn fmt_qty(&self, qty: f64) -> String {
        format!("{:.*}", self.qty_precision as usize, qty)
    }
}

fn round_to_increment(value: f64, increment: f64, up: bool) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    let steps = value / increment;
    // Guard against float noise right at a boundary (e.g. 59340.6 / 0.1
    // landing at 593405.9999999999). Scaled to the quotient so the guard
    // stays far below half a step at any magnitude.
    let eps = steps.abs() * 1e-9 + 1e-9;
    let rounded = if up {
        (steps - eps).ceil()
    } else {
        (steps + eps).floor()
    };
    rounded * increment
}

pub struct SpecCache {
    inner: RwLock<SpecCacheInner>,
    refresh_interval: Duration,
}

struct SpecCacheInner {
    specs: HashMap<String, SymbolSpec>,
    fetched_at: Option<Instant>,
}

impl SpecCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(SpecCacheInner {
                specs: HashMap::new(),
                fetched_at: None,
            }),
            refresh_interval,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolSpec> {
        self.inner.read().specs.get(symbol).copied()
    }

    pub fn is_stale(&self) -> bool {
        let inner = self.inner.read();
        match inner.fetched_at {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    pub fn replace_all(&self, specs: Vec<(String, SymbolSpec)>) {
        let mut inner = self.inner.write();
        inner.specs = specs.into_iter().collect();
        inner.fetched_at = Some(Instant::now());
    }

    /// Force a refetch on the next staleness check, e.g. after an
    /// `invalid-param` response referencing lot/tick rules.
    pub fn invalidate(&self) {
        self.inner.write().fetched_at = None;
    }

    #[cfg(test)]
    pub fn insert(&self, symbol: &str, spec: SymbolSpec) {
        let mut inner = self.inner.write();
        inner.specs.insert(symbol.to_string(), spec);
        inner.fetched_at = Some(Instant::now());
    }
}

/// Flatten an exchange-info response into cacheable specs. Symbols missing a
/// price or lot filter are skipped; the evaluator will simply never trade
/// them.
pub fn specs_from_exchange_info(info: ExchangeInfoResponse) -> Vec<(String, SymbolSpec)> {
    info.symbols
        .into_iter()
        .filter(|s| s.status.as_deref().map(|st| st == "TRADING").unwrap_or(true))
        .filter_map(|s| {
            let mut tick_size = None;
            let mut step_size = None;
            let mut min_notional = 0.0;
            for f in &s.filters {
                match f {
                    SymbolFilter::Price { tick_size: t } => tick_size = Some(*t),
                    SymbolFilter::LotSize { step_size: st } => step_size = Some(*st),
                    SymbolFilter::MinNotional { notional } => min_notional = *notional,
                    SymbolFilter::Other => {}
                }
            }
            Some((
                s.symbol,
                SymbolSpec {
                    tick_size: tick_size?,
                    step_size: step_size?,
                    min_notional,
                    price_precision: s.price_precision,
                    qty_precision: s.quantity_precision,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_spec() -> SymbolSpec {
        SymbolSpec {
            tick_size: 0.1,
            step_size: 0.001,
            min_notional: 100.0,
            price_precision: 1,
            qty_precision: 3,
        }
    }

    #[test]
    fn price_rounding_direction() {
        let spec = btc_spec();
        assert!((spec.round_price(59_940.04, false) - 59_940.0).abs() < 1e-6);
        assert!((spec.round_price(59_940.04, true) - 59_940.1).abs() < 1e-6);
        // Exact multiples stay put in both directions.
        assert!((spec.round_price(61_138.8, false) - 61_138.8).abs() < 1e-6);
        assert!((spec.round_price(61_138.8, true) - 61_138.8).abs() < 1e-6);
    }

    #[test]
    fn qty_rounds_down_to_step() {
        let spec = btc_spec();
        assert!((spec.round_qty(0.0169) - 0.016).abs() < 1e-9);
        assert!((spec.round_qty(0.016) - 0.016).abs() < 1e-9);
    }

    #[test]
    fn formatting_respects_precision() {
        let spec = btc_spec();
        assert_eq!(spec.fmt_price(59_940.0), "59940.0");
        assert_eq!(spec.fmt_qty(0.016), "0.016");
    }

    #[test]
    fn exchange_info_flattening() {
        let raw = r#"{"symbols":[
            {"symbol":"BTCUSDT","status":"TRADING","pricePrecision":1,"quantityPrecision":3,
             "filters":[{"filterType":"PRICE_FILTER","tickSize":"0.10"},
                        {"filterType":"LOT_SIZE","stepSize":"0.001"},
                        {"filterType":"MIN_NOTIONAL","notional":"100"},
                        {"filterType":"PERCENT_PRICE","multiplierUp":"1.1"}]},
            {"symbol":"HALTED","status":"BREAK","pricePrecision":2,"quantityPrecision":0,"filters":[]}
        ]}"#;
        let info: ExchangeInfoResponse = serde_json::from_str(raw).unwrap();
        let specs = specs_from_exchange_info(info);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].0, "BTCUSDT");
        assert!((specs[0].1.tick_size - 0.1).abs() < 1e-12);
        assert!((specs[0].1.min_notional - 100.0).abs() < 1e-12);
    }

    #[test]
    fn cache_staleness_and_invalidate() {
        let cache = SpecCache::new(Duration::from_secs(3600));
        assert!(cache.is_stale());
        cache.replace_all(vec![("BTCUSDT".into(), btc_spec())]);
        assert!(!cache.is_stale());
        assert!(cache.get("BTCUSDT").is_some());
        cache.invalidate();
        assert!(cache.is_stale());
        // Entries survive invalidation; only freshness is reset.
        assert!(cache.get("BTCUSDT").is_some());
    }
}
