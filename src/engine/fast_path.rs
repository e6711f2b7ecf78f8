//! Mark-price fast path.
//!
//! When the mark prints through a tranche's TP level the resting limit may
//! not fill (price gapped, queue position, venue matching). This path
//! cancels the resting TP and fires a market reduce immediately. It never
//! touches SL orders, and the protection circuit breaker guards it against
//! runaway market orders on persistent rejects.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::engine::protection::{protection_prices, ProtectionManager};
use crate::engine::tranches::TranchePartitioner;
use crate::models::{PositionKey, PositionSide, Tranche};

pub struct FastPath {
    cfg: Arc<Config>,
    partitioner: Arc<TranchePartitioner>,
    protection: Arc<ProtectionManager>,
}

impl FastPath {
    pub fn new(
        cfg: Arc<Config>,
        partitioner: Arc<TranchePartitioner>,
        protection: Arc<ProtectionManager>,
    ) -> Self {
        Self {
            cfg,
            partitioner,
            protection,
        }
    }

    /// True when the mark has reached (or overshot) the tranche's TP level
    /// within epsilon.
    fn tp_overshot(&self, tranche: &Tranche, tp_pct: f64, sl_pct: f64, mark: f64) -> bool {
        let (tp_price, _) = protection_prices(
            tranche.position_side,
            tranche.avg_entry_price,
            tp_pct,
            sl_pct,
        );
        let eps = self.cfg.instant_tp_epsilon;
        match tranche.position_side {
            PositionSide::Long => mark >= tp_price * (1.0 - eps),
            PositionSide::Short => mark <= tp_price * (1.0 + eps),
        }
    }

    /// Called for every mark-price update of `symbol`. Cheap when no tranche
    /// is near its TP.
    pub async fn on_mark(&self, symbol: &str, mark: f64) {
        if !self.cfg.instant_tp_enabled || mark <= 0.0 {
            return;
        }
        let Some(sc) = self.cfg.symbols.get(symbol) else {
            return;
        };
        if !sc.take_profit_enabled {
            return;
        }

        for side in [PositionSide::Long, PositionSide::Short] {
            let key = PositionKey::new(symbol, side);
            let Some(book_arc) = self.partitioner.book_if_loaded(&key) else {
                continue;
            };
            // Holding the book lock across the cancel+market sequence keeps
            // the fast path serialized with rebuilds and fill routing for
            // this key.
            let book = book_arc.lock().await;
            let candidates: Vec<Tranche> = book
                .tranches
                .iter()
                .filter(|t| {
                    t.quantity > 0.0
                        && self.tp_overshot(t, sc.take_profit_pct, sc.stop_loss_pct, mark)
                        && !self.protection.is_closing(&key, t.tranche_id)
                })
                .cloned()
                .collect();

            for tranche in candidates {
                info!(
                    key = %key,
                    tranche_id = tranche.tranche_id,
                    mark,
                    avg_entry = tranche.avg_entry_price,
                    "mark overshot TP, firing instant market reduce"
                );
                match self.protection.market_reduce(&tranche, true).await {
                    Ok(Some(order_id)) => {
                        info!(key = %key, tranche_id = tranche.tranche_id, order_id, "instant TP market order placed");
                    }
                    Ok(None) => {
                        // TP filled in the race window or breaker open; the
                        // normal fill flow handles cleanup.
                        self.protection.clear_closing(&key, tranche.tranche_id);
                    }
                    Err(e) => {
                        warn!(
                            key = %key,
                            tranche_id = tranche.tranche_id,
                            error = %e,
                            "instant TP market reduce failed"
                        );
                    }
                }
            }
            drop(book);
        }
    }
}
