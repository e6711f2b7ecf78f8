//! Entry decision logic.
//!
//! For each liquidation burst the evaluator checks the rolling window sum
//! against the symbol threshold, runs the admission gates in order (each may
//! veto), prices the entry off the top of book, and submits a limit order
//! with a client-generated idempotency id. Evaluations are serialized per
//! symbol by the engine's worker partitioning; this type itself only guards
//! its shared exposure map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::tranches::TranchePartitioner;
use crate::engine::window::VolumeWindow;
use crate::models::{LiquidationEvent, OrderKind, OrderRecord, OrderStatus, PositionSide};
use crate::store::Store;
use crate::venue::governor::{Elevation, Priority, RateGovernor};
use crate::venue::specs::SpecCache;
use crate::venue::{NewOrder, OrderType, VenueApi};

/// Cascade elevation window granted to the governor once a threshold trips.
const CASCADE_ELEVATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct PendingEntry {
    symbol: String,
    notional: f64,
    order_id: Option<i64>,
}

/// Outcome of one evaluation, mostly for tests and debug logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalDecision {
    Ignored,
    BelowThreshold,
    Vetoed(&'static str),
    Submitted { order_id: i64 },
}

pub struct TradeEvaluator {
    cfg: Arc<Config>,
    venue: Arc<dyn VenueApi>,
    store: Store,
    window: Arc<VolumeWindow>,
    specs: Arc<SpecCache>,
    governor: Arc<RateGovernor>,
    partitioner: Arc<TranchePartitioner>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    setup_applied: Mutex<HashSet<String>>,
}

impl TradeEvaluator {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn VenueApi>,
        store: Store,
        window: Arc<VolumeWindow>,
        specs: Arc<SpecCache>,
        governor: Arc<RateGovernor>,
        partitioner: Arc<TranchePartitioner>,
    ) -> Self {
        Self {
            cfg,
            venue,
            store,
            window,
            specs,
            governor,
            partitioner,
            pending: Mutex::new(HashMap::new()),
            setup_applied: Mutex::new(HashSet::new()),
        }
    }

    /// Total notional of submitted-but-not-final entries.
    pub fn pending_exposure(&self) -> f64 {
        self.pending.lock().values().map(|p| p.notional).sum()
    }

    fn pending_for_symbol(&self, symbol: &str) -> (f64, u32) {
        let pending = self.pending.lock();
        let mut notional = 0.0;
        let mut count = 0;
        for p in pending.values() {
            if p.symbol == symbol {
                notional += p.notional;
                count += 1;
            }
        }
        (notional, count)
    }

    /// Release the pending-exposure slot once an entry reaches a terminal
    /// state (called by the fill router). Matching by client id as well
    /// covers fills that race ahead of the submit ack.
    pub fn release_pending(&self, order_id: i64, client_id: &str) {
        let mut pending = self.pending.lock();
        pending.retain(|cid, p| p.order_id != Some(order_id) && cid != client_id);
    }

    /// Evaluate one liquidation against the window sum and gates.
    pub async fn evaluate(&self, event: &LiquidationEvent) -> Result<EvalDecision> {
        let symbol = event.symbol.as_str();
        let Some(sc) = self.cfg.symbols.get(symbol) else {
            return Ok(EvalDecision::Ignored);
        };

        let trigger_side = event.liquidated_side;
        let entry_side = sc.trade_side.entry_position_side(trigger_side);
        let threshold = sc.volume_threshold(entry_side);
        let volume = self
            .window
            .current(symbol, trigger_side, event.event_time_ms);
        // Trigger at >= threshold, not >.
        if volume < threshold {
            return Ok(EvalDecision::BelowThreshold);
        }

        info!(
            symbol,
            side = trigger_side.as_str(),
            volume,
            threshold,
            "liquidation cascade threshold reached"
        );
        self.governor.elevate(Elevation::Liquidation, CASCADE_ELEVATION);

        let notional = sc.trade_value_usdt * sc.leverage as f64;

        // Gate 1: total outstanding exposure across all symbols.
        let open_notional: f64 = self
            .partitioner
            .snapshot()
            .await
            .iter()
            .map(|t| t.notional().abs())
            .sum();
        if open_notional + self.pending_exposure() + notional > self.cfg.max_total_exposure_usdt {
            debug!(symbol, open_notional, "veto: total exposure cap");
            return Ok(EvalDecision::Vetoed("max_total_exposure"));
        }

        // Gate 2: open entry orders for this symbol.
        let (pending_notional, pending_count) = self.pending_for_symbol(symbol);
        let open_entries = self.store.open_entry_count(symbol).await?.max(pending_count);
        if open_entries >= self.cfg.max_open_orders_per_symbol {
            debug!(symbol, open_entries, "veto: open entry orders cap");
            return Ok(EvalDecision::Vetoed("max_open_orders"));
        }

        // Gate 3: symbol min-notional, pre-rounding.
        let spec = self.specs.get(symbol);
        if let Some(spec) = spec {
            if notional < spec.min_notional {
                debug!(symbol, notional, min = spec.min_notional, "veto: below min notional");
                return Ok(EvalDecision::Vetoed("min_notional"));
            }
        }

        // Gate 4: per-symbol position cap.
        let key = crate::models::PositionKey::new(symbol, entry_side);
        let book = self.partitioner.book(&key).await?;
        let current_notional = { book.lock().await.total_notional() };
        if current_notional + pending_notional + notional > sc.max_position_usdt {
            debug!(symbol, current_notional, "veto: per-symbol position cap");
            return Ok(EvalDecision::Vetoed("max_position"));
        }

        // Price off the top of book, offset to the conservative side.
        let top = self.venue.depth(symbol, 5).await?;
        let raw_price = match entry_side {
            PositionSide::Long => top.best_bid * (1.0 - sc.price_offset_pct / 100.0),
            PositionSide::Short => top.best_ask * (1.0 + sc.price_offset_pct / 100.0),
        };
        let price = match (spec, entry_side) {
            (Some(s), PositionSide::Long) => s.round_price(raw_price, false),
            (Some(s), PositionSide::Short) => s.round_price(raw_price, true),
            (None, _) => raw_price,
        };
        if price <= 0.0 {
            return Ok(EvalDecision::Vetoed("bad_price"));
        }

        let raw_qty = notional / price;
        let qty = spec.map(|s| s.round_qty(raw_qty)).unwrap_or(raw_qty);
        if qty <= 0.0 {
            return Ok(EvalDecision::Vetoed("qty_rounds_to_zero"));
        }
        if let Some(spec) = spec {
            // Post-rounding min-notional: rounding down may drop us under.
            if qty * price < spec.min_notional {
                debug!(symbol, qty, price, "veto: rounded below min notional");
                return Ok(EvalDecision::Vetoed("min_notional_after_rounding"));
            }
        }

        self.ensure_symbol_setup(symbol, sc.leverage, sc.margin_type).await;

        let client_id = format!("lh-entry-{}", Uuid::new_v4().simple());
        let order = NewOrder {
            symbol: symbol.to_string(),
            side: entry_side.entry_side(),
            position_side: if self.cfg.hedge_mode {
                Some(entry_side)
            } else {
                None
            },
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            time_in_force: Some(self.cfg.time_in_force),
            client_id: client_id.clone(),
            working_type: None,
            price_protect: false,
            priority: Priority::Critical,
        };

        // Reserve exposure before the submit so parallel evaluations of
        // other symbols already see it.
        self.pending.lock().insert(
            client_id.clone(),
            PendingEntry {
                symbol: symbol.to_string(),
                notional: qty * price,
                order_id: None,
            },
        );

        let ack = match self.venue.place_order(&order).await {
            Ok(ack) => ack,
            Err(e) => {
                self.pending.lock().remove(&client_id);
                warn!(symbol, error = %e, "entry submit failed");
                return Err(e.into());
            }
        };
        if let Some(p) = self.pending.lock().get_mut(&client_id) {
            p.order_id = Some(ack.order_id);
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .upsert_order(&OrderRecord {
                order_id: ack.order_id,
                client_id,
                symbol: symbol.to_string(),
                position_side: entry_side,
                kind: OrderKind::Entry,
                side: order.side,
                qty,
                price: Some(price),
                stop_price: None,
                status: OrderStatus::New,
                tranche_id: None,
                parent_order_id: None,
                placed_at: now,
                final_at: None,
                executed_qty: 0.0,
                avg_fill_price: 0.0,
                time_in_force: self.cfg.time_in_force,
            })
            .await?;

        info!(
            symbol,
            order_id = ack.order_id,
            side = order.side.as_str(),
            position_side = entry_side.as_str(),
            qty,
            price,
            "entry order submitted"
        );
        Ok(EvalDecision::Submitted {
            order_id: ack.order_id,
        })
    }

    /// Apply leverage and margin type once per symbol per process lifetime;
    /// "no change" rejections count as success.
    async fn ensure_symbol_setup(
        &self,
        symbol: &str,
        leverage: u32,
        margin_type: crate::models::MarginType,
    ) {
        if self.setup_applied.lock().contains(symbol) {
            return;
        }
        if let Err(e) = self.venue.set_margin_type(symbol, margin_type).await {
            if !e.is_no_change() {
                warn!(symbol, error = %e, "margin type setup failed");
            }
        }
        match self.venue.set_leverage(symbol, leverage).await {
            Ok(()) => {
                self.setup_applied.lock().insert(symbol.to_string());
            }
            Err(e) => {
                warn!(symbol, error = %e, "leverage setup failed");
            }
        }
    }
}
