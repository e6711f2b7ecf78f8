//! Read-only projections for the dashboard.
//!
//! The dashboard is an external collaborator: it gets typed queries over
//! engine state plus a single write, `close_position`, which routes a market
//! reduce through the protection manager. No HTTP here; the transport is
//! whoever embeds the engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::engine::evaluator::TradeEvaluator;
use crate::engine::protection::ProtectionManager;
use crate::engine::tranches::TranchePartitioner;
use crate::models::{LiquidationEvent, OrderRecord, PositionKey, PositionSide, Tranche};
use crate::store::Store;
use crate::streams::mark_price::MarkTable;
use crate::venue::governor::RateGovernor;

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub position_side: PositionSide,
    pub tranche_count: usize,
    pub total_qty: f64,
    pub avg_entry_price: f64,
    pub notional_usdt: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub unprotected_tranches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionDetail {
    pub summary: PositionSummary,
    pub tranches: Vec<Tranche>,
    pub companion_orders: Vec<OrderRecord>,
    pub recent_fills: Vec<RecentFill>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentFill {
    pub order_id: i64,
    pub symbol: String,
    pub kind: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub time: i64,
    pub commission: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub uptime_ms: i64,
    pub simulate_only: bool,
    pub liquidation_stream_connected: bool,
    pub mark_stream_connected: bool,
    pub user_stream_connected: bool,
    pub dropped_liquidation_events: u64,
    pub weight_used: u32,
    pub weight_limit: u32,
    pub orders_used: u32,
    pub orders_limit: u32,
    pub consecutive_429: u32,
    pub banned: bool,
    pub open_circuit_breakers: usize,
    pub unprotected_tranches: usize,
    pub pending_exposure_usdt: f64,
    pub open_exposure_usdt: f64,
}

pub struct Projections {
    cfg: Arc<Config>,
    store: Store,
    partitioner: Arc<TranchePartitioner>,
    protection: Arc<ProtectionManager>,
    evaluator: Arc<TradeEvaluator>,
    governor: Arc<RateGovernor>,
    marks: Arc<MarkTable>,
    started_at_ms: i64,
    intake_connected: Arc<AtomicBool>,
    marks_connected: Arc<AtomicBool>,
    user_connected: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
}

impl Projections {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        store: Store,
        partitioner: Arc<TranchePartitioner>,
        protection: Arc<ProtectionManager>,
        evaluator: Arc<TradeEvaluator>,
        governor: Arc<RateGovernor>,
        marks: Arc<MarkTable>,
        started_at_ms: i64,
        intake_connected: Arc<AtomicBool>,
        marks_connected: Arc<AtomicBool>,
        user_connected: Arc<AtomicBool>,
        dropped_events: Arc<AtomicU64>,
    ) -> Self {
        Self {
            cfg,
            store,
            partitioner,
            protection,
            evaluator,
            governor,
            marks,
            started_at_ms,
            intake_connected,
            marks_connected,
            user_connected,
            dropped_events,
        }
    }

    fn summarize(&self, tranches: &[Tranche]) -> Option<PositionSummary> {
        let first = tranches.first()?;
        let total_qty: f64 = tranches.iter().map(|t| t.quantity).sum();
        if total_qty <= 0.0 {
            return None;
        }
        let avg = tranches
            .iter()
            .map(|t| t.avg_entry_price * t.quantity)
            .sum::<f64>()
            / total_qty;
        let mark = self.marks.get(&first.symbol);
        Some(PositionSummary {
            symbol: first.symbol.clone(),
            position_side: first.position_side,
            tranche_count: tranches.len(),
            total_qty,
            avg_entry_price: avg,
            notional_usdt: total_qty * avg,
            mark_price: mark,
            unrealized_pnl_pct: mark.map(|m| first.position_side.signed_return_pct(avg, m)),
            unprotected_tranches: tranches.iter().filter(|t| t.unprotected).count(),
        })
    }

    pub async fn list_positions(&self) -> Vec<PositionSummary> {
        let mut grouped: std::collections::HashMap<PositionKey, Vec<Tranche>> =
            std::collections::HashMap::new();
        for t in self.partitioner.snapshot().await {
            grouped
                .entry(PositionKey::new(t.symbol.clone(), t.position_side))
                .or_default()
                .push(t);
        }
        let mut out: Vec<PositionSummary> = grouped
            .values()
            .filter_map(|tranches| self.summarize(tranches))
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub async fn position_detail(
        &self,
        symbol: &str,
        position_side: PositionSide,
    ) -> Result<Option<PositionDetail>> {
        let key = PositionKey::new(symbol, position_side);
        let Some(book_arc) = self.partitioner.book_if_loaded(&key) else {
            return Ok(None);
        };
        let tranches = { book_arc.lock().await.tranches.clone() };
        let Some(summary) = self.summarize(&tranches) else {
            return Ok(None);
        };

        let mut companion_orders = Vec::new();
        for t in &tranches {
            for id in [t.tp_order_id, t.sl_order_id].into_iter().flatten() {
                if let Some(order) = self.store.get_order(id).await? {
                    companion_orders.push(order);
                }
            }
        }
        let recent_fills = self
            .store
            .recent_fills(Some(symbol), 50)
            .await?
            .into_iter()
            .filter(|(_, o)| o.position_side == position_side)
            .map(|(f, o)| RecentFill {
                order_id: f.order_id,
                symbol: o.symbol,
                kind: o.kind.as_str().to_string(),
                side: o.side.as_str().to_string(),
                qty: f.qty,
                price: f.price,
                time: f.time,
                commission: f.commission,
            })
            .collect();

        Ok(Some(PositionDetail {
            summary,
            tranches,
            companion_orders,
            recent_fills,
        }))
    }

    pub async fn list_recent_liquidations(&self, limit: usize) -> Result<Vec<LiquidationEvent>> {
        self.store.recent_liquidations(limit).await
    }

    pub async fn list_recent_trades(&self, limit: usize) -> Result<Vec<RecentFill>> {
        Ok(self
            .store
            .recent_fills(None, limit)
            .await?
            .into_iter()
            .map(|(f, o)| RecentFill {
                order_id: f.order_id,
                symbol: o.symbol,
                kind: o.kind.as_str().to_string(),
                side: o.side.as_str().to_string(),
                qty: f.qty,
                price: f.price,
                time: f.time,
                commission: f.commission,
            })
            .collect())
    }

    pub async fn engine_health(&self) -> EngineHealth {
        let snapshot = self.governor.snapshot();
        let tranches = self.partitioner.snapshot().await;
        EngineHealth {
            uptime_ms: chrono::Utc::now().timestamp_millis() - self.started_at_ms,
            simulate_only: self.cfg.simulate_only,
            liquidation_stream_connected: self.intake_connected.load(Ordering::Acquire),
            mark_stream_connected: self.marks_connected.load(Ordering::Acquire),
            user_stream_connected: self.user_connected.load(Ordering::Acquire),
            dropped_liquidation_events: self.dropped_events.load(Ordering::Relaxed),
            weight_used: snapshot.weight_used,
            weight_limit: snapshot.weight_limit,
            orders_used: snapshot.orders_used,
            orders_limit: snapshot.orders_limit,
            consecutive_429: snapshot.consecutive_429,
            banned: snapshot.banned,
            open_circuit_breakers: self.protection.breaker().open_count(),
            unprotected_tranches: tranches.iter().filter(|t| t.unprotected).count(),
            pending_exposure_usdt: self.evaluator.pending_exposure(),
            open_exposure_usdt: tranches.iter().map(|t| t.notional().abs()).sum(),
        }
    }

    /// Dashboard-initiated close: market-reduce every tranche of the key.
    /// The fills flow back through the normal routing for cleanup.
    pub async fn close_position(&self, symbol: &str, position_side: PositionSide) -> Result<usize> {
        let key = PositionKey::new(symbol, position_side);
        let Some(book_arc) = self.partitioner.book_if_loaded(&key) else {
            return Ok(0);
        };
        let book = book_arc.lock().await;
        let tranches: Vec<Tranche> = book.tranches.clone();
        let mut closed = 0;
        for tranche in &tranches {
            match self.protection.market_reduce(tranche, true).await {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        tranche_id = tranche.tranche_id,
                        error = %e,
                        "close position market reduce failed"
                    );
                }
            }
        }
        info!(key = %key, tranches = closed, "close position requested");
        Ok(closed)
    }
}
