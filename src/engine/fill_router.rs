//! Execution-report routing.
//!
//! Consumes normalized fill events (live user-data stream or simulated
//! venue) and drives the partitioner and protection manager. Per order id
//! the venue emits events in order and this router processes them on a
//! single task, so no per-order locking is needed; the per-key book lock
//! serializes against the evaluator and fast path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::engine::evaluator::TradeEvaluator;
use crate::engine::protection::ProtectionManager;
use crate::engine::tranches::{ReduceOutcome, TranchePartitioner};
use crate::models::{FillEvent, FillRecord, OrderKind, OrderRecord, OrderStatus, PositionKey};
use crate::store::Store;

/// The ack write can lose the race against the first stream event for the
/// same order; retry the lookup briefly before giving up.
const LOOKUP_RETRIES: u32 = 3;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct FillRouter {
    store: Store,
    partitioner: Arc<TranchePartitioner>,
    protection: Arc<ProtectionManager>,
    evaluator: Arc<TradeEvaluator>,
    reconcile_nudge: Arc<Notify>,
}

impl FillRouter {
    pub fn new(
        store: Store,
        partitioner: Arc<TranchePartitioner>,
        protection: Arc<ProtectionManager>,
        evaluator: Arc<TradeEvaluator>,
        reconcile_nudge: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            partitioner,
            protection,
            evaluator,
            reconcile_nudge,
        }
    }

    /// Ask the reconciler to run soon (balance/position drift seen).
    pub fn nudge_reconciler(&self) {
        self.reconcile_nudge.notify_one();
    }

    pub async fn handle(&self, event: FillEvent) -> Result<()> {
        let Some(order) = self.lookup_order(&event).await? else {
            debug!(
                order_id = event.order_id,
                symbol = %event.symbol,
                "execution report for unknown order, leaving to reconciler"
            );
            self.reconcile_nudge.notify_one();
            return Ok(());
        };

        // Persist the execution before acting on it.
        if event.last_qty > 0.0 {
            let seq = self.store.next_fill_seq(event.order_id).await?;
            self.store
                .insert_fill(&FillRecord {
                    order_id: event.order_id,
                    seq,
                    qty: event.last_qty,
                    price: if event.last_price > 0.0 {
                        event.last_price
                    } else {
                        event.avg_price
                    },
                    time: event.event_time_ms,
                    commission: event.commission,
                })
                .await?;
        }
        let final_at = event.status.is_terminal().then_some(event.event_time_ms);
        self.store
            .update_order_execution(
                event.order_id,
                event.status,
                event.cum_qty,
                event.avg_price,
                final_at,
            )
            .await?;

        if !event.status.is_terminal() {
            return Ok(());
        }

        match order.kind {
            OrderKind::Entry => self.on_entry_terminal(&order, &event).await,
            OrderKind::Tp | OrderKind::Sl | OrderKind::Close => {
                self.on_reduce_terminal(&order, &event).await
            }
        }
    }

    async fn lookup_order(&self, event: &FillEvent) -> Result<Option<OrderRecord>> {
        for attempt in 0..=LOOKUP_RETRIES {
            if let Some(order) = self.store.get_order(event.order_id).await? {
                return Ok(Some(order));
            }
            if let Some(order) = self.store.get_order_by_client_id(&event.client_id).await? {
                return Ok(Some(order));
            }
            if attempt < LOOKUP_RETRIES {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        Ok(None)
    }

    /// Entry reached a terminal state: assign the executed quantity to a
    /// tranche (absorb or create) and (re)build protection. Assignment
    /// happens exactly once, at terminal, so a fill's tranche is final.
    async fn on_entry_terminal(&self, order: &OrderRecord, event: &FillEvent) -> Result<()> {
        self.evaluator.release_pending(event.order_id, &event.client_id);

        if event.cum_qty <= 0.0 || event.status == OrderStatus::Rejected {
            debug!(order_id = event.order_id, status = event.status.as_str(), "entry ended unfilled");
            return Ok(());
        }

        let fill_price = if event.avg_price > 0.0 {
            event.avg_price
        } else {
            order.price.unwrap_or(0.0)
        };
        if fill_price <= 0.0 {
            warn!(order_id = event.order_id, "entry fill without a usable price");
            return Ok(());
        }

        let key = PositionKey::new(order.symbol.clone(), order.position_side);
        let book_arc = self.partitioner.book(&key).await?;
        let mut book = book_arc.lock().await;

        let outcome = book.apply_entry_fill(
            event.cum_qty,
            fill_price,
            event.event_time_ms,
            &self.partitioner.rules(),
        );
        let removed: Vec<u64> = outcome.merged.map(|(_, gone)| gone).into_iter().collect();
        self.partitioner.persist(&book, &removed).await?;

        let tranche_id = match outcome.action {
            crate::engine::tranches::EntryAction::Absorbed { tranche_id } => tranche_id,
            crate::engine::tranches::EntryAction::Created { tranche_id } => tranche_id,
        };
        info!(
            key = %key,
            order_id = event.order_id,
            qty = event.cum_qty,
            price = fill_price,
            tranche_id,
            created = matches!(outcome.action, crate::engine::tranches::EntryAction::Created { .. }),
            "entry fill assigned to tranche"
        );

        // Stamp the entry order with its tranche.
        let mut stamped = order.clone();
        stamped.tranche_id = Some(tranche_id);
        stamped.status = event.status;
        stamped.executed_qty = event.cum_qty;
        stamped.avg_fill_price = fill_price;
        stamped.final_at = Some(event.event_time_ms);
        self.store.upsert_order(&stamped).await?;

        // Orders orphaned by a forced merge.
        for order_id in &outcome.cancel_orders {
            if let Err(e) = self
                .protection
                .cancel_idempotent(&key.symbol, *order_id)
                .await
            {
                warn!(key = %key, order_id, error = %e, "merge-orphan cancel failed");
            }
        }
        if let Some((kept, gone)) = outcome.merged {
            self.protection.breaker().clear(&key, gone);
            info!(key = %key, kept, merged_away = gone, "tranches merged at cap");
        }

        for id in &outcome.rebuild {
            self.protection
                .rebuild(&mut book, *id, Some(event.order_id))
                .await?;
        }
        Ok(())
    }

    /// TP/SL/close reached a terminal state.
    async fn on_reduce_terminal(&self, order: &OrderRecord, event: &FillEvent) -> Result<()> {
        let key = PositionKey::new(order.symbol.clone(), order.position_side);
        let Some(tranche_id) = order.tranche_id else {
            debug!(order_id = event.order_id, "reduce order without tranche");
            return Ok(());
        };

        let book_arc = self.partitioner.book(&key).await?;
        let mut book = book_arc.lock().await;

        // Cancel/expire with nothing executed: if this leg is still the
        // tranche's current protection, rebuild it. Cancels issued by a
        // rebuild no longer match (ids were swapped first), and tranches
        // mid-market-close are skipped.
        if event.cum_qty <= 0.0 {
            if order.kind == OrderKind::Close {
                // A market reduce died without executing; lift the closing
                // guard so protection can rebuild again.
                self.protection.clear_closing(&key, tranche_id);
                self.reconcile_nudge.notify_one();
                return Ok(());
            }
            let still_current = book.get(tranche_id).map(|t| {
                t.tp_order_id == Some(event.order_id) || t.sl_order_id == Some(event.order_id)
            });
            if still_current == Some(true) && !self.protection.is_closing(&key, tranche_id) {
                info!(
                    key = %key,
                    tranche_id,
                    order_id = event.order_id,
                    status = event.status.as_str(),
                    "live protection leg terminated externally, rebuilding"
                );
                self.protection.rebuild(&mut book, tranche_id, None).await?;
            }
            return Ok(());
        }

        // The paired leg goes first, before the tranche is removed; a stop
        // that triggers mid-removal would otherwise fill into nothing.
        if let Some(snap) = book.get(tranche_id).cloned() {
            if matches!(order.kind, OrderKind::Tp | OrderKind::Sl) {
                self.protection.cancel_companion(&snap, order.kind).await?;
            }
        }

        match book.apply_reduction(tranche_id, event.cum_qty, event.event_time_ms) {
            ReduceOutcome::Removed { tranche } => {
                self.partitioner.persist(&book, &[tranche.tranche_id]).await?;
                info!(
                    key = %key,
                    tranche_id,
                    kind = order.kind.as_str(),
                    exit_price = event.avg_price,
                    "tranche closed"
                );
                if order.kind == OrderKind::Close {
                    // Fast-path / manual close: both resting legs go.
                    self.protection.cancel_protection(&tranche).await?;
                }
                self.protection.breaker().clear(&key, tranche_id);
                self.protection.clear_closing(&key, tranche_id);
                if let Some(rel) = self.store.find_companions(event.order_id).await? {
                    self.store.delete_relationship(rel.main_order_id).await?;
                }
            }
            ReduceOutcome::Reduced { remaining, .. } => {
                self.partitioner.persist(&book, &[]).await?;
                info!(
                    key = %key,
                    tranche_id,
                    remaining,
                    "tranche partially reduced, resizing protection"
                );
                self.protection.rebuild(&mut book, tranche_id, None).await?;
            }
            ReduceOutcome::UnknownTranche => {
                warn!(key = %key, tranche_id, "reduce fill for unknown tranche");
                self.reconcile_nudge.notify_one();
            }
        }
        Ok(())
    }
}
