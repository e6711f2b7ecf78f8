//! Periodic consistency sweep.
//!
//! The reconciler is the last-resort oracle: every other component may leave
//! a gap (stream drop, rejected cancel, crash between store writes) and
//! assume this sweep closes it against venue truth. Runs on a cadence, on
//! startup, and whenever another component nudges it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::protection::ProtectionManager;
use crate::engine::tranches::{ReduceOutcome, TranchePartitioner};
use crate::models::{OrderKind, OrderStatus, PositionKey};
use crate::store::Store;
use crate::streams::mark_price::MarkTable;
use crate::venue::VenueApi;

/// Relative tolerance for I2 (tranche sum vs venue position).
const QTY_TOLERANCE: f64 = 1e-6;

/// Liquidation retention beyond the rolling window.
const LIQUIDATION_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub recovery_tranches: u32,
    pub deleted_tranches: u32,
    pub relegged_tranches: u32,
    pub canceled_orphans: u32,
    pub canceled_stale_entries: u32,
    pub opportunistic_merges: u32,
}

pub struct Reconciler {
    cfg: Arc<Config>,
    venue: Arc<dyn VenueApi>,
    store: Store,
    partitioner: Arc<TranchePartitioner>,
    protection: Arc<ProtectionManager>,
    marks: Arc<MarkTable>,
    nudge: Arc<Notify>,
    /// When each unreferenced venue order was first observed, for orders the
    /// store has no placement time for. Entries drop out as soon as the
    /// order is referenced again or leaves the venue's open set.
    orphan_first_seen: Mutex<HashMap<i64, i64>>,
}

impl Reconciler {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn VenueApi>,
        store: Store,
        partitioner: Arc<TranchePartitioner>,
        protection: Arc<ProtectionManager>,
        marks: Arc<MarkTable>,
        nudge: Arc<Notify>,
    ) -> Self {
        Self {
            cfg,
            venue,
            store,
            partitioner,
            protection,
            marks,
            nudge,
            orphan_first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cadence = Duration::from_secs(self.cfg.reconcile_interval_secs.max(5));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(cadence) => {}
                _ = self.nudge.notified() => {
                    // Small debounce so a burst of nudges becomes one sweep.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            match self.sweep().await {
                Ok(report) => {
                    if report.recovery_tranches
                        + report.deleted_tranches
                        + report.relegged_tranches
                        + report.canceled_orphans
                        + report.canceled_stale_entries
                        + report.opportunistic_merges
                        > 0
                    {
                        info!(?report, "reconciliation sweep applied fixes");
                    }
                }
                Err(e) => warn!(error = %e, "reconciliation sweep failed"),
            }
        }
        info!("reconciler stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = chrono::Utc::now().timestamp_millis();

        let venue_positions = self.venue.position_risk().await?;
        let venue_open = self.venue.open_orders(None).await?;

        // --- I2: tranche sums vs venue positions ------------------------------
        let mut keys: HashSet<PositionKey> =
            self.partitioner.loaded_keys().into_iter().collect();
        for p in &venue_positions {
            keys.insert(PositionKey::new(p.symbol.clone(), p.position_side));
        }

        for key in keys {
            let venue_qty = venue_positions
                .iter()
                .find(|p| p.symbol == key.symbol && p.position_side == key.position_side)
                .map(|p| p.qty)
                .unwrap_or(0.0);
            let mark = venue_positions
                .iter()
                .find(|p| p.symbol == key.symbol)
                .and_then(|p| p.mark_price)
                .or_else(|| self.marks.get(&key.symbol));

            let book_arc = self.partitioner.book(&key).await?;
            let mut book = book_arc.lock().await;
            let tranche_qty = book.total_qty();
            let tolerance = QTY_TOLERANCE * venue_qty.max(tranche_qty).max(1.0);

            if (tranche_qty - venue_qty).abs() <= tolerance {
                // Quantities agree; check protection legs below.
            } else if venue_qty > tranche_qty {
                // Orphan quantity on the venue: wrap it in a recovery
                // tranche at the current mark so it gets protection.
                let Some(mark) = mark else {
                    warn!(key = %key, "orphan venue quantity but no mark price; deferring");
                    continue;
                };
                let orphan = venue_qty - tranche_qty;
                warn!(
                    key = %key,
                    orphan,
                    venue_qty,
                    tranche_qty,
                    "position drift: creating recovery tranche"
                );
                let id = book.create_recovery_tranche(orphan, mark, now);
                self.partitioner.persist(&book, &[]).await?;
                self.protection.rebuild(&mut book, id, None).await?;
                report.recovery_tranches += 1;
            } else if venue_qty <= tolerance {
                // Venue says flat: every tranche here is stale.
                warn!(
                    key = %key,
                    tranche_qty,
                    "venue position is flat, deleting stale tranches"
                );
                let stale: Vec<_> = book.tranches.drain(..).collect();
                let removed_ids: Vec<u64> = stale.iter().map(|t| t.tranche_id).collect();
                self.partitioner.persist(&book, &removed_ids).await?;
                for t in &stale {
                    self.protection.cancel_protection(t).await?;
                    report.deleted_tranches += 1;
                }
            } else {
                // Venue holds less than the books say: shrink from the most
                // recent tranche until the sums agree.
                warn!(
                    key = %key,
                    venue_qty,
                    tranche_qty,
                    "position drift: shrinking tranches to venue truth"
                );
                let mut excess = tranche_qty - venue_qty;
                while excess > tolerance {
                    let Some(last) = book.tranches.last().cloned() else {
                        break;
                    };
                    let cut = excess.min(last.quantity);
                    match book.apply_reduction(last.tranche_id, cut, now) {
                        ReduceOutcome::Removed { tranche } => {
                            self.partitioner.persist(&book, &[tranche.tranche_id]).await?;
                            self.protection.cancel_protection(&tranche).await?;
                            report.deleted_tranches += 1;
                        }
                        ReduceOutcome::Reduced { tranche_id, .. } => {
                            self.partitioner.persist(&book, &[]).await?;
                            self.protection.rebuild(&mut book, tranche_id, None).await?;
                            report.relegged_tranches += 1;
                        }
                        ReduceOutcome::UnknownTranche => break,
                    }
                    excess -= cut;
                }
            }

            // --- Missing protection legs ---------------------------------
            let needs_legs: Vec<u64> = book
                .tranches
                .iter()
                .filter(|t| {
                    let sc = self.cfg.symbols.get(&t.symbol);
                    let wants_tp =
                        sc.map(|s| s.take_profit_enabled).unwrap_or(false) && t.tp_order_id.is_none();
                    let wants_sl =
                        sc.map(|s| s.stop_loss_enabled).unwrap_or(false) && t.sl_order_id.is_none();
                    t.quantity > 0.0 && (wants_tp || wants_sl || t.unprotected)
                })
                .map(|t| t.tranche_id)
                .collect();
            for id in needs_legs {
                self.protection.rebuild(&mut book, id, None).await?;
                report.relegged_tranches += 1;
            }

            // --- Opportunistic profitable merge --------------------------
            if let Some(mark) = mark {
                if let Some((into, from)) = book.profitable_merge_pair(mark) {
                    let (kept, gone, orphans) = book.merge(into, from, now);
                    self.partitioner.persist(&book, &[gone]).await?;
                    for order_id in orphans {
                        let _ = self
                            .protection
                            .cancel_idempotent(&key.symbol, order_id)
                            .await;
                    }
                    self.protection.breaker().clear(&key, gone);
                    self.protection.rebuild(&mut book, kept, None).await?;
                    info!(key = %key, kept, merged_away = gone, mark, "profitable tranche pair merged");
                    report.opportunistic_merges += 1;
                }
            }
        }

        // --- Orphaned venue orders -------------------------------------------
        // Orders the venue holds open that no tranche references and the
        // store does not track as a live entry. Only canceled once they have
        // stayed unreferenced past the order TTL: a rebuild places its new
        // legs on the venue before the tranche ids swap and persist, so a
        // sweep running in that window must not race them away.
        let mut referenced: HashSet<i64> = HashSet::new();
        for t in self.partitioner.snapshot().await {
            referenced.extend(t.tp_order_id);
            referenced.extend(t.sl_order_id);
        }
        let live_entries = self.store.non_terminal_orders().await?;
        for o in &live_entries {
            referenced.insert(o.order_id);
        }
        let ttl = self.cfg.order_ttl_ms as i64;

        let mut orphans: Vec<(i64, String, Option<i64>)> = Vec::new();
        for ack in &venue_open {
            if referenced.contains(&ack.order_id) {
                continue;
            }
            let placed_at = self
                .store
                .get_order(ack.order_id)
                .await?
                .map(|o| o.placed_at);
            orphans.push((ack.order_id, ack.symbol.clone(), placed_at));
        }

        // Age basis: the stored placement time when the order is ours, else
        // the first sweep that saw it unreferenced.
        {
            let mut seen = self.orphan_first_seen.lock();
            let orphan_ids: HashSet<i64> = orphans.iter().map(|(id, _, _)| *id).collect();
            seen.retain(|id, _| orphan_ids.contains(id));
            for (id, _, placed_at) in &orphans {
                if placed_at.is_none() {
                    seen.entry(*id).or_insert(now);
                }
            }
        }

        for (order_id, symbol, placed_at) in orphans {
            let since = placed_at
                .or_else(|| self.orphan_first_seen.lock().get(&order_id).copied())
                .unwrap_or(now);
            if now - since < ttl {
                continue;
            }
            warn!(
                symbol = %symbol,
                order_id,
                age_ms = now - since,
                "canceling venue order with no engine reference"
            );
            if self
                .protection
                .cancel_idempotent(&symbol, order_id)
                .await
                .is_ok()
            {
                report.canceled_orphans += 1;
                self.orphan_first_seen.lock().remove(&order_id);
            }
        }

        // --- Stale entry orders (TTL) ----------------------------------------
        for order in live_entries {
            if order.kind != OrderKind::Entry {
                continue;
            }
            if now - order.placed_at < ttl {
                continue;
            }
            info!(
                symbol = %order.symbol,
                order_id = order.order_id,
                age_ms = now - order.placed_at,
                "canceling stale entry order"
            );
            if self
                .protection
                .cancel_idempotent(&order.symbol, order.order_id)
                .await
                .is_ok()
            {
                report.canceled_stale_entries += 1;
                self.store
                    .update_order_execution(
                        order.order_id,
                        OrderStatus::Canceled,
                        order.executed_qty,
                        order.avg_fill_price,
                        Some(now),
                    )
                    .await?;
                // Companion legs registered for this entry go with it.
                if let Some(rel) = self.store.find_companions(order.order_id).await? {
                    for companion in [rel.tp_order_id, rel.sl_order_id].into_iter().flatten() {
                        let _ = self
                            .protection
                            .cancel_idempotent(&order.symbol, companion)
                            .await;
                    }
                }
            }
        }

        self.store
            .prune_liquidations(now - LIQUIDATION_RETENTION_MS.max(self.cfg.window_ms as i64))
            .await?;

        Ok(report)
    }
}
