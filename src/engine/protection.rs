//! Protective-order management.
//!
//! Each live tranche carries at most one TP (limit, reduce-only) and one SL
//! (stop-market, reduce-only), both derived from the tranche's own average
//! entry and rounded away from it so the protection is never looser than
//! configured. Rebuilds cancel the old legs and place new ones, batched
//! where the venue supports it. This module owns the `tp_order_id` /
//! `sl_order_id` fields; it never mutates tranche quantities.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::breaker::CircuitBreaker;
use crate::engine::tranches::TrancheBook;
use crate::error::VenueError;
use crate::models::{
    OrderKind, OrderRecord, OrderRelationship, OrderStatus, PositionSide, Tranche,
};
use crate::store::Store;
use crate::venue::governor::Priority;
use crate::venue::specs::SpecCache;
use crate::venue::{NewOrder, OrderType, VenueApi};

const REBUILD_ATTEMPTS: u32 = 3;
const REBUILD_BACKOFF_MS: u64 = 250;

pub struct ProtectionManager {
    cfg: Arc<Config>,
    venue: Arc<dyn VenueApi>,
    store: Store,
    specs: Arc<SpecCache>,
    breaker: Arc<CircuitBreaker>,
    /// Tranches with a market reduce in flight. The fill router must not
    /// rebuild protection for these when the canceled TP event arrives.
    closing: parking_lot::Mutex<std::collections::HashSet<(crate::models::PositionKey, u64)>>,
}

/// TP/SL price pair for a tranche, tick-rounded away from entry.
pub fn protection_prices(
    side: PositionSide,
    avg_entry: f64,
    tp_pct: f64,
    sl_pct: f64,
) -> (f64, f64) {
    match side {
        PositionSide::Long => (
            avg_entry * (1.0 + tp_pct / 100.0),
            avg_entry * (1.0 - sl_pct / 100.0),
        ),
        PositionSide::Short => (
            avg_entry * (1.0 - tp_pct / 100.0),
            avg_entry * (1.0 + sl_pct / 100.0),
        ),
    }
}

impl ProtectionManager {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn VenueApi>,
        store: Store,
        specs: Arc<SpecCache>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            cfg,
            venue,
            store,
            specs,
            breaker,
            closing: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_closing(&self, key: &crate::models::PositionKey, tranche_id: u64) -> bool {
        self.closing.lock().contains(&(key.clone(), tranche_id))
    }

    pub fn clear_closing(&self, key: &crate::models::PositionKey, tranche_id: u64) {
        self.closing.lock().remove(&(key.clone(), tranche_id));
    }

    fn position_side_param(&self, side: PositionSide) -> Option<PositionSide> {
        if self.cfg.hedge_mode {
            Some(side)
        } else {
            None
        }
    }

    /// Build the TP/SL descriptors for a tranche per its symbol config.
    /// Either leg may be disabled.
    fn descriptors(&self, tranche: &Tranche) -> (Option<NewOrder>, Option<NewOrder>) {
        let Some(sc) = self.cfg.symbols.get(&tranche.symbol) else {
            return (None, None);
        };
        let side = tranche.position_side;
        let exit = side.reduce_side();
        let (raw_tp, raw_sl) = protection_prices(
            side,
            tranche.avg_entry_price,
            sc.take_profit_pct,
            sc.stop_loss_pct,
        );
        let spec = self.specs.get(&tranche.symbol);
        // Away from entry: the favorable leg rounds further out, the stop
        // rounds further down(for LONG)/up(for SHORT).
        let (tp_price, sl_price) = match (spec, side) {
            (Some(s), PositionSide::Long) => (s.round_price(raw_tp, true), s.round_price(raw_sl, false)),
            (Some(s), PositionSide::Short) => (s.round_price(raw_tp, false), s.round_price(raw_sl, true)),
            (None, _) => (raw_tp, raw_sl),
        };

        let tp = sc.take_profit_enabled.then(|| NewOrder {
            symbol: tranche.symbol.clone(),
            side: exit,
            position_side: self.position_side_param(side),
            order_type: OrderType::Limit,
            qty: tranche.quantity,
            price: Some(tp_price),
            stop_price: None,
            reduce_only: true,
            time_in_force: Some(self.cfg.time_in_force),
            client_id: format!("lh-tp-{}", Uuid::new_v4().simple()),
            working_type: None,
            price_protect: false,
            priority: Priority::Normal,
        });
        let sl = sc.stop_loss_enabled.then(|| NewOrder {
            symbol: tranche.symbol.clone(),
            side: exit,
            position_side: self.position_side_param(side),
            order_type: OrderType::StopMarket,
            qty: tranche.quantity,
            price: None,
            stop_price: Some(sl_price),
            reduce_only: true,
            time_in_force: None,
            client_id: format!("lh-sl-{}", Uuid::new_v4().simple()),
            working_type: Some(sc.working_type),
            price_protect: sc.price_protect,
            priority: Priority::Normal,
        });
        (tp, sl)
    }

    /// Cancel that treats already-terminal orders as success.
    pub async fn cancel_idempotent(&self, symbol: &str, order_id: i64) -> Result<(), VenueError> {
        match self.venue.cancel_order(symbol, order_id).await {
            Ok(()) => Ok(()),
            Err(VenueError::OrderNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Rebuild protocol: snapshot old ids, cancel them, place fresh legs for
    /// the current quantity and prices, then swap the tranche's order ids
    /// atomically (under the caller-held book lock).
    pub async fn rebuild(
        &self,
        book: &mut TrancheBook,
        tranche_id: u64,
        main_order_id: Option<i64>,
    ) -> Result<()> {
        let key = book.key.clone();
        let Some(snapshot) = book.get(tranche_id).cloned() else {
            return Ok(());
        };
        if snapshot.quantity <= 0.0 {
            return Ok(());
        }
        if !self.breaker.allows(&key, tranche_id) {
            warn!(key = %key, tranche_id, "rebuild skipped, circuit breaker open");
            self.flag_unprotected(book, tranche_id, true).await?;
            return Ok(());
        }

        let (tp_desc, sl_desc) = self.descriptors(&snapshot);
        if tp_desc.is_none() && sl_desc.is_none() {
            return Ok(());
        }

        // Cancel the old legs first in every mode; a lingering old TP plus a
        // new one would violate the one-live-TP invariant.
        for old_id in [snapshot.tp_order_id, snapshot.sl_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.cancel_idempotent(&key.symbol, old_id).await {
                warn!(key = %key, tranche_id, order_id = old_id, error = %e, "old protection cancel failed");
            }
        }

        let mut attempt = 0u32;
        let placed = loop {
            attempt += 1;
            match self.place_legs(&tp_desc, &sl_desc).await {
                Ok(placed) => break Some(placed),
                Err(e) => {
                    warn!(
                        key = %key,
                        tranche_id,
                        attempt,
                        error = %e,
                        "protection placement failed"
                    );
                    if attempt >= REBUILD_ATTEMPTS {
                        break None;
                    }
                    tokio::time::sleep(Duration::from_millis(
                        REBUILD_BACKOFF_MS * 2u64.pow(attempt - 1),
                    ))
                    .await;
                }
            }
        };

        match placed {
            Some((tp_id, sl_id)) => {
                self.breaker.record_success(&key, tranche_id);
                let now = chrono::Utc::now().timestamp_millis();
                if let Some(t) = book.get_mut(tranche_id) {
                    t.tp_order_id = tp_id;
                    t.sl_order_id = sl_id;
                    t.unprotected = false;
                    t.updated_at = now;
                    self.store.upsert_tranche(t).await?;
                }
                self.record_leg_orders(&snapshot, &tp_desc, tp_id, &sl_desc, sl_id, main_order_id)
                    .await?;
                if let Some(main) = main_order_id {
                    self.store
                        .insert_relationship(&OrderRelationship {
                            main_order_id: main,
                            tp_order_id: tp_id,
                            sl_order_id: sl_id,
                            tranche_id,
                            created_at: now,
                        })
                        .await?;
                }
                info!(
                    key = %key,
                    tranche_id,
                    tp_order_id = ?tp_id,
                    sl_order_id = ?sl_id,
                    qty = snapshot.quantity,
                    "protection rebuilt"
                );
                Ok(())
            }
            None => {
                self.breaker.record_failure(&key, tranche_id);
                error!(key = %key, tranche_id, "tranche unprotected after repeated rebuild failures");
                self.flag_unprotected(book, tranche_id, true).await?;
                Ok(())
            }
        }
    }

    async fn flag_unprotected(&self, book: &mut TrancheBook, tranche_id: u64, flag: bool) -> Result<()> {
        if let Some(t) = book.get_mut(tranche_id) {
            if t.unprotected != flag {
                t.unprotected = flag;
                self.store.upsert_tranche(t).await?;
            }
        }
        Ok(())
    }

    /// Place both legs, batched when enabled. Returns venue ids per leg.
    /// All-or-nothing: a partial failure cancels whatever leg did land, so a
    /// retry can never leave two live TPs or SLs behind.
    async fn place_legs(
        &self,
        tp: &Option<NewOrder>,
        sl: &Option<NewOrder>,
    ) -> Result<(Option<i64>, Option<i64>), VenueError> {
        let descriptors: Vec<&NewOrder> = tp.iter().chain(sl.iter()).collect();
        let symbol = match descriptors.first() {
            Some(d) => d.symbol.clone(),
            None => return Ok((None, None)),
        };

        if self.cfg.batch_orders_enabled && descriptors.len() > 1 {
            let orders: Vec<NewOrder> = descriptors.iter().map(|o| (*o).clone()).collect();
            let results = self.venue.place_batch(&orders).await?;
            let mut ids: Vec<Option<i64>> = Vec::with_capacity(results.len());
            let mut first_err = None;
            for r in results {
                match r {
                    Ok(ack) => ids.push(Some(ack.order_id)),
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                        ids.push(None);
                    }
                }
            }
            if let Some(e) = first_err {
                for id in ids.into_iter().flatten() {
                    let _ = self.cancel_idempotent(&symbol, id).await;
                }
                return Err(e);
            }
            let mut iter = ids.into_iter().flatten();
            let tp_id = tp.as_ref().and_then(|_| iter.next());
            let sl_id = sl.as_ref().and_then(|_| iter.next());
            return Ok((tp_id, sl_id));
        }

        let mut tp_id = None;
        if let Some(desc) = tp {
            tp_id = Some(self.venue.place_order(desc).await?.order_id);
        }
        let mut sl_id = None;
        if let Some(desc) = sl {
            match self.venue.place_order(desc).await {
                Ok(ack) => sl_id = Some(ack.order_id),
                Err(e) => {
                    if let Some(id) = tp_id {
                        let _ = self.cancel_idempotent(&symbol, id).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok((tp_id, sl_id))
    }

    async fn record_leg_orders(
        &self,
        tranche: &Tranche,
        tp_desc: &Option<NewOrder>,
        tp_id: Option<i64>,
        sl_desc: &Option<NewOrder>,
        sl_id: Option<i64>,
        parent: Option<i64>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        for (desc, id, kind) in [
            (tp_desc, tp_id, OrderKind::Tp),
            (sl_desc, sl_id, OrderKind::Sl),
        ] {
            let (Some(desc), Some(order_id)) = (desc, id) else {
                continue;
            };
            self.store
                .upsert_order(&OrderRecord {
                    order_id,
                    client_id: desc.client_id.clone(),
                    symbol: desc.symbol.clone(),
                    position_side: tranche.position_side,
                    kind,
                    side: desc.side,
                    qty: desc.qty,
                    price: desc.price,
                    stop_price: desc.stop_price,
                    status: OrderStatus::New,
                    tranche_id: Some(tranche.tranche_id),
                    parent_order_id: parent,
                    placed_at: now,
                    final_at: None,
                    executed_qty: 0.0,
                    avg_fill_price: 0.0,
                    time_in_force: desc.time_in_force.unwrap_or(self.cfg.time_in_force),
                })
                .await?;
        }
        Ok(())
    }

    /// Cancel both protective legs of a destroyed or merged-away tranche.
    /// Idempotent; ignores already-terminal legs.
    pub async fn cancel_protection(&self, tranche: &Tranche) -> Result<()> {
        for order_id in [tranche.tp_order_id, tranche.sl_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.cancel_idempotent(&tranche.symbol, order_id).await {
                warn!(
                    symbol = %tranche.symbol,
                    tranche_id = tranche.tranche_id,
                    order_id,
                    error = %e,
                    "protection cancel failed"
                );
            }
        }
        self.breaker.clear(
            &crate::models::PositionKey::new(tranche.symbol.clone(), tranche.position_side),
            tranche.tranche_id,
        );
        Ok(())
    }

    /// Cancel the paired leg after one side filled (TP filled => cancel SL,
    /// and vice versa).
    pub async fn cancel_companion(&self, tranche: &Tranche, filled_kind: OrderKind) -> Result<()> {
        let companion = match filled_kind {
            OrderKind::Tp => tranche.sl_order_id,
            OrderKind::Sl => tranche.tp_order_id,
            _ => None,
        };
        if let Some(order_id) = companion {
            self.cancel_idempotent(&tranche.symbol, order_id)
                .await
                .map_err(|e| anyhow::anyhow!("companion cancel: {e}"))?;
        }
        Ok(())
    }

    /// Immediate market reduce of a tranche (fast path and explicit close).
    /// The resting TP is canceled first; "already filled" on that cancel is
    /// accepted and the market order is skipped, since the fill will arrive
    /// through the user-data stream anyway.
    pub async fn market_reduce(
        &self,
        tranche: &Tranche,
        cancel_tp_first: bool,
    ) -> Result<Option<i64>, VenueError> {
        let key =
            crate::models::PositionKey::new(tranche.symbol.clone(), tranche.position_side);
        if !self.breaker.allows(&key, tranche.tranche_id) {
            return Ok(None);
        }
        self.closing.lock().insert((key.clone(), tranche.tranche_id));

        if cancel_tp_first {
            if let Some(tp_id) = tranche.tp_order_id {
                match self.venue.cancel_order(&tranche.symbol, tp_id).await {
                    Ok(()) => {}
                    // The TP filled in the race window: no market order needed.
                    Err(VenueError::OrderNotFound) => return Ok(None),
                    Err(e) => {
                        self.breaker.record_failure(&key, tranche.tranche_id);
                        self.clear_closing(&key, tranche.tranche_id);
                        return Err(e);
                    }
                }
            }
        }

        let order = NewOrder {
            symbol: tranche.symbol.clone(),
            side: tranche.position_side.reduce_side(),
            position_side: self.position_side_param(tranche.position_side),
            order_type: OrderType::Market,
            qty: tranche.quantity,
            price: None,
            stop_price: None,
            reduce_only: true,
            time_in_force: None,
            client_id: format!("lh-close-{}", Uuid::new_v4().simple()),
            working_type: None,
            price_protect: false,
            priority: Priority::Critical,
        };
        match self.venue.place_order(&order).await {
            Ok(ack) => {
                self.breaker.record_success(&key, tranche.tranche_id);
                let now = chrono::Utc::now().timestamp_millis();
                self.store
                    .upsert_order(&OrderRecord {
                        order_id: ack.order_id,
                        client_id: order.client_id.clone(),
                        symbol: order.symbol.clone(),
                        position_side: tranche.position_side,
                        kind: OrderKind::Close,
                        side: order.side,
                        qty: order.qty,
                        price: None,
                        stop_price: None,
                        status: OrderStatus::New,
                        tranche_id: Some(tranche.tranche_id),
                        parent_order_id: None,
                        placed_at: now,
                        final_at: None,
                        executed_qty: 0.0,
                        avg_fill_price: 0.0,
                        time_in_force: crate::models::TimeInForce::Gtc,
                    })
                    .await
                    .ok();
                Ok(Some(ack.order_id))
            }
            Err(e) => {
                self.breaker.record_failure(&key, tranche.tranche_id);
                self.clear_closing(&key, tranche.tranche_id);
                Err(e)
            }
        }
    }
}
