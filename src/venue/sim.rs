//! Simulated venue.
//!
//! Implements `VenueApi` without touching the network: orders get synthetic
//! ids and produce synthetic `FillEvent`s through the same channel the
//! user-data stream feeds in live mode, so the tranche/protection pipeline
//! runs identically under `simulate_only`. Integration tests drive it
//! directly (controlled fills, inspectable order log).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{VenueError, VenueResult};
use crate::models::{FillEvent, MarginType, OrderStatus, PositionKey, PositionSide};
use crate::venue::specs::SymbolSpec;
use crate::venue::wire::DepthSnapshot;
use crate::venue::{AccountSnapshot, NewOrder, OrderAck, OrderType, VenueApi, VenuePosition};

#[derive(Debug, Clone)]
pub struct SimOrder {
    pub order_id: i64,
    pub order: NewOrder,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
}

#[derive(Default)]
struct SimState {
    orders: HashMap<i64, SimOrder>,
    positions: HashMap<PositionKey, f64>,
    leverage_calls: Vec<(String, u32)>,
    margin_calls: Vec<(String, MarginType)>,
    hedge_mode: Option<bool>,
}

pub struct SimulatedVenue {
    next_id: AtomicI64,
    state: Mutex<SimState>,
    marks: RwLock<HashMap<String, f64>>,
    depth: RwLock<HashMap<String, DepthSnapshot>>,
    specs: RwLock<Vec<(String, SymbolSpec)>>,
    fill_tx: mpsc::UnboundedSender<FillEvent>,
    /// Fill entry orders immediately at their limit price (production
    /// simulate-only behavior). Tests turn this off to control fills.
    auto_fill: bool,
}

impl SimulatedVenue {
    pub fn new(fill_tx: mpsc::UnboundedSender<FillEvent>, auto_fill: bool) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            state: Mutex::new(SimState::default()),
            marks: RwLock::new(HashMap::new()),
            depth: RwLock::new(HashMap::new()),
            specs: RwLock::new(Vec::new()),
            fill_tx,
            auto_fill,
        }
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.marks.write().insert(symbol.to_string(), price);
    }

    pub fn set_depth(&self, symbol: &str, best_bid: f64, best_ask: f64) {
        self.depth
            .write()
            .insert(symbol.to_string(), DepthSnapshot { best_bid, best_ask });
    }

    pub fn set_specs(&self, specs: Vec<(String, SymbolSpec)>) {
        *self.specs.write() = specs;
    }

    /// All orders ever placed, in id order.
    pub fn orders(&self) -> Vec<SimOrder> {
        let state = self.state.lock();
        let mut out: Vec<SimOrder> = state.orders.values().cloned().collect();
        out.sort_by_key(|o| o.order_id);
        out
    }

    pub fn order(&self, order_id: i64) -> Option<SimOrder> {
        self.state.lock().orders.get(&order_id).cloned()
    }

    pub fn live_orders(&self) -> Vec<SimOrder> {
        self.orders()
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .collect()
    }

    pub fn position(&self, symbol: &str, side: PositionSide) -> f64 {
        self.state
            .lock()
            .positions
            .get(&PositionKey::new(symbol, side))
            .copied()
            .unwrap_or(0.0)
    }

    /// Directly set a venue position, bypassing order flow. Used to model
    /// drift the reconciler must repair.
    pub fn force_position(&self, symbol: &str, side: PositionSide, qty: f64) {
        self.state
            .lock()
            .positions
            .insert(PositionKey::new(symbol, side), qty);
    }

    /// Fill a resting order (fully) at `price` and emit the fill event.
    pub fn fire_fill(&self, order_id: i64, price: f64) -> VenueResult<()> {
        let event = {
            let mut state = self.state.lock();
            let sim = state
                .orders
                .get_mut(&order_id)
                .ok_or(VenueError::OrderNotFound)?;
            if sim.status.is_terminal() {
                return Err(VenueError::OrderNotFound);
            }
            sim.status = OrderStatus::Filled;
            sim.executed_qty = sim.order.qty;
            sim.avg_price = price;
            let event = fill_event_for(sim, OrderStatus::Filled, sim.order.qty, price);
            let qty = sim.order.qty;
            let opens = sim.order.side == event.position_side.entry_side();
            let key = PositionKey::new(sim.order.symbol.clone(), event.position_side);

            let entry = state.positions.entry(key).or_insert(0.0);
            if opens {
                *entry += qty;
            } else {
                *entry = (*entry - qty).max(0.0);
            }
            event
        };
        let _ = self.fill_tx.send(event);
        Ok(())
    }

    fn emit_cancel(&self, sim: &SimOrder) {
        let event = fill_event_for(sim, OrderStatus::Canceled, 0.0, 0.0);
        let _ = self.fill_tx.send(event);
    }

    fn fill_price_for(&self, order: &NewOrder) -> f64 {
        match order.order_type {
            OrderType::Limit => order.price.unwrap_or(0.0),
            OrderType::StopMarket => order.stop_price.unwrap_or(0.0),
            OrderType::Market => self
                .marks
                .read()
                .get(&order.symbol)
                .copied()
                .unwrap_or_else(|| order.price.unwrap_or(0.0)),
        }
    }
}

fn fill_event_for(sim: &SimOrder, status: OrderStatus, last_qty: f64, price: f64) -> FillEvent {
    let position_side = sim
        .order
        .position_side
        .unwrap_or(match sim.order.side {
            crate::models::Side::Buy => PositionSide::Long,
            crate::models::Side::Sell => PositionSide::Short,
        });
    FillEvent {
        order_id: sim.order_id,
        client_id: sim.order.client_id.clone(),
        symbol: sim.order.symbol.clone(),
        side: sim.order.side,
        position_side,
        status,
        last_qty,
        cum_qty: sim.executed_qty,
        avg_price: price,
        last_price: price,
        commission: 0.0,
        reduce_only: sim.order.reduce_only,
        event_time_ms: chrono::Utc::now().timestamp_millis(),
    }
}

#[async_trait::async_trait]
impl VenueApi for SimulatedVenue {
    async fn exchange_info(&self) -> VenueResult<Vec<(String, SymbolSpec)>> {
        Ok(self.specs.read().clone())
    }

    async fn depth(&self, symbol: &str, _limit: u32) -> VenueResult<DepthSnapshot> {
        if let Some(snap) = self.depth.read().get(symbol) {
            return Ok(*snap);
        }
        // Fall back to a synthetic one-tick book around the mark.
        let mark = self
            .marks
            .read()
            .get(symbol)
            .copied()
            .ok_or(VenueError::PositionNotFound)?;
        Ok(DepthSnapshot {
            best_bid: mark,
            best_ask: mark,
        })
    }

    async fn place_order(&self, order: &NewOrder) -> VenueResult<OrderAck> {
        let order_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Same client id twice must not create a second venue order.
        {
            let state = self.state.lock();
            if let Some(existing) = state
                .orders
                .values()
                .find(|o| o.order.client_id == order.client_id && !o.status.is_terminal())
            {
                return Ok(OrderAck {
                    order_id: existing.order_id,
                    client_id: existing.order.client_id.clone(),
                    symbol: existing.order.symbol.clone(),
                    status: Some(existing.status),
                    executed_qty: existing.executed_qty,
                    avg_price: existing.avg_price,
                });
            }
        }
        let sim = SimOrder {
            order_id,
            order: order.clone(),
            status: OrderStatus::New,
            executed_qty: 0.0,
            avg_price: 0.0,
        };
        self.state.lock().orders.insert(order_id, sim);
        debug!(
            order_id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            kind = order.order_type.as_str(),
            "sim order placed"
        );

        let auto = self.auto_fill
            && matches!(order.order_type, OrderType::Limit | OrderType::Market)
            && !order.reduce_only;
        let market = order.order_type == OrderType::Market;
        if auto || market {
            let price = self.fill_price_for(order);
            if price > 0.0 {
                // Deliberately after insert so the ack-then-fill ordering of
                // the live venue is preserved.
                self.fire_fill(order_id, price)?;
            }
        }

        Ok(OrderAck {
            order_id,
            client_id: order.client_id.clone(),
            symbol: order.symbol.clone(),
            status: Some(OrderStatus::New),
            executed_qty: 0.0,
            avg_price: 0.0,
        })
    }

    async fn place_batch(&self, orders: &[NewOrder]) -> VenueResult<Vec<VenueResult<OrderAck>>> {
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            out.push(self.place_order(order).await);
        }
        Ok(out)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> VenueResult<()> {
        let sim = {
            let mut state = self.state.lock();
            let Some(sim) = state.orders.get_mut(&order_id) else {
                return Err(VenueError::OrderNotFound);
            };
            if sim.status.is_terminal() {
                return Err(VenueError::OrderNotFound);
            }
            sim.status = OrderStatus::Canceled;
            sim.clone()
        };
        self.emit_cancel(&sim);
        Ok(())
    }

    async fn cancel_all_open(&self, symbol: &str) -> VenueResult<()> {
        let ids: Vec<i64> = self
            .live_orders()
            .into_iter()
            .filter(|o| o.order.symbol == symbol)
            .map(|o| o.order_id)
            .collect();
        for id in ids {
            let _ = self.cancel_order(symbol, id).await;
        }
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> VenueResult<Vec<OrderAck>> {
        Ok(self
            .live_orders()
            .into_iter()
            .filter(|o| symbol.map(|s| o.order.symbol == s).unwrap_or(true))
            .map(|o| OrderAck {
                order_id: o.order_id,
                client_id: o.order.client_id.clone(),
                symbol: o.order.symbol.clone(),
                status: Some(o.status),
                executed_qty: o.executed_qty,
                avg_price: o.avg_price,
            })
            .collect())
    }

    async fn account(&self) -> VenueResult<AccountSnapshot> {
        Ok(AccountSnapshot {
            total_wallet_balance: 100_000.0,
            available_balance: 100_000.0,
            total_unrealized_profit: 0.0,
        })
    }

    async fn position_risk(&self) -> VenueResult<Vec<VenuePosition>> {
        let marks = self.marks.read();
        Ok(self
            .state
            .lock()
            .positions
            .iter()
            .filter(|(_, qty)| **qty > 0.0)
            .map(|(key, qty)| VenuePosition {
                symbol: key.symbol.clone(),
                position_side: key.position_side,
                qty: *qty,
                entry_price: 0.0,
                mark_price: marks.get(&key.symbol).copied(),
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        self.state
            .lock()
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> VenueResult<()> {
        self.state
            .lock()
            .margin_calls
            .push((symbol.to_string(), margin_type));
        Ok(())
    }

    async fn set_position_mode(&self, hedge: bool) -> VenueResult<()> {
        self.state.lock().hedge_mode = Some(hedge);
        Ok(())
    }

    async fn set_multi_assets_mode(&self, _enabled: bool) -> VenueResult<()> {
        Ok(())
    }

    async fn listen_key_create(&self) -> VenueResult<String> {
        Ok("sim-listen-key".to_string())
    }

    async fn listen_key_keepalive(&self, _key: &str) -> VenueResult<()> {
        Ok(())
    }

    async fn listen_key_delete(&self, _key: &str) -> VenueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TimeInForce};
    use crate::venue::governor::Priority;

    fn limit_order(client_id: &str) -> NewOrder {
        NewOrder {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            position_side: Some(PositionSide::Long),
            order_type: OrderType::Limit,
            qty: 0.016,
            price: Some(59_940.0),
            stop_price: None,
            reduce_only: false,
            time_in_force: Some(TimeInForce::Gtc),
            client_id: client_id.to_string(),
            working_type: None,
            price_protect: false,
            priority: Priority::Critical,
        }
    }

    #[tokio::test]
    async fn auto_fill_emits_fill_event_and_builds_position() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let venue = SimulatedVenue::new(tx, true);
        let ack = venue.place_order(&limit_order("a")).await.unwrap();
        let fill = rx.recv().await.unwrap();
        assert_eq!(fill.order_id, ack.order_id);
        assert_eq!(fill.status, OrderStatus::Filled);
        assert!((fill.avg_price - 59_940.0).abs() < 1e-9);
        assert!((venue.position("BTCUSDT", PositionSide::Long) - 0.016).abs() < 1e-12);
    }

    #[tokio::test]
    async fn same_client_id_twice_yields_one_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let venue = SimulatedVenue::new(tx, false);
        let a = venue.place_order(&limit_order("dup")).await.unwrap();
        let b = venue.place_order(&limit_order("dup")).await.unwrap();
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(venue.orders().len(), 1);
    }

    #[tokio::test]
    async fn cancel_of_terminal_order_reports_not_found() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let venue = SimulatedVenue::new(tx, false);
        let ack = venue.place_order(&limit_order("c")).await.unwrap();
        venue.cancel_order("BTCUSDT", ack.order_id).await.unwrap();
        let err = venue
            .cancel_order("BTCUSDT", ack.order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::OrderNotFound));
    }

    #[tokio::test]
    async fn reduce_fill_shrinks_position() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let venue = SimulatedVenue::new(tx, false);
        let ack = venue.place_order(&limit_order("e")).await.unwrap();
        venue.fire_fill(ack.order_id, 59_940.0).unwrap();

        let mut reduce = limit_order("r");
        reduce.side = Side::Sell;
        reduce.reduce_only = true;
        let ack2 = venue.place_order(&reduce).await.unwrap();
        venue.fire_fill(ack2.order_id, 61_138.8).unwrap();
        assert!(venue.position("BTCUSDT", PositionSide::Long).abs() < 1e-12);
    }
}
