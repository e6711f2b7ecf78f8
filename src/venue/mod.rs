//! Venue access: admission control, signed REST client, symbol specs and the
//! simulated venue used in simulate-only mode.

pub mod client;
pub mod governor;
pub mod sim;
pub mod specs;
pub mod wire;

use async_trait::async_trait;

use crate::error::VenueResult;
use crate::models::{MarginType, PositionSide, Side, TimeInForce, WorkingType};
use crate::venue::governor::Priority;
use crate::venue::specs::SymbolSpec;
use crate::venue::wire::DepthSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

/// An order descriptor ready for submission. Prices and quantities are
/// already rounded to the symbol spec by the caller.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    /// Set under hedge mode; `reduce_only` must then be omitted on the wire
    /// (the venue rejects both together).
    pub position_side: Option<PositionSide>,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub time_in_force: Option<TimeInForce>,
    /// Client-generated idempotency id.
    pub client_id: String,
    pub working_type: Option<WorkingType>,
    pub price_protect: bool,
    pub priority: Priority,
}

impl NewOrder {
    pub fn notional(&self) -> f64 {
        self.qty * self.price.or(self.stop_price).unwrap_or(0.0)
    }
}

/// Parsed order acknowledgement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_id: String,
    pub symbol: String,
    pub status: Option<crate::models::OrderStatus>,
    pub executed_qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Absolute position quantity (always >= 0; direction is the side).
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
}

/// The seam between the engine and the venue. Implemented by the signed REST
/// client in production, by `SimulatedVenue` in simulate-only mode and by
/// test fakes.
#[async_trait]
pub trait VenueApi: Send + Sync {
    async fn exchange_info(&self) -> VenueResult<Vec<(String, SymbolSpec)>>;
    async fn depth(&self, symbol: &str, limit: u32) -> VenueResult<DepthSnapshot>;
    async fn place_order(&self, order: &NewOrder) -> VenueResult<OrderAck>;
    /// Place up to five orders in one call; per-item results.
    async fn place_batch(&self, orders: &[NewOrder]) -> VenueResult<Vec<VenueResult<OrderAck>>>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> VenueResult<()>;
    async fn cancel_all_open(&self, symbol: &str) -> VenueResult<()>;
    async fn open_orders(&self, symbol: Option<&str>) -> VenueResult<Vec<OrderAck>>;
    async fn account(&self) -> VenueResult<AccountSnapshot>;
    async fn position_risk(&self) -> VenueResult<Vec<VenuePosition>>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()>;
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> VenueResult<()>;
    async fn set_position_mode(&self, hedge: bool) -> VenueResult<()>;
    async fn set_multi_assets_mode(&self, enabled: bool) -> VenueResult<()>;
    async fn listen_key_create(&self) -> VenueResult<String>;
    async fn listen_key_keepalive(&self, key: &str) -> VenueResult<()>;
    async fn listen_key_delete(&self, key: &str) -> VenueResult<()>;
}
