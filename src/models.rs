//! Core domain types shared across the engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Order side as the venue understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Position direction. Under hedge mode LONG and SHORT are tracked
/// independently on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// Side of an order that opens / increases this position.
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Side of an order that reduces this position (TP, SL, close).
    pub fn reduce_side(&self) -> Side {
        self.entry_side().opposite()
    }

    /// Signed return in percent of `mark` relative to `entry`, positive when
    /// the mark is favorable to this position side.
    pub fn signed_return_pct(&self, entry: f64, mark: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        match self {
            PositionSide::Long => (mark - entry) / entry * 100.0,
            PositionSide::Short => (entry - mark) / entry * 100.0,
        }
    }
}

/// What an order is for, from the engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Entry,
    Tp,
    Sl,
    Close,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Entry => "ENTRY",
            OrderKind::Tp => "TP",
            OrderKind::Sl => "SL",
            OrderKind::Close => "CLOSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(OrderKind::Entry),
            "TP" => Some(OrderKind::Tp),
            "SL" => Some(OrderKind::Sl),
            "CLOSE" => Some(OrderKind::Close),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal states: no further venue updates will arrive for the order.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    Isolated,
    Cross,
}

impl MarginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Trigger-price reference for stop orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkingType {
    ContractPrice,
    MarkPrice,
}

impl WorkingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingType::ContractPrice => "CONTRACT_PRICE",
            WorkingType::MarkPrice => "MARK_PRICE",
        }
    }
}

/// Per-symbol contrarian mapping: counter-trade the liquidation or mirror it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Opposite,
    Same,
}

impl TradeSide {
    /// Map the liquidated side to the position side we open.
    ///
    /// A `SELL` forced order means longs were liquidated (sold out); a `BUY`
    /// forced order means shorts were bought back. The contrarian
    /// (`Opposite`) response to a long-liquidation cascade is to open SHORT.
    pub fn entry_position_side(&self, liquidated_side: Side) -> PositionSide {
        let longs_flushed = liquidated_side == Side::Sell;
        match (self, longs_flushed) {
            (TradeSide::Opposite, true) => PositionSide::Short,
            (TradeSide::Opposite, false) => PositionSide::Long,
            (TradeSide::Same, true) => PositionSide::Long,
            (TradeSide::Same, false) => PositionSide::Short,
        }
    }
}

/// A venue-emitted forced-liquidation notification, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub event_id: String,
    pub symbol: String,
    pub liquidated_side: Side,
    pub qty: f64,
    pub price: f64,
    pub usdt_value: f64,
    pub event_time_ms: i64,
    pub received_time_ms: i64,
}

impl LiquidationEvent {
    /// The forced-order stream carries no event id; derive a deterministic
    /// one so the store insert can be idempotent across reconnect replays.
    pub fn new(
        symbol: String,
        liquidated_side: Side,
        qty: f64,
        price: f64,
        event_time_ms: i64,
    ) -> Self {
        let event_id = format!("{symbol}-{event_time_ms}-{qty}-{price}");
        Self {
            event_id,
            symbol,
            liquidated_side,
            qty,
            price,
            usdt_value: qty * price,
            event_time_ms,
            received_time_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// An order as the engine records it. `order_id` is venue-assigned;
/// `client_id` is our idempotency id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: i64,
    pub client_id: String,
    pub symbol: String,
    pub position_side: PositionSide,
    pub kind: OrderKind,
    pub side: Side,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub tranche_id: Option<u64>,
    pub parent_order_id: Option<i64>,
    pub placed_at: i64,
    pub final_at: Option<i64>,
    pub executed_qty: f64,
    pub avg_fill_price: f64,
    pub time_in_force: TimeInForce,
}

/// An independently protected slice of a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tranche {
    pub tranche_id: u64,
    pub symbol: String,
    pub position_side: PositionSide,
    pub avg_entry_price: f64,
    pub quantity: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
    /// Set when protection rebuild failed repeatedly; cleared by the
    /// reconciler once a rebuild succeeds.
    pub unprotected: bool,
}

impl Tranche {
    pub fn notional(&self) -> f64 {
        self.quantity * self.avg_entry_price
    }

    /// Absorb a fill: weighted-average entry, summed quantity.
    pub fn absorb(&mut self, qty: f64, price: f64, now_ms: i64) {
        let new_qty = self.quantity + qty;
        if new_qty > 0.0 {
            self.avg_entry_price = (self.avg_entry_price * self.quantity + price * qty) / new_qty;
        }
        self.quantity = new_qty;
        self.updated_at = now_ms;
    }
}

/// Authoritative mapping from an entry order to its protective companions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRelationship {
    pub main_order_id: i64,
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
    pub tranche_id: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: i64,
    pub seq: i64,
    pub qty: f64,
    pub price: f64,
    pub time: i64,
    pub commission: f64,
}

/// A normalized order execution update, produced by the user-data stream in
/// live mode and by the simulated venue in simulate-only mode. One event per
/// venue `ORDER_TRADE_UPDATE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: i64,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub status: OrderStatus,
    /// Quantity filled by this execution.
    pub last_qty: f64,
    /// Cumulative filled quantity for the order.
    pub cum_qty: f64,
    pub avg_price: f64,
    pub last_price: f64,
    pub commission: f64,
    pub reduce_only: bool,
    pub event_time_ms: i64,
}

/// Key for everything serialized per `(symbol, position_side)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PositionKey {
    pub symbol: String,
    pub position_side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, position_side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            position_side,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.symbol, self.position_side.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contrarian_mapping() {
        // Longs liquidated (SELL forced orders) => open SHORT.
        assert_eq!(
            TradeSide::Opposite.entry_position_side(Side::Sell),
            PositionSide::Short
        );
        assert_eq!(
            TradeSide::Opposite.entry_position_side(Side::Buy),
            PositionSide::Long
        );
        assert_eq!(
            TradeSide::Same.entry_position_side(Side::Sell),
            PositionSide::Long
        );
        assert_eq!(
            TradeSide::Same.entry_position_side(Side::Buy),
            PositionSide::Short
        );
    }

    #[test]
    fn signed_return_is_positive_when_favorable() {
        assert!(PositionSide::Long.signed_return_pct(100.0, 110.0) > 0.0);
        assert!(PositionSide::Long.signed_return_pct(100.0, 90.0) < 0.0);
        assert!(PositionSide::Short.signed_return_pct(100.0, 90.0) > 0.0);
        assert!(PositionSide::Short.signed_return_pct(100.0, 110.0) < 0.0);
        assert!(
            (PositionSide::Long.signed_return_pct(60_000.0, 56_800.0) - (-5.333333333333333))
                .abs()
                < 1e-9
        );
    }

    #[test]
    fn absorb_weighted_average() {
        let mut t = Tranche {
            tranche_id: 0,
            symbol: "BTCUSDT".into(),
            position_side: PositionSide::Long,
            avg_entry_price: 60_000.0,
            quantity: 0.01,
            created_at: 0,
            updated_at: 0,
            tp_order_id: None,
            sl_order_id: None,
            unprotected: false,
        };
        t.absorb(0.01, 59_600.0, 1);
        assert!((t.avg_entry_price - 59_800.0).abs() < 1e-9);
        assert!((t.quantity - 0.02).abs() < 1e-12);
    }

    #[test]
    fn reduce_side_is_exit_direction() {
        assert_eq!(PositionSide::Long.reduce_side(), Side::Sell);
        assert_eq!(PositionSide::Short.reduce_side(), Side::Buy);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
