//! Serde wire types for the venue REST API and WebSocket streams.
//!
//! The venue speaks the Binance futures dialect: numbers arrive as strings,
//! field names are single letters on streams, and error bodies are
//! `{"code": -2022, "msg": "..."}`.

use serde::{Deserialize, Deserializer};

use crate::error::VenueError;
use crate::models::{FillEvent, LiquidationEvent, OrderStatus, PositionSide, Side};

/// Accept `"123.45"` or `123.45`.
pub(crate) fn str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
    }
}

fn str_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "str_f64")] f64);
    Option::<Wrap>::deserialize(deserializer).map(|o| o.map(|w| w.0))
}

// ============================================================================
// REST
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl ApiErrorBody {
    pub fn into_error(self) -> VenueError {
        VenueError::from_code(self.code, &self.msg)
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSymbol {
    pub symbol: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Only the filter families the engine needs; unknown filters deserialize to
/// `Other` and are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "tickSize", deserialize_with = "str_f64")]
        tick_size: f64,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "stepSize", deserialize_with = "str_f64")]
        step_size: f64,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "notional", deserialize_with = "str_f64")]
        notional: f64,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct DepthResponse {
    /// `[price, qty]` string pairs, best first.
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// Top of book, already parsed.
#[derive(Debug, Clone, Copy)]
pub struct DepthSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
}

impl DepthResponse {
    pub fn top(&self) -> Option<DepthSnapshot> {
        let best_bid = self.bids.first()?.0.parse::<f64>().ok()?;
        let best_ask = self.asks.first()?.0.parse::<f64>().ok()?;
        if best_bid <= 0.0 || best_ask <= 0.0 {
            return None;
        }
        Some(DepthSnapshot { best_bid, best_ask })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAckWire {
    pub order_id: i64,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "str_f64_opt")]
    pub executed_qty: Option<f64>,
    #[serde(default, deserialize_with = "str_f64_opt")]
    pub avg_price: Option<f64>,
    #[serde(default, deserialize_with = "str_f64_opt")]
    pub price: Option<f64>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

/// One element of a batch-order response: either an ack or an error body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BatchOrderItem {
    Ack(OrderAckWire),
    Err(ApiErrorBody),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRiskWire {
    pub symbol: String,
    #[serde(rename = "positionAmt", deserialize_with = "str_f64")]
    pub position_amt: f64,
    #[serde(rename = "entryPrice", deserialize_with = "str_f64")]
    pub entry_price: f64,
    #[serde(rename = "markPrice", default, deserialize_with = "str_f64_opt")]
    pub mark_price: Option<f64>,
    #[serde(rename = "positionSide", default)]
    pub position_side: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountWire {
    #[serde(rename = "totalWalletBalance", deserialize_with = "str_f64")]
    pub total_wallet_balance: f64,
    #[serde(rename = "availableBalance", deserialize_with = "str_f64")]
    pub available_balance: f64,
    #[serde(
        rename = "totalUnrealizedProfit",
        default,
        deserialize_with = "str_f64_opt"
    )]
    pub total_unrealized_profit: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyWire {
    pub listen_key: String,
}

// ============================================================================
// STREAMS
// ============================================================================

/// `!forceOrder@arr` frame payload. The stream emits either a single event
/// object or an array of them during cascades.
#[derive(Debug, Deserialize)]
pub struct ForceOrderMsg {
    #[serde(rename = "o")]
    pub order: ForceOrderDetail,
}

#[derive(Debug, Deserialize)]
pub struct ForceOrderDetail {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "q", deserialize_with = "str_f64")]
    pub qty: f64,
    #[serde(rename = "p", deserialize_with = "str_f64")]
    pub price: f64,
    #[serde(rename = "ap", default, deserialize_with = "str_f64_opt")]
    pub avg_price: Option<f64>,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

/// Parse one forced-order frame (object or array form) into normalized
/// events. Unknown sides and control messages yield an empty vec.
pub fn parse_force_order_frame(raw: &str) -> Vec<LiquidationEvent> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let items: Vec<ForceOrderMsg> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).unwrap_or_default(),
        serde_json::Value::Object(_) => serde_json::from_value::<ForceOrderMsg>(value)
            .map(|m| vec![m])
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|m| {
            let side = Side::parse(&m.order.side)?;
            // The fill price is more representative than the original order
            // price when the venue reports it.
            let price = m.order.avg_price.filter(|p| *p > 0.0).unwrap_or(m.order.price);
            if m.order.qty <= 0.0 || price <= 0.0 {
                return None;
            }
            Some(LiquidationEvent::new(
                m.order.symbol,
                side,
                m.order.qty,
                price,
                m.order.trade_time,
            ))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct MarkPriceMsg {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p", deserialize_with = "str_f64")]
    pub mark_price: f64,
    #[serde(rename = "E", default)]
    pub event_time: i64,
}

/// Parse a `!markPrice@arr` frame (always array form at 1s cadence).
pub fn parse_mark_price_frame(raw: &str) -> Vec<MarkPriceMsg> {
    serde_json::from_str::<Vec<MarkPriceMsg>>(raw).unwrap_or_default()
}

/// User-data stream messages the engine cares about.
#[derive(Debug)]
pub enum UserDataMsg {
    OrderUpdate(FillEvent),
    AccountUpdate,
    ListenKeyExpired,
    Other,
}

#[derive(Debug, Deserialize)]
struct OrderTradeUpdateWire {
    #[serde(rename = "o")]
    o: OrderUpdateDetail,
    #[serde(rename = "E", default)]
    event_time: i64,
}

#[derive(Debug, Deserialize)]
struct OrderUpdateDetail {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "l", deserialize_with = "str_f64")]
    last_qty: f64,
    #[serde(rename = "z", deserialize_with = "str_f64")]
    cum_qty: f64,
    #[serde(rename = "ap", default, deserialize_with = "str_f64_opt")]
    avg_price: Option<f64>,
    #[serde(rename = "L", default, deserialize_with = "str_f64_opt")]
    last_price: Option<f64>,
    #[serde(rename = "n", default, deserialize_with = "str_f64_opt")]
    commission: Option<f64>,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "ps", default)]
    position_side: Option<String>,
}

pub fn parse_user_data_frame(raw: &str) -> UserDataMsg {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return UserDataMsg::Other,
    };
    let event_type = value.get("e").and_then(|e| e.as_str()).unwrap_or("");

    match event_type {
        "ORDER_TRADE_UPDATE" => {
            let wire: OrderTradeUpdateWire = match serde_json::from_value(value) {
                Ok(w) => w,
                Err(_) => return UserDataMsg::Other,
            };
            let d = wire.o;
            let (Some(side), Some(status)) = (Side::parse(&d.side), OrderStatus::parse(&d.status))
            else {
                return UserDataMsg::Other;
            };
            let position_side = d
                .position_side
                .as_deref()
                .and_then(PositionSide::parse)
                // One-way mode reports BOTH; infer from the order side the way
                // the venue nets it.
                .unwrap_or(match side {
                    Side::Buy => PositionSide::Long,
                    Side::Sell => PositionSide::Short,
                });
            UserDataMsg::OrderUpdate(FillEvent {
                order_id: d.order_id,
                client_id: d.client_id,
                symbol: d.symbol,
                side,
                position_side,
                status,
                last_qty: d.last_qty,
                cum_qty: d.cum_qty,
                avg_price: d.avg_price.unwrap_or(0.0),
                last_price: d.last_price.unwrap_or(0.0),
                commission: d.commission.unwrap_or(0.0),
                reduce_only: d.reduce_only,
                event_time_ms: wire.event_time,
            })
        }
        "ACCOUNT_UPDATE" => UserDataMsg::AccountUpdate,
        "listenKeyExpired" => UserDataMsg::ListenKeyExpired,
        _ => UserDataMsg::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_force_order_object_and_array() {
        let obj = r#"{"e":"forceOrder","E":1700000000100,"o":{"s":"BTCUSDT","S":"SELL","q":"2","p":"60000","ap":"60000","T":1700000000000}}"#;
        let events = parse_force_order_frame(obj);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert_eq!(events[0].liquidated_side, Side::Sell);
        assert!((events[0].usdt_value - 120_000.0).abs() < 1e-9);

        let arr = format!("[{obj},{obj}]");
        assert_eq!(parse_force_order_frame(&arr).len(), 2);
    }

    #[test]
    fn force_order_event_id_is_deterministic() {
        let obj = r#"{"o":{"s":"ETHUSDT","S":"BUY","q":"1.5","p":"3000","T":42}}"#;
        let a = parse_force_order_frame(obj);
        let b = parse_force_order_frame(obj);
        assert_eq!(a[0].event_id, b[0].event_id);
    }

    #[test]
    fn parses_mark_price_array() {
        let raw = r#"[{"e":"markPriceUpdate","E":1700000001000,"s":"BTCUSDT","p":"61200.00"},{"e":"markPriceUpdate","E":1700000001000,"s":"ETHUSDT","p":"3000.10"}]"#;
        let msgs = parse_mark_price_frame(raw);
        assert_eq!(msgs.len(), 2);
        assert!((msgs[0].mark_price - 61_200.0).abs() < 1e-9);
    }

    #[test]
    fn parses_order_trade_update() {
        let raw = r#"{"e":"ORDER_TRADE_UPDATE","E":1700000002000,"o":{"s":"BTCUSDT","c":"lh-abc","S":"BUY","o":"LIMIT","x":"TRADE","X":"FILLED","i":1234,"l":"0.016","z":"0.016","ap":"59940.0","L":"59940.0","n":"0.01","R":false,"ps":"LONG"}}"#;
        match parse_user_data_frame(raw) {
            UserDataMsg::OrderUpdate(f) => {
                assert_eq!(f.order_id, 1234);
                assert_eq!(f.status, OrderStatus::Filled);
                assert_eq!(f.position_side, PositionSide::Long);
                assert!((f.cum_qty - 0.016).abs() < 1e-12);
                assert!((f.avg_price - 59_940.0).abs() < 1e-9);
            }
            other => panic!("expected OrderUpdate, got {other:?}"),
        }
    }

    #[test]
    fn listen_key_expiry_recognized() {
        assert!(matches!(
            parse_user_data_frame(r#"{"e":"listenKeyExpired","E":1}"#),
            UserDataMsg::ListenKeyExpired
        ));
    }

    #[test]
    fn depth_top_parses_best_levels() {
        let d: DepthResponse = serde_json::from_str(
            r#"{"bids":[["60000.0","1.2"],["59999.9","3"]],"asks":[["60000.1","0.5"]]}"#,
        )
        .unwrap();
        let top = d.top().unwrap();
        assert!((top.best_bid - 60_000.0).abs() < 1e-9);
        assert!((top.best_ask - 60_000.1).abs() < 1e-9);
    }

    #[test]
    fn error_body_maps_to_typed_error() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"code":-2022,"msg":"ReduceOnly Order is rejected."}"#).unwrap();
        assert!(matches!(
            body.into_error(),
            VenueError::ReduceOnlyRejected
        ));
    }
}
