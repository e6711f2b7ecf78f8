//! Signed REST client for the venue.
//!
//! Every request is admitted by the rate governor first, signed with
//! HMAC-SHA256 over the canonical query string, and parsed into the typed
//! error set. Only transient-network and rate-limited failures are retried,
//! with exponential backoff under a per-call deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::error::{VenueError, VenueResult};
use crate::models::{MarginType, OrderStatus};
use crate::venue::governor::{Endpoint, Priority, RateGovernor};
use crate::venue::specs::{specs_from_exchange_info, SpecCache, SymbolSpec};
use crate::venue::wire::{
    AccountWire, ApiErrorBody, BatchOrderItem, DepthResponse, DepthSnapshot,
    ExchangeInfoResponse, ListenKeyWire, OrderAckWire, PositionRiskWire,
};
use crate::venue::{AccountSnapshot, NewOrder, OrderAck, OrderType, VenueApi, VenuePosition};

type HmacSha256 = Hmac<Sha256>;

const MAX_RETRIES: u32 = 3;
const CALL_DEADLINE: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestClient {
    http: Client,
    base_url: String,
    creds: Credentials,
    governor: Arc<RateGovernor>,
    specs: Arc<SpecCache>,
    recv_window_ms: u64,
}

impl RestClient {
    pub fn new(
        base_url: String,
        creds: Credentials,
        governor: Arc<RateGovernor>,
        specs: Arc<SpecCache>,
        recv_window_ms: u64,
    ) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url,
            creds,
            governor,
            specs,
            recv_window_ms,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_params(params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Issue a signed request with admission, header reconciliation, typed
    /// error mapping and bounded retry of retryable failures.
    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        endpoint: Endpoint,
        priority: Priority,
    ) -> VenueResult<String> {
        let deadline = Instant::now() + CALL_DEADLINE;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Admission. Queue within the deadline; reject beyond it.
            loop {
                match self.governor.try_admit(endpoint, priority) {
                    Ok(()) => break,
                    Err(wait) => {
                        if Instant::now() + wait > deadline {
                            return Err(VenueError::RateLimited {
                                retry_after_ms: wait.as_millis() as u64,
                            });
                        }
                        tokio::time::sleep(wait.max(Duration::from_millis(25))).await;
                    }
                }
            }

            // Timestamp per attempt so retries stay inside recvWindow.
            let mut signed_params = params.clone();
            signed_params.push((
                "timestamp".to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            ));
            signed_params.push(("recvWindow".to_string(), self.recv_window_ms.to_string()));
            let query = Self::encode_params(&signed_params);
            let signature = self.sign(&query);
            let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

            let result = self
                .http
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &self.creds.api_key)
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    let err = VenueError::TransientNetwork(e.to_string());
                    if attempt <= MAX_RETRIES && Instant::now() < deadline {
                        let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                        debug!(path, attempt, error = %err, "transient error, retrying");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            self.reconcile_headers(response.headers());
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            match self.classify(status, &body) {
                Ok(()) => {
                    self.governor.record_success();
                    return Ok(body);
                }
                Err(err) => {
                    if err.is_retryable() && attempt <= MAX_RETRIES && Instant::now() < deadline {
                        let backoff = match &err {
                            VenueError::RateLimited { retry_after_ms } => {
                                Duration::from_millis(*retry_after_ms)
                            }
                            _ => Duration::from_millis(200 * 2u64.pow(attempt - 1)),
                        };
                        warn!(path, attempt, error = %err, "retryable venue error");
                        tokio::time::sleep(backoff.min(deadline - Instant::now())).await;
                        continue;
                    }
                    // Lot/tick complaints mean the cached spec is stale.
                    if let VenueError::InvalidParam { code, .. } = &err {
                        if *code == -1111 || *code == -1013 || *code == -4164 {
                            self.specs.invalidate();
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Public (unsigned) GET; still admitted and header-reconciled.
    async fn public(
        &self,
        path: &str,
        params: Vec<(String, String)>,
        endpoint: Endpoint,
        priority: Priority,
    ) -> VenueResult<String> {
        let deadline = Instant::now() + CALL_DEADLINE;
        loop {
            match self.governor.try_admit(endpoint, priority) {
                Ok(()) => break,
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(VenueError::RateLimited {
                            retry_after_ms: wait.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(wait.max(Duration::from_millis(25))).await;
                }
            }
        }

        let query = Self::encode_params(&params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::TransientNetwork(e.to_string()))?;
        self.reconcile_headers(response.headers());
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        self.classify(status, &body)?;
        self.governor.record_success();
        Ok(body)
    }

    fn reconcile_headers(&self, headers: &HeaderMap) {
        let used_weight = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let order_count = headers
            .get("X-MBX-ORDER-COUNT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        if used_weight.is_some() || order_count.is_some() {
            self.governor.record_headers(used_weight, order_count);
        }
    }

    fn classify(&self, status: StatusCode, body: &str) -> VenueResult<()> {
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            429 => {
                let backoff = self.governor.record_429();
                Err(VenueError::RateLimited {
                    retry_after_ms: backoff.as_millis() as u64,
                })
            }
            418 => {
                self.governor.record_418(None);
                Err(VenueError::Banned {
                    until_ms: chrono::Utc::now().timestamp_millis() + 120_000,
                })
            }
            401 | 403 => Err(VenueError::Auth(format!("HTTP {status}"))),
            _ => match serde_json::from_str::<ApiErrorBody>(body) {
                Ok(api_err) => Err(api_err.into_error()),
                Err(_) => Err(VenueError::UnknownVenue {
                    code: status.as_u16() as i64,
                    msg: body.chars().take(200).collect(),
                }),
            },
        }
    }

    fn order_params(&self, order: &NewOrder) -> Vec<(String, String)> {
        let spec = self.specs.get(&order.symbol);
        let fmt_price = |p: f64| match spec {
            Some(s) => s.fmt_price(p),
            None => format!("{p}"),
        };
        let fmt_qty = |q: f64| match spec {
            Some(s) => s.fmt_qty(q),
            None => format!("{q}"),
        };

        let mut params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), order.side.as_str().to_string()),
            ("type".to_string(), order.order_type.as_str().to_string()),
            ("quantity".to_string(), fmt_qty(order.qty)),
            (
                "newClientOrderId".to_string(),
                order.client_id.clone(),
            ),
        ];
        if let Some(ps) = order.position_side {
            // Hedge mode: positionSide is set and reduceOnly must be omitted.
            params.push(("positionSide".to_string(), ps.as_str().to_string()));
        } else if order.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if let Some(price) = order.price {
            params.push(("price".to_string(), fmt_price(price)));
        }
        if let Some(stop) = order.stop_price {
            params.push(("stopPrice".to_string(), fmt_price(stop)));
        }
        if let Some(tif) = order.time_in_force {
            params.push(("timeInForce".to_string(), tif.as_str().to_string()));
        }
        if let Some(wt) = order.working_type {
            if order.order_type == OrderType::StopMarket {
                params.push(("workingType".to_string(), wt.as_str().to_string()));
            }
        }
        if order.price_protect && order.order_type == OrderType::StopMarket {
            params.push(("priceProtect".to_string(), "TRUE".to_string()));
        }
        params
    }
}

fn ack_from_wire(w: OrderAckWire) -> OrderAck {
    OrderAck {
        order_id: w.order_id,
        client_id: w.client_order_id,
        symbol: w.symbol,
        status: w.status.as_deref().and_then(OrderStatus::parse),
        executed_qty: w.executed_qty.unwrap_or(0.0),
        avg_price: w.avg_price.unwrap_or(0.0),
    }
}

fn urlencode(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for b in v.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl VenueApi for RestClient {
    async fn exchange_info(&self) -> VenueResult<Vec<(String, SymbolSpec)>> {
        let body = self
            .public(
                "/fapi/v1/exchangeInfo",
                vec![],
                Endpoint::ExchangeInfo,
                Priority::Normal,
            )
            .await?;
        let info: ExchangeInfoResponse = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("exchangeInfo decode: {e}")))?;
        let specs = specs_from_exchange_info(info);
        self.specs.replace_all(specs.clone());
        Ok(specs)
    }

    async fn depth(&self, symbol: &str, limit: u32) -> VenueResult<DepthSnapshot> {
        let body = self
            .public(
                "/fapi/v1/depth",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("limit".to_string(), limit.to_string()),
                ],
                Endpoint::Depth { limit },
                Priority::Critical,
            )
            .await?;
        let depth: DepthResponse = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("depth decode: {e}")))?;
        depth
            .top()
            .ok_or_else(|| VenueError::TransientNetwork("empty depth book".to_string()))
    }

    async fn place_order(&self, order: &NewOrder) -> VenueResult<OrderAck> {
        let params = self.order_params(order);
        let body = self
            .signed(
                Method::POST,
                "/fapi/v1/order",
                params,
                Endpoint::PlaceOrder,
                order.priority,
            )
            .await?;
        let wire: OrderAckWire = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("order ack decode: {e}")))?;
        Ok(ack_from_wire(wire))
    }

    async fn place_batch(&self, orders: &[NewOrder]) -> VenueResult<Vec<VenueResult<OrderAck>>> {
        let items: Vec<serde_json::Value> = orders
            .iter()
            .map(|o| {
                let map: serde_json::Map<String, serde_json::Value> = self
                    .order_params(o)
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                serde_json::Value::Object(map)
            })
            .collect();
        let batch_json = serde_json::to_string(&items)
            .map_err(|e| VenueError::TransientNetwork(e.to_string()))?;
        let priority = orders
            .iter()
            .map(|o| o.priority)
            .max()
            .unwrap_or(Priority::Normal);
        let body = self
            .signed(
                Method::POST,
                "/fapi/v1/batchOrders",
                vec![("batchOrders".to_string(), batch_json)],
                Endpoint::BatchOrders {
                    count: orders.len() as u32,
                },
                priority,
            )
            .await?;
        let items: Vec<BatchOrderItem> = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("batch ack decode: {e}")))?;
        Ok(items
            .into_iter()
            .map(|item| match item {
                BatchOrderItem::Ack(w) => Ok(ack_from_wire(w)),
                BatchOrderItem::Err(e) => Err(e.into_error()),
            })
            .collect())
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> VenueResult<()> {
        self.signed(
            Method::DELETE,
            "/fapi/v1/order",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("orderId".to_string(), order_id.to_string()),
            ],
            Endpoint::CancelOrder,
            Priority::Critical,
        )
        .await
        .map(|_| ())
    }

    async fn cancel_all_open(&self, symbol: &str) -> VenueResult<()> {
        self.signed(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol".to_string(), symbol.to_string())],
            Endpoint::CancelAllOpen,
            Priority::Normal,
        )
        .await
        .map(|_| ())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> VenueResult<Vec<OrderAck>> {
        let mut params = Vec::new();
        if let Some(s) = symbol {
            params.push(("symbol".to_string(), s.to_string()));
        }
        let body = self
            .signed(
                Method::GET,
                "/fapi/v1/openOrders",
                params,
                Endpoint::OpenOrders {
                    all_symbols: symbol.is_none(),
                },
                Priority::Low,
            )
            .await?;
        let wires: Vec<OrderAckWire> = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("openOrders decode: {e}")))?;
        Ok(wires.into_iter().map(ack_from_wire).collect())
    }

    async fn account(&self) -> VenueResult<AccountSnapshot> {
        let body = self
            .signed(
                Method::GET,
                "/fapi/v2/account",
                vec![],
                Endpoint::Account,
                Priority::Low,
            )
            .await?;
        let wire: AccountWire = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("account decode: {e}")))?;
        Ok(AccountSnapshot {
            total_wallet_balance: wire.total_wallet_balance,
            available_balance: wire.available_balance,
            total_unrealized_profit: wire.total_unrealized_profit.unwrap_or(0.0),
        })
    }

    async fn position_risk(&self) -> VenueResult<Vec<VenuePosition>> {
        let body = self
            .signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![],
                Endpoint::PositionRisk,
                Priority::Low,
            )
            .await?;
        let wires: Vec<PositionRiskWire> = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("positionRisk decode: {e}")))?;
        Ok(wires
            .into_iter()
            .filter(|w| w.position_amt != 0.0)
            .filter_map(|w| {
                let position_side = match w.position_side.as_deref() {
                    Some("LONG") => crate::models::PositionSide::Long,
                    Some("SHORT") => crate::models::PositionSide::Short,
                    // One-way mode: sign of the amount carries direction.
                    _ if w.position_amt > 0.0 => crate::models::PositionSide::Long,
                    _ => crate::models::PositionSide::Short,
                };
                Some(VenuePosition {
                    symbol: w.symbol,
                    position_side,
                    qty: w.position_amt.abs(),
                    entry_price: w.entry_price,
                    mark_price: w.mark_price,
                })
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        self.signed(
            Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("leverage".to_string(), leverage.to_string()),
            ],
            Endpoint::Leverage,
            Priority::Normal,
        )
        .await
        .map(|_| ())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> VenueResult<()> {
        let result = self
            .signed(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("marginType".to_string(), margin_type.as_str().to_string()),
                ],
                Endpoint::MarginType,
                Priority::Normal,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_no_change() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_position_mode(&self, hedge: bool) -> VenueResult<()> {
        let result = self
            .signed(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                vec![(
                    "dualSidePosition".to_string(),
                    if hedge { "true" } else { "false" }.to_string(),
                )],
                Endpoint::PositionMode,
                Priority::Normal,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_no_change() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_multi_assets_mode(&self, enabled: bool) -> VenueResult<()> {
        let result = self
            .signed(
                Method::POST,
                "/fapi/v1/multiAssetsMargin",
                vec![(
                    "multiAssetsMargin".to_string(),
                    if enabled { "true" } else { "false" }.to_string(),
                )],
                Endpoint::PositionMode,
                Priority::Normal,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_no_change() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn listen_key_create(&self) -> VenueResult<String> {
        let body = self
            .signed(
                Method::POST,
                "/fapi/v1/listenKey",
                vec![],
                Endpoint::ListenKey,
                Priority::Normal,
            )
            .await?;
        let wire: ListenKeyWire = serde_json::from_str(&body)
            .map_err(|e| VenueError::TransientNetwork(format!("listenKey decode: {e}")))?;
        Ok(wire.listen_key)
    }

    async fn listen_key_keepalive(&self, _key: &str) -> VenueResult<()> {
        self.signed(
            Method::PUT,
            "/fapi/v1/listenKey",
            vec![],
            Endpoint::ListenKey,
            Priority::Normal,
        )
        .await
        .map(|_| ())
    }

    async fn listen_key_delete(&self, _key: &str) -> VenueResult<()> {
        self.signed(
            Method::DELETE,
            "/fapi/v1/listenKey",
            vec![],
            Endpoint::ListenKey,
            Priority::Low,
        )
        .await
        .map(|_| ())
    }
}
