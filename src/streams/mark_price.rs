//! Mark-price stream.
//!
//! Subscribes to the venue-wide mark stream (1s cadence), keeps a last-value
//! table per symbol and invokes the fast path on every update. Reconnects
//! with jittered exponential backoff; if the stream stays down longer than
//! the configured threshold the engine logs degraded mode and relies on the
//! resting TP/SL orders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::fast_path::FastPath;
use crate::streams::backoff::Backoff;
use crate::venue::wire::parse_mark_price_frame;

/// Last observed mark per symbol.
#[derive(Default)]
pub struct MarkTable {
    inner: RwLock<HashMap<String, (f64, i64)>>,
}

impl MarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, price: f64, at_ms: i64) {
        self.inner.write().insert(symbol.to_string(), (price, at_ms));
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.inner.read().get(symbol).map(|(p, _)| *p)
    }

    pub fn age_ms(&self, symbol: &str, now_ms: i64) -> Option<i64> {
        self.inner.read().get(symbol).map(|(_, at)| now_ms - at)
    }
}

pub struct MarkPriceStream {
    cfg: Arc<Config>,
    marks: Arc<MarkTable>,
    fast_path: Arc<FastPath>,
    connected: Arc<AtomicBool>,
}

impl MarkPriceStream {
    pub fn new(cfg: Arc<Config>, marks: Arc<MarkTable>, fast_path: Arc<FastPath>) -> Self {
        Self {
            cfg,
            marks,
            fast_path,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = format!("{}/ws/!markPrice@arr@1s", self.cfg.ws_base_url);
        let mut backoff = Backoff::default();
        let mut down_since: Option<i64> = None;
        let mut degraded_logged = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let was_connected = self.connected.load(Ordering::Acquire);
            match self.connect_and_stream(&url, &mut shutdown).await {
                Ok(()) => break, // shutdown requested mid-stream
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) || was_connected {
                        // Healthy session ended: restart the backoff ladder.
                        backoff.reset();
                        down_since = None;
                        degraded_logged = false;
                    }
                    let now = chrono::Utc::now().timestamp_millis();
                    let since = *down_since.get_or_insert(now);
                    if !degraded_logged
                        && now - since > self.cfg.price_monitor_reconnect_ms as i64
                    {
                        warn!(
                            down_ms = now - since,
                            "mark-price stream degraded; relying on resting TP/SL only"
                        );
                        degraded_logged = true;
                    }
                    let delay = backoff.next_backoff();
                    debug!(error = %e, delay_ms = delay.as_millis() as u64, "mark stream reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("mark-price stream stopped");
    }

    async fn connect_and_stream(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (ws, _) = connect_async(url).await?;
        self.connected.store(true, Ordering::Release);
        info!(url, "mark-price stream connected");
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = read.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("mark stream closed by venue");
                    };
                    match msg? {
                        Message::Text(text) => {
                            let now = chrono::Utc::now().timestamp_millis();
                            for m in parse_mark_price_frame(&text) {
                                self.marks.update(&m.symbol, m.mark_price, now);
                                // Only configured symbols can hold tranches.
                                if self.cfg.symbols.contains_key(&m.symbol) {
                                    self.fast_path.on_mark(&m.symbol, m.mark_price).await;
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => anyhow::bail!("mark stream close frame"),
                        _ => {}
                    }
                }
            }
        }
    }
}
