//! User-data stream.
//!
//! Listen-key lifecycle (create, 30-minute keepalive, recreate on expiry)
//! plus parsing of `ORDER_TRADE_UPDATE` into normalized fill events for the
//! router and `ACCOUNT_UPDATE` into reconciler nudges. During stream gaps
//! the periodic reconciliation sweep closes any missed transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::FillEvent;
use crate::streams::backoff::Backoff;
use crate::venue::wire::{parse_user_data_frame, UserDataMsg};
use crate::venue::VenueApi;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct UserDataStream {
    cfg: Arc<Config>,
    venue: Arc<dyn VenueApi>,
    fill_tx: mpsc::UnboundedSender<FillEvent>,
    reconcile_nudge: Arc<Notify>,
    connected: Arc<AtomicBool>,
}

impl UserDataStream {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn VenueApi>,
        fill_tx: mpsc::UnboundedSender<FillEvent>,
        reconcile_nudge: Arc<Notify>,
    ) -> Self {
        Self {
            cfg,
            venue,
            fill_tx,
            reconcile_nudge,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let listen_key = match self.venue.listen_key_create().await {
                Ok(key) => key,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "listen key create failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            match self.connect_and_stream(&listen_key, &mut shutdown).await {
                Ok(StreamEnd::Shutdown) => {
                    let _ = self.venue.listen_key_delete(&listen_key).await;
                    break;
                }
                Ok(StreamEnd::KeyExpired) => {
                    info!("listen key expired, resubscribing");
                    backoff.reset();
                    // A new key is created on the next loop pass; the
                    // reconciler closes any gap meanwhile.
                    self.reconcile_nudge.notify_one();
                }
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        backoff.reset();
                    }
                    let delay = backoff.next_backoff();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "user-data stream reconnecting");
                    self.reconcile_nudge.notify_one();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("user-data stream stopped");
    }

    async fn connect_and_stream(
        &self,
        listen_key: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<StreamEnd> {
        let url = format!("{}/ws/{}", self.cfg.ws_base_url, listen_key);
        let (ws, _) = connect_async(&url).await?;
        self.connected.store(true, Ordering::Release);
        info!("user-data stream connected");
        let (mut write, mut read) = ws.split();

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(StreamEnd::Shutdown),
                _ = keepalive.tick() => {
                    if let Err(e) = self.venue.listen_key_keepalive(listen_key).await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("user-data stream closed by venue");
                    };
                    match msg? {
                        Message::Text(text) => match parse_user_data_frame(&text) {
                            UserDataMsg::OrderUpdate(fill) => {
                                debug!(
                                    order_id = fill.order_id,
                                    symbol = %fill.symbol,
                                    status = fill.status.as_str(),
                                    "order update received"
                                );
                                if self.fill_tx.send(fill).is_err() {
                                    return Ok(StreamEnd::Shutdown);
                                }
                            }
                            UserDataMsg::AccountUpdate => {
                                // Balance / position drift: let the
                                // reconciler compare against venue truth.
                                self.reconcile_nudge.notify_one();
                            }
                            UserDataMsg::ListenKeyExpired => {
                                return Ok(StreamEnd::KeyExpired);
                            }
                            UserDataMsg::Other => {}
                        },
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => anyhow::bail!("user-data stream close frame"),
                        _ => {}
                    }
                }
            }
        }
    }
}

enum StreamEnd {
    Shutdown,
    KeyExpired,
}
