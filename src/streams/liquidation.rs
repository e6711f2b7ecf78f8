//! Forced-liquidation intake.
//!
//! Owns the connection to the venue-wide forced-order stream, normalizes
//! frames into liquidation events, persists them idempotently and hands
//! them to the engine dispatcher. An optional buffering mode coalesces
//! micro-bursts so the evaluator sees one batch per burst instead of one
//! evaluation per event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::LiquidationEvent;
use crate::store::Store;
use crate::streams::backoff::Backoff;
use crate::venue::wire::parse_force_order_frame;

/// Bounded hand-off to the dispatcher; bursts beyond this are dropped with a
/// counted warning rather than ballooning memory.
const CHANNEL_CAPACITY: usize = 4_096;

pub struct LiquidationIntake {
    cfg: Arc<Config>,
    store: Store,
    tx: mpsc::Sender<Vec<LiquidationEvent>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl LiquidationIntake {
    pub fn new(
        cfg: Arc<Config>,
        store: Store,
    ) -> (Self, mpsc::Receiver<Vec<LiquidationEvent>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                cfg,
                store,
                tx,
                connected: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = format!("{}/ws/!forceOrder@arr", self.cfg.ws_base_url);
        let mut backoff = Backoff::default();

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.connect_and_stream(&url, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        backoff.reset();
                    }
                    let delay = backoff.next_backoff();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "liquidation stream reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("liquidation intake stopped");
    }

    async fn connect_and_stream(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (ws, _) = connect_async(url).await?;
        self.connected.store(true, Ordering::Release);
        info!(url, "liquidation stream connected");
        let (mut write, mut read) = ws.split();

        // Buffering mode: coalesce events for a short window and emit them
        // as one batch. With the window at 0, every frame flushes directly.
        let buffer_window = Duration::from_millis(self.cfg.intake_buffer_ms);
        let mut buffer: Vec<LiquidationEvent> = Vec::new();
        let flush_tick = tokio::time::sleep(buffer_window);
        tokio::pin!(flush_tick);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.flush(&mut buffer).await;
                    return Ok(());
                }
                _ = &mut flush_tick, if !buffer.is_empty() => {
                    self.flush(&mut buffer).await;
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        self.flush(&mut buffer).await;
                        anyhow::bail!("liquidation stream closed by venue");
                    };
                    match msg? {
                        Message::Text(text) => {
                            let events = parse_force_order_frame(&text);
                            if events.is_empty() {
                                continue;
                            }
                            for event in events {
                                // Persist first: the store is the replay
                                // source after a crash.
                                match self.store.insert_liquidation(&event).await {
                                    Ok(true) => buffer.push(event),
                                    Ok(false) => {
                                        debug!(event_id = %event.event_id, "duplicate liquidation ignored");
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "liquidation persist failed; forwarding anyway");
                                        buffer.push(event);
                                    }
                                }
                            }
                            if self.cfg.intake_buffer_ms == 0 {
                                self.flush(&mut buffer).await;
                            } else if buffer.len() == 1 {
                                flush_tick.as_mut().reset(tokio::time::Instant::now() + buffer_window);
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => {
                            self.flush(&mut buffer).await;
                            anyhow::bail!("liquidation stream close frame");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<LiquidationEvent>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                let dropped = self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed)
                    + batch.len() as u64;
                warn!(
                    batch = batch.len(),
                    total_dropped = dropped,
                    "intake channel full, dropping liquidation batch"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("intake channel closed");
            }
        }
    }
}
