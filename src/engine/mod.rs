//! Engine assembly.
//!
//! Builds every component against the configured venue (live REST client or
//! simulated), recovers persisted state, and runs the task topology: one
//! task per upstream stream, per-symbol evaluator workers, a single fill
//! router, and the periodic reconciler. Shutdown cascades through a watch
//! channel; a hard-stop timeout bounds the drain.

pub mod breaker;
pub mod evaluator;
pub mod fast_path;
pub mod fill_router;
pub mod protection;
pub mod reconciler;
pub mod tranches;
pub mod window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, Credentials};
use crate::engine::breaker::CircuitBreaker;
use crate::engine::evaluator::TradeEvaluator;
use crate::engine::fast_path::FastPath;
use crate::engine::fill_router::FillRouter;
use crate::engine::protection::ProtectionManager;
use crate::engine::reconciler::Reconciler;
use crate::engine::tranches::{TranchePartitioner, TrancheRules};
use crate::engine::window::VolumeWindow;
use crate::models::LiquidationEvent;
use crate::projections::Projections;
use crate::store::Store;
use crate::streams::liquidation::LiquidationIntake;
use crate::streams::mark_price::{MarkPriceStream, MarkTable};
use crate::streams::user_data::UserDataStream;
use crate::venue::client::RestClient;
use crate::venue::governor::RateGovernor;
use crate::venue::sim::SimulatedVenue;
use crate::venue::specs::SpecCache;
use crate::venue::VenueApi;

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);
const SPEC_REFRESH: Duration = Duration::from_secs(6 * 60 * 60);
const WORKER_QUEUE: usize = 64;

pub struct Engine {
    cfg: Arc<Config>,
    store: Store,
    governor: Arc<RateGovernor>,
    partitioner: Arc<TranchePartitioner>,
    evaluator: Arc<TradeEvaluator>,
    protection: Arc<ProtectionManager>,
    marks: Arc<MarkTable>,
    started_at_ms: i64,
    intake_connected: Arc<AtomicBool>,
    marks_connected: Arc<AtomicBool>,
    user_connected: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build, recover, and launch the full engine.
    pub async fn start(cfg: Config, creds: Option<Credentials>) -> Result<Engine> {
        let cfg = Arc::new(cfg);
        let store = Store::open(&cfg.database_path).context("open store")?;
        let governor = Arc::new(RateGovernor::new(cfg.rate_limit_buffer_pct));
        let specs = Arc::new(SpecCache::new(SPEC_REFRESH));

        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let venue: Arc<dyn VenueApi> = if cfg.simulate_only {
            info!("simulate-only mode: orders will be recorded, not submitted");
            Arc::new(SimulatedVenue::new(fill_tx.clone(), true))
        } else {
            let creds = creds.context("live mode requires credentials")?;
            Arc::new(RestClient::new(
                cfg.rest_base_url.clone(),
                creds,
                governor.clone(),
                specs.clone(),
                cfg.recv_window_ms,
            ))
        };

        // Symbol specs before anything prices or rounds.
        match venue.exchange_info().await {
            Ok(list) => specs.replace_all(list),
            Err(e) => warn!(error = %e, "exchange info unavailable at startup"),
        }

        // Venue account modes are idempotent; "no change" is success.
        if !cfg.simulate_only {
            if let Err(e) = venue.set_position_mode(cfg.hedge_mode).await {
                warn!(error = %e, "position mode setup failed");
            }
            if cfg.multi_assets_mode {
                if let Err(e) = venue.set_multi_assets_mode(true).await {
                    warn!(error = %e, "multi-assets mode setup failed");
                }
            }
        }

        let window = Arc::new(VolumeWindow::new(cfg.window_ms));
        let partitioner = Arc::new(TranchePartitioner::new(
            store.clone(),
            TrancheRules::from_config(&cfg),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN));
        let protection = Arc::new(ProtectionManager::new(
            cfg.clone(),
            venue.clone(),
            store.clone(),
            specs.clone(),
            breaker,
        ));
        let evaluator = Arc::new(TradeEvaluator::new(
            cfg.clone(),
            venue.clone(),
            store.clone(),
            window.clone(),
            specs.clone(),
            governor.clone(),
            partitioner.clone(),
        ));
        let marks = Arc::new(MarkTable::new());
        let fast_path = Arc::new(FastPath::new(
            cfg.clone(),
            partitioner.clone(),
            protection.clone(),
        ));
        let reconcile_nudge = Arc::new(Notify::new());
        let router = Arc::new(FillRouter::new(
            store.clone(),
            partitioner.clone(),
            protection.clone(),
            evaluator.clone(),
            reconcile_nudge.clone(),
        ));
        let reconciler = Reconciler::new(
            cfg.clone(),
            venue.clone(),
            store.clone(),
            partitioner.clone(),
            protection.clone(),
            marks.clone(),
            reconcile_nudge.clone(),
        );

        // ---- Recovery --------------------------------------------------
        let recovered = partitioner.recover().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let recent = store
            .liquidations_since(now - cfg.window_ms as i64)
            .await?;
        window.rebuild(&recent);
        info!(
            tranches = recovered,
            window_events = recent.len(),
            "state recovered from store"
        );
        if !cfg.simulate_only {
            // Align with venue truth before trading resumes.
            if let Err(e) = reconciler.sweep().await {
                warn!(error = %e, "startup reconciliation failed");
            }
        }

        // ---- Task topology ---------------------------------------------
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (intake, intake_rx) = LiquidationIntake::new(cfg.clone(), store.clone());
        let intake_connected = intake.connected_flag();
        let dropped_events = intake.dropped_counter();
        tasks.push(tokio::spawn(intake.run(shutdown_rx.clone())));

        tasks.push(tokio::spawn(Self::dispatch_loop(
            cfg.clone(),
            window.clone(),
            evaluator.clone(),
            intake_rx,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::fill_loop(
            router,
            fill_rx,
            shutdown_rx.clone(),
        )));

        let mark_stream = MarkPriceStream::new(cfg.clone(), marks.clone(), fast_path);
        let marks_connected = mark_stream.connected_flag();
        if cfg.use_position_monitor {
            tasks.push(tokio::spawn(mark_stream.run(shutdown_rx.clone())));
        }

        let user_connected = if cfg.simulate_only {
            // The simulated venue feeds fills directly; report healthy.
            Arc::new(AtomicBool::new(true))
        } else {
            let user_stream = UserDataStream::new(
                cfg.clone(),
                venue.clone(),
                fill_tx,
                reconcile_nudge.clone(),
            );
            let flag = user_stream.connected_flag();
            tasks.push(tokio::spawn(user_stream.run(shutdown_rx.clone())));
            flag
        };

        tasks.push(tokio::spawn(reconciler.run(shutdown_rx)));

        Ok(Engine {
            cfg,
            store,
            governor,
            partitioner,
            evaluator,
            protection,
            marks,
            started_at_ms: now,
            intake_connected,
            marks_connected,
            user_connected,
            dropped_events,
            shutdown_tx,
            tasks,
        })
    }

    /// Fan liquidation batches out to per-symbol evaluator workers so
    /// per-symbol ordering holds while symbols evaluate in parallel.
    async fn dispatch_loop(
        cfg: Arc<Config>,
        window: Arc<VolumeWindow>,
        evaluator: Arc<TradeEvaluator>,
        mut rx: mpsc::Receiver<Vec<LiquidationEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut workers: HashMap<String, mpsc::Sender<Vec<LiquidationEvent>>> = HashMap::new();

        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            // Window first, so every evaluation sees the updated sums.
            for event in &batch {
                window.record(event);
            }

            let mut by_symbol: HashMap<String, Vec<LiquidationEvent>> = HashMap::new();
            for event in batch {
                if cfg.symbols.contains_key(&event.symbol) {
                    by_symbol.entry(event.symbol.clone()).or_default().push(event);
                }
            }

            for (symbol, events) in by_symbol {
                let tx = workers.entry(symbol.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel::<Vec<LiquidationEvent>>(WORKER_QUEUE);
                    let evaluator = evaluator.clone();
                    tokio::spawn(Self::symbol_worker(symbol.clone(), evaluator, rx));
                    tx
                });
                if tx.send(events).await.is_err() {
                    workers.remove(&symbol);
                }
            }
        }
        info!("liquidation dispatcher stopped");
    }

    /// One inflight evaluation per symbol; later batches queue. Within a
    /// batch only the latest event per liquidated side is evaluated (the
    /// window sum already reflects the rest).
    async fn symbol_worker(
        symbol: String,
        evaluator: Arc<TradeEvaluator>,
        mut rx: mpsc::Receiver<Vec<LiquidationEvent>>,
    ) {
        while let Some(events) = rx.recv().await {
            let mut latest_per_side: HashMap<crate::models::Side, &LiquidationEvent> =
                HashMap::new();
            for e in &events {
                latest_per_side.insert(e.liquidated_side, e);
            }
            for event in latest_per_side.into_values() {
                if let Err(e) = evaluator.evaluate(event).await {
                    warn!(symbol = %symbol, error = %e, "evaluation failed");
                }
            }
        }
    }

    async fn fill_loop(
        router: Arc<FillRouter>,
        mut rx: mpsc::UnboundedReceiver<crate::models::FillEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    // Drain what is already queued before exiting.
                    while let Ok(event) = rx.try_recv() {
                        if let Err(e) = router.handle(event).await {
                            warn!(error = %e, "fill routing failed during drain");
                        }
                    }
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = router.handle(event).await {
                warn!(error = %e, "fill routing failed");
            }
        }
        info!("fill router stopped");
    }

    pub fn projections(&self) -> Projections {
        Projections::new(
            self.cfg.clone(),
            self.store.clone(),
            self.partitioner.clone(),
            self.protection.clone(),
            self.evaluator.clone(),
            self.governor.clone(),
            self.marks.clone(),
            self.started_at_ms,
            self.intake_connected.clone(),
            self.marks_connected.clone(),
            self.user_connected.clone(),
            self.dropped_events.clone(),
        )
    }

    /// Cascading shutdown: signal, drain, enforce the hard-stop timeout.
    /// Returns false when the timeout fired with undrained tasks.
    pub async fn shutdown(self) -> bool {
        let _ = self.shutdown_tx.send(true);
        let timeout = Duration::from_secs(self.cfg.shutdown_timeout_secs);
        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("engine drained cleanly");
                true
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "hard-stop timeout reached with undrained tasks");
                false
            }
        }
    }
}
