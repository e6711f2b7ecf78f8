//! End-to-end scenarios against the simulated venue.
//!
//! The harness wires the real components (store, window, evaluator,
//! partitioner, protection, fill router, fast path) to a `SimulatedVenue`
//! with controlled fills, and drives liquidations through the same calls the
//! engine dispatcher makes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use liqhunter::config::{Config, SymbolConfig};
use liqhunter::engine::breaker::CircuitBreaker;
use liqhunter::engine::evaluator::{EvalDecision, TradeEvaluator};
use liqhunter::engine::fast_path::FastPath;
use liqhunter::engine::fill_router::FillRouter;
use liqhunter::engine::protection::ProtectionManager;
use liqhunter::engine::reconciler::Reconciler;
use liqhunter::engine::tranches::{TranchePartitioner, TrancheRules};
use liqhunter::engine::window::VolumeWindow;
use liqhunter::models::{
    FillEvent, LiquidationEvent, OrderStatus, PositionKey, PositionSide, Side,
};
use liqhunter::store::Store;
use liqhunter::streams::mark_price::MarkTable;
use liqhunter::venue::governor::{Priority, RateGovernor};
use liqhunter::venue::sim::SimulatedVenue;
use liqhunter::venue::specs::{SpecCache, SymbolSpec};
use liqhunter::venue::{NewOrder, OrderType, VenueApi};

fn btc_spec() -> SymbolSpec {
    SymbolSpec {
        tick_size: 0.1,
        step_size: 0.001,
        min_notional: 100.0,
        price_precision: 1,
        qty_precision: 3,
    }
}

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.simulate_only = true;
    cfg.hedge_mode = true;
    cfg.window_ms = 5_000;
    cfg.max_total_exposure_usdt = 100_000.0;
    cfg.max_open_orders_per_symbol = 3;
    cfg.tranche_pnl_increment_pct = 5.0;
    cfg.max_tranches_per_symbol_side = 5;
    cfg.batch_orders_enabled = true;
    cfg.symbols.insert(
        "BTCUSDT".to_string(),
        SymbolConfig {
            volume_threshold_long: 100_000.0,
            volume_threshold_short: 100_000.0,
            leverage: 10,
            trade_value_usdt: 100.0,
            price_offset_pct: 0.1,
            max_position_usdt: 50_000.0,
            take_profit_pct: 2.0,
            stop_loss_pct: 1.0,
            ..SymbolConfig::default()
        },
    );
    cfg
}

struct Harness {
    cfg: Arc<Config>,
    store: Store,
    venue: Arc<SimulatedVenue>,
    window: Arc<VolumeWindow>,
    partitioner: Arc<TranchePartitioner>,
    protection: Arc<ProtectionManager>,
    evaluator: Arc<TradeEvaluator>,
    router: FillRouter,
    fast_path: FastPath,
    fill_rx: mpsc::UnboundedReceiver<FillEvent>,
    marks: Arc<MarkTable>,
    nudge: Arc<Notify>,
    _db: tempfile::NamedTempFile,
}

fn harness(cfg: Config) -> Harness {
    let cfg = Arc::new(cfg);
    let db = tempfile::NamedTempFile::new().unwrap();
    let store = Store::open(db.path().to_str().unwrap()).unwrap();

    let (fill_tx, fill_rx) = mpsc::unbounded_channel();
    let venue = Arc::new(SimulatedVenue::new(fill_tx, false));
    venue.set_specs(vec![("BTCUSDT".to_string(), btc_spec())]);
    venue.set_depth("BTCUSDT", 60_000.0, 60_000.1);

    let specs = Arc::new(SpecCache::new(Duration::from_secs(3_600)));
    specs.replace_all(vec![("BTCUSDT".to_string(), btc_spec())]);

    let governor = Arc::new(RateGovernor::new(cfg.rate_limit_buffer_pct));
    let window = Arc::new(VolumeWindow::new(cfg.window_ms));
    let partitioner = Arc::new(TranchePartitioner::new(
        store.clone(),
        TrancheRules::from_config(&cfg),
    ));
    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
    let venue_dyn: Arc<dyn VenueApi> = venue.clone();
    let protection = Arc::new(ProtectionManager::new(
        cfg.clone(),
        venue_dyn.clone(),
        store.clone(),
        specs.clone(),
        breaker,
    ));
    let evaluator = Arc::new(TradeEvaluator::new(
        cfg.clone(),
        venue_dyn,
        store.clone(),
        window.clone(),
        specs,
        governor,
        partitioner.clone(),
    ));
    let nudge = Arc::new(Notify::new());
    let router = FillRouter::new(
        store.clone(),
        partitioner.clone(),
        protection.clone(),
        evaluator.clone(),
        nudge.clone(),
    );
    let fast_path = FastPath::new(cfg.clone(), partitioner.clone(), protection.clone());
    let marks = Arc::new(MarkTable::new());

    Harness {
        cfg,
        store,
        venue,
        window,
        partitioner,
        protection,
        evaluator,
        router,
        fast_path,
        fill_rx,
        marks,
        nudge,
        _db: db,
    }
}

impl Harness {
    /// Feed one liquidation the way the dispatcher does: window first, then
    /// evaluation.
    async fn feed_liquidation(
        &self,
        side: Side,
        qty: f64,
        price: f64,
        at_ms: i64,
    ) -> EvalDecision {
        let event = LiquidationEvent {
            event_id: format!("BTCUSDT-{at_ms}-{qty}-{price}"),
            symbol: "BTCUSDT".to_string(),
            liquidated_side: side,
            qty,
            price,
            usdt_value: qty * price,
            event_time_ms: at_ms,
            received_time_ms: at_ms,
        };
        self.store.insert_liquidation(&event).await.unwrap();
        self.window.record(&event);
        self.evaluator.evaluate(&event).await.unwrap()
    }

    /// Route every queued fill/cancel event.
    async fn pump(&mut self) {
        while let Ok(event) = self.fill_rx.try_recv() {
            self.router.handle(event).await.unwrap();
        }
    }

    async fn tranches(&self, side: PositionSide) -> Vec<liqhunter::models::Tranche> {
        let key = PositionKey::new("BTCUSDT", side);
        let book = self.partitioner.book(&key).await.unwrap();
        let book = book.lock().await;
        book.tranches.clone()
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.cfg.clone(),
            self.venue.clone(),
            self.store.clone(),
            self.partitioner.clone(),
            self.protection.clone(),
            self.marks.clone(),
            self.nudge.clone(),
        )
    }
}

// ============================================================================
// Scenario 1: single long entry, resting TP hit
// ============================================================================

#[tokio::test]
async fn single_long_entry_resting_tp_hit() {
    let mut h = harness(base_config());

    // Shorts liquidated (BUY forced orders) above threshold => open LONG.
    let decision = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let order_id = match decision {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("expected submission, got {other:?}"),
    };

    // Entry: LIMIT BUY 0.016 @ 59,940 (60,000 bid less 0.1%, tick-rounded).
    let entry = h.venue.order(order_id).unwrap();
    assert_eq!(entry.order.order_type, OrderType::Limit);
    assert_eq!(entry.order.side, Side::Buy);
    assert_eq!(entry.order.position_side, Some(PositionSide::Long));
    assert!((entry.order.price.unwrap() - 59_940.0).abs() < 1e-6);
    assert!((entry.order.qty - 0.016).abs() < 1e-12);

    // Fill the entry and route it.
    h.venue.fire_fill(order_id, 59_940.0).unwrap();
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    assert_eq!(tranches.len(), 1);
    assert_eq!(tranches[0].tranche_id, 0);
    assert!((tranches[0].avg_entry_price - 59_940.0).abs() < 1e-9);
    let tp_id = tranches[0].tp_order_id.expect("TP placed");
    let sl_id = tranches[0].sl_order_id.expect("SL placed");

    // TP: LIMIT SELL reduce-only @ 61,138.8; SL: STOP_MARKET @ 59,340.6.
    let tp = h.venue.order(tp_id).unwrap();
    assert_eq!(tp.order.order_type, OrderType::Limit);
    assert_eq!(tp.order.side, Side::Sell);
    assert!(tp.order.reduce_only);
    assert!((tp.order.price.unwrap() - 61_138.8).abs() < 0.05);
    assert!((tp.order.qty - 0.016).abs() < 1e-12);

    let sl = h.venue.order(sl_id).unwrap();
    assert_eq!(sl.order.order_type, OrderType::StopMarket);
    assert_eq!(sl.order.side, Side::Sell);
    assert!(sl.order.reduce_only);
    assert!((sl.order.stop_price.unwrap() - 59_340.6).abs() < 0.05);

    // Persisted too.
    let stored = h
        .store
        .list_tranches("BTCUSDT", PositionSide::Long)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].tp_order_id, Some(tp_id));

    // TP fills: tranche destroyed, SL canceled, nothing remains.
    h.venue.fire_fill(tp_id, 61_138.8).unwrap();
    h.pump().await;
    // The SL cancel itself emits an event; route it as well.
    h.pump().await;

    assert!(h.tranches(PositionSide::Long).await.is_empty());
    assert!(h
        .store
        .list_tranches("BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.venue.order(sl_id).unwrap().status, OrderStatus::Canceled);
    assert!(h.venue.live_orders().is_empty());
}

// ============================================================================
// Scenario 2: adverse price, second tranche
// ============================================================================

#[tokio::test]
async fn adverse_fill_opens_second_tranche() {
    let mut h = harness(base_config());

    let d1 = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry1 = match d1 {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry1, 60_000.0).unwrap();
    h.pump().await;

    // Second cascade; the entry fills 5.33% under the first.
    h.venue.set_depth("BTCUSDT", 56_850.0, 56_850.1);
    let d2 = h.feed_liquidation(Side::Buy, 2.0, 56_850.0, 2_000).await;
    let entry2 = match d2 {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry2, 56_800.0).unwrap();
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    assert_eq!(tranches.len(), 2);
    assert_eq!(tranches[0].tranche_id, 0);
    assert!((tranches[0].avg_entry_price - 60_000.0).abs() < 1e-9);
    assert_eq!(tranches[1].tranche_id, 1);
    assert!((tranches[1].avg_entry_price - 56_800.0).abs() < 1e-9);

    // Four live protective orders: two TPs, two SLs.
    let live = h.venue.live_orders();
    let tps = live
        .iter()
        .filter(|o| o.order.order_type == OrderType::Limit && o.order.reduce_only)
        .count();
    let sls = live
        .iter()
        .filter(|o| o.order.order_type == OrderType::StopMarket)
        .count();
    assert_eq!(tps, 2);
    assert_eq!(sls, 2);

    // Each tranche's protection derives from its own entry.
    for t in &tranches {
        let tp = h.venue.order(t.tp_order_id.unwrap()).unwrap();
        let expected = t.avg_entry_price * 1.02;
        assert!((tp.order.price.unwrap() - expected).abs() < 0.11);
    }
}

// ============================================================================
// Scenario 3: small adverse fill averages instead of creating
// ============================================================================

#[tokio::test]
async fn small_adverse_fill_averages_into_latest() {
    let mut h = harness(base_config());

    let d1 = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry1 = match d1 {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry1, 60_000.0).unwrap();
    h.pump().await;
    let first = h.tranches(PositionSide::Long).await;
    let q0 = first[0].quantity;
    let old_tp = first[0].tp_order_id.unwrap();

    // -0.67% vs 60k: absorbed, no tranche 1.
    h.venue.set_depth("BTCUSDT", 59_650.0, 59_650.1);
    let d2 = h.feed_liquidation(Side::Buy, 2.0, 59_650.0, 2_000).await;
    let entry2 = match d2 {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry2, 59_600.0).unwrap();
    let q1 = h.venue.order(entry2).unwrap().order.qty;
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    assert_eq!(tranches.len(), 1);
    let expected_avg = (60_000.0 * q0 + 59_600.0 * q1) / (q0 + q1);
    assert!((tranches[0].avg_entry_price - expected_avg).abs() < 1e-9);
    assert!((tranches[0].quantity - (q0 + q1)).abs() < 1e-12);

    // Protection was rebuilt: the old TP is terminal, exactly one new TP and
    // one new SL are live for the merged quantity.
    assert_eq!(h.venue.order(old_tp).unwrap().status, OrderStatus::Canceled);
    let live = h.venue.live_orders();
    assert_eq!(live.len(), 2);
    let new_tp = tranches[0].tp_order_id.unwrap();
    assert!((h.venue.order(new_tp).unwrap().order.qty - (q0 + q1)).abs() < 1e-12);
}

// ============================================================================
// Scenario 4: tranche cap forces a merge before creating
// ============================================================================

#[tokio::test]
async fn tranche_cap_forces_merge_first() {
    let mut cfg = base_config();
    cfg.max_tranches_per_symbol_side = 2;
    let mut h = harness(cfg);

    let prices = [(60_000.0, 60_000.0), (56_800.0, 56_800.0), (53_000.0, 53_000.0)];
    for (i, (depth, fill)) in prices.iter().enumerate() {
        h.venue.set_depth("BTCUSDT", *depth, depth + 0.1);
        let d = h
            .feed_liquidation(Side::Buy, 3.0, *depth, 1_000 * (i as i64 + 1))
            .await;
        let order_id = match d {
            EvalDecision::Submitted { order_id } => order_id,
            other => panic!("fill {i}: {other:?}"),
        };
        h.venue.fire_fill(order_id, *fill).unwrap();
        h.pump().await;
        // Route cancels emitted by merges/rebuilds.
        h.pump().await;
    }

    let tranches = h.tranches(PositionSide::Long).await;
    assert_eq!(tranches.len(), 2);
    // Ids stay monotonic: 0 and 1 merged into 0, the new tranche is 2.
    let ids: Vec<u64> = tranches.iter().map(|t| t.tranche_id).collect();
    assert_eq!(ids, vec![0, 2]);
    // Exactly one TP and one SL per tranche remain live.
    let live = h.venue.live_orders();
    assert_eq!(live.len(), 4);
    for t in &tranches {
        assert!(t.tp_order_id.is_some());
        assert!(t.sl_order_id.is_some());
    }
}

// ============================================================================
// Scenario 5: instant TP fast path
// ============================================================================

#[tokio::test]
async fn instant_tp_fast_path_cancels_and_market_reduces() {
    let mut h = harness(base_config());

    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 59_940.0).unwrap();
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    let tp_id = tranches[0].tp_order_id.unwrap();
    let sl_id = tranches[0].sl_order_id.unwrap();

    // Mark prints through the 61,138.8 TP.
    h.venue.set_mark("BTCUSDT", 61_200.0);
    h.fast_path.on_mark("BTCUSDT", 61_200.0).await;

    // Resting TP canceled; market reduce-only SELL fired and (being a market
    // order) filled at the mark.
    assert_eq!(h.venue.order(tp_id).unwrap().status, OrderStatus::Canceled);
    let market = h
        .venue
        .orders()
        .into_iter()
        .find(|o| o.order.order_type == OrderType::Market)
        .expect("market reduce placed");
    assert_eq!(market.order.side, Side::Sell);
    assert!(market.order.reduce_only);
    assert!((market.order.qty - tranches[0].quantity).abs() < 1e-12);

    // The ensuing fill flows back through the router and cleans up.
    h.pump().await;
    h.pump().await;
    assert!(h.tranches(PositionSide::Long).await.is_empty());
    assert_eq!(h.venue.order(sl_id).unwrap().status, OrderStatus::Canceled);
}

// ============================================================================
// Boundaries and gates
// ============================================================================

#[tokio::test]
async fn threshold_is_inclusive() {
    let mut cfg = base_config();
    cfg.symbols.get_mut("BTCUSDT").unwrap().volume_threshold_long = 120_000.0;
    let h = harness(cfg);

    // 119,999.99 < threshold: nothing.
    let d = h.feed_liquidation(Side::Buy, 1.0, 119_999.99, 1_000).await;
    assert_eq!(d, EvalDecision::BelowThreshold);

    // One more event pushes the window sum to exactly 120,000 + change;
    // evaluate an event whose window sum equals the threshold exactly.
    let h2 = harness({
        let mut cfg = base_config();
        cfg.symbols.get_mut("BTCUSDT").unwrap().volume_threshold_long = 120_000.0;
        cfg
    });
    let d = h2.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    assert!(matches!(d, EvalDecision::Submitted { .. }));
}

#[tokio::test]
async fn unconfigured_symbol_is_ignored() {
    let h = harness(base_config());
    let event = LiquidationEvent {
        event_id: "ETHUSDT-1-1-1".to_string(),
        symbol: "ETHUSDT".to_string(),
        liquidated_side: Side::Sell,
        qty: 1_000.0,
        price: 3_000.0,
        usdt_value: 3_000_000.0,
        event_time_ms: 1_000,
        received_time_ms: 1_000,
    };
    h.window.record(&event);
    assert_eq!(h.evaluator.evaluate(&event).await.unwrap(), EvalDecision::Ignored);
}

#[tokio::test]
async fn rounding_below_min_notional_vetoes() {
    let mut cfg = base_config();
    {
        let sc = cfg.symbols.get_mut("BTCUSDT").unwrap();
        // 10 * 10 = 100 notional passes the pre-check, but at 60k the
        // quantity rounds down to 0.001 (= 60 USDT), under the 100 minimum.
        sc.trade_value_usdt = 10.0;
        sc.leverage = 10;
    }
    let h = harness(cfg);
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    assert_eq!(d, EvalDecision::Vetoed("min_notional_after_rounding"));
}

#[tokio::test]
async fn exposure_cap_vetoes() {
    let mut cfg = base_config();
    cfg.max_total_exposure_usdt = 500.0; // below one entry's notional
    let h = harness(cfg);
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    assert_eq!(d, EvalDecision::Vetoed("max_total_exposure"));
}

#[tokio::test]
async fn contrarian_mapping_shorts_liquidated_longs_opened() {
    let mut h = harness(base_config());
    // Longs liquidated (SELL forced orders) => open SHORT.
    let d = h.feed_liquidation(Side::Sell, 2.0, 60_000.0, 1_000).await;
    let order_id = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    let entry = h.venue.order(order_id).unwrap();
    assert_eq!(entry.order.side, Side::Sell);
    assert_eq!(entry.order.position_side, Some(PositionSide::Short));
    // Short entry prices above the ask.
    assert!(entry.order.price.unwrap() > 60_000.1);

    h.venue.fire_fill(order_id, entry.order.price.unwrap()).unwrap();
    h.pump().await;
    let tranches = h.tranches(PositionSide::Short).await;
    assert_eq!(tranches.len(), 1);
    // SHORT protection: TP below entry, SL above.
    let tp = h.venue.order(tranches[0].tp_order_id.unwrap()).unwrap();
    let sl = h.venue.order(tranches[0].sl_order_id.unwrap()).unwrap();
    assert!(tp.order.price.unwrap() < tranches[0].avg_entry_price);
    assert!(sl.order.stop_price.unwrap() > tranches[0].avg_entry_price);
}

// ============================================================================
// Reconciler
// ============================================================================

#[tokio::test]
async fn reconciler_wraps_orphan_quantity_in_recovery_tranche() {
    let h = harness(base_config());

    // Venue says we hold 0.02 BTC long; the engine knows nothing about it.
    h.venue.force_position("BTCUSDT", PositionSide::Long, 0.02);
    h.venue.set_mark("BTCUSDT", 60_000.0);
    h.marks.update("BTCUSDT", 60_000.0, 1_000);

    let report = h.reconciler().sweep().await.unwrap();
    assert_eq!(report.recovery_tranches, 1);

    let tranches = h.tranches(PositionSide::Long).await;
    assert_eq!(tranches.len(), 1);
    assert!((tranches[0].quantity - 0.02).abs() < 1e-12);
    assert!((tranches[0].avg_entry_price - 60_000.0).abs() < 1e-9);
    // The recovery tranche got protection.
    assert!(tranches[0].tp_order_id.is_some());
    assert!(tranches[0].sl_order_id.is_some());
}

#[tokio::test]
async fn reconciler_deletes_tranches_for_flat_position() {
    let mut h = harness(base_config());

    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 59_940.0).unwrap();
    h.pump().await;
    assert_eq!(h.tranches(PositionSide::Long).await.len(), 1);

    // Venue position vanished (e.g. liquidated or manually closed).
    h.venue.force_position("BTCUSDT", PositionSide::Long, 0.0);
    let report = h.reconciler().sweep().await.unwrap();
    assert_eq!(report.deleted_tranches, 1);
    assert!(h.tranches(PositionSide::Long).await.is_empty());
    assert!(h
        .store
        .list_tranches("BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn orphan_venue_orders_cancel_only_after_grace() {
    let mut cfg = base_config();
    cfg.order_ttl_ms = 50;
    let h = harness(cfg);

    // An order the engine knows nothing about, placed out of band.
    let stray = NewOrder {
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        position_side: Some(PositionSide::Long),
        order_type: OrderType::Limit,
        qty: 0.016,
        price: Some(58_000.0),
        stop_price: None,
        reduce_only: false,
        time_in_force: None,
        client_id: "manual-terminal-order".to_string(),
        working_type: None,
        price_protect: false,
        priority: Priority::Normal,
    };
    let ack = h.venue.place_order(&stray).await.unwrap();

    // The same reconciler instance must observe it across sweeps.
    let reconciler = h.reconciler();

    // First sweep sees the orphan but leaves it inside the grace window.
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.canceled_orphans, 0);
    assert!(!h.venue.order(ack.order_id).unwrap().status.is_terminal());

    // Once it has stayed unreferenced past the TTL, the next sweep cancels.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.canceled_orphans, 1);
    assert_eq!(
        h.venue.order(ack.order_id).unwrap().status,
        OrderStatus::Canceled
    );
}

#[tokio::test]
async fn reconciler_cancels_stale_entries() {
    let mut cfg = base_config();
    cfg.order_ttl_ms = 1; // everything is stale immediately
    let h = harness(cfg);

    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = h.reconciler().sweep().await.unwrap();
    assert!(report.canceled_stale_entries >= 1);
    assert_eq!(h.venue.order(entry).unwrap().status, OrderStatus::Canceled);
    let stored = h.store.get_order(entry).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Canceled);
}

// ============================================================================
// Idempotence / replay
// ============================================================================

#[tokio::test]
async fn replaying_stored_tranches_restores_books() {
    let mut h = harness(base_config());
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 59_940.0).unwrap();
    h.pump().await;
    let before = h.tranches(PositionSide::Long).await;

    // A fresh partitioner over the same store recovers the same book.
    let fresh = TranchePartitioner::new(h.store.clone(), TrancheRules::from_config(&h.cfg));
    fresh.recover().await.unwrap();
    let key = PositionKey::new("BTCUSDT", PositionSide::Long);
    let book = fresh.book(&key).await.unwrap();
    let book = book.lock().await;
    assert_eq!(book.tranches.len(), before.len());
    for (a, b) in book.tranches.iter().zip(before.iter()) {
        assert_eq!(a.tranche_id, b.tranche_id);
        assert!((a.quantity - b.quantity).abs() < 1e-12);
        assert!((a.avg_entry_price - b.avg_entry_price).abs() < 1e-9);
        assert_eq!(a.tp_order_id, b.tp_order_id);
    }
}

#[tokio::test]
async fn duplicate_liquidation_events_count_once() {
    let h = harness(base_config());
    let event = LiquidationEvent {
        event_id: "BTCUSDT-1000-2-60000".to_string(),
        symbol: "BTCUSDT".to_string(),
        liquidated_side: Side::Buy,
        qty: 2.0,
        price: 60_000.0,
        usdt_value: 120_000.0,
        event_time_ms: 1_000,
        received_time_ms: 1_000,
    };
    assert!(h.store.insert_liquidation(&event).await.unwrap());
    assert!(!h.store.insert_liquidation(&event).await.unwrap());
    let sum = h
        .store
        .sum_usdt_volume("BTCUSDT", Side::Buy, 0)
        .await
        .unwrap();
    assert!((sum - 120_000.0).abs() < 1e-9);
}

// ============================================================================
// Protection invariants under cancel storms
// ============================================================================

#[tokio::test]
async fn rebuild_cancel_events_do_not_retrigger_rebuilds() {
    let mut h = harness(base_config());
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 60_000.0).unwrap();
    h.pump().await;

    // Averaging fill forces a rebuild (cancel old legs + place new).
    h.venue.set_depth("BTCUSDT", 59_700.0, 59_700.1);
    let d2 = h.feed_liquidation(Side::Buy, 2.0, 59_700.0, 2_000).await;
    let entry2 = match d2 {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry2, 59_700.0).unwrap();
    h.pump().await;

    // Route the cancel events from the rebuild; they must not spawn more
    // protective orders.
    let live_before = h.venue.live_orders().len();
    h.pump().await;
    h.pump().await;
    let live_after = h.venue.live_orders().len();
    assert_eq!(live_before, live_after);
    // Exactly one TP + one SL for the single tranche (I1).
    assert_eq!(live_after, 2);
}

#[tokio::test]
async fn externally_canceled_protection_is_rebuilt() {
    let mut h = harness(base_config());
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 59_940.0).unwrap();
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    let tp_id = tranches[0].tp_order_id.unwrap();

    // Someone cancels the TP on the venue (not us).
    h.venue.cancel_order("BTCUSDT", tp_id).await.unwrap();
    h.pump().await;
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    let new_tp = tranches[0].tp_order_id.unwrap();
    assert_ne!(new_tp, tp_id);
    assert!(!h.venue.order(new_tp).unwrap().status.is_terminal());
}

// ============================================================================
// Projections / close command
// ============================================================================

#[tokio::test]
async fn sl_fill_destroys_tranche_and_cancels_tp() {
    let mut h = harness(base_config());
    let d = h.feed_liquidation(Side::Buy, 2.0, 60_000.0, 1_000).await;
    let entry = match d {
        EvalDecision::Submitted { order_id } => order_id,
        other => panic!("{other:?}"),
    };
    h.venue.fire_fill(entry, 59_940.0).unwrap();
    h.pump().await;

    let tranches = h.tranches(PositionSide::Long).await;
    let tp_id = tranches[0].tp_order_id.unwrap();
    let sl_id = tranches[0].sl_order_id.unwrap();

    // Stop triggers and fills at the stop price.
    h.venue.fire_fill(sl_id, 59_340.6).unwrap();
    h.pump().await;
    h.pump().await;

    assert!(h.tranches(PositionSide::Long).await.is_empty());
    assert_eq!(h.venue.order(tp_id).unwrap().status, OrderStatus::Canceled);
}
