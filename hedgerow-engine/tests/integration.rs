//! End-to-end engine flows against scripted paper venues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hedgerow_core::{
    Fill, MarketPair, OrderRole, OrderSpec, OrderStatus, OrderType, PairLeg, Side, TimeInForce,
    Venue,
};
use hedgerow_engine::{
    AccountPool, AccountSpec, DenyReason, EngineError, FillTracking, HealthcheckConfig,
    HealthcheckService, Hedger, HedgerConfig, NoopTelemetry, OrderManager, OrderManagerConfig,
    PairController, PairControllerConfig, PairRegistry, Reconciler, ReconcilerConfig,
    RiskLimits, RiskManager, ShutdownSignal,
};
use hedgerow_paper::{scripted_book, PaperVenue, PaperVenueConfig};
use hedgerow_store::{SqliteStore, Store};
use hedgerow_venue::{VenueAdapter, VenueFill};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

const PRIMARY_VENUE: &str = "polymarket";
const SECONDARY_VENUE: &str = "opinion";
const PRIMARY_MARKET: &str = "pm-yes";
const SECONDARY_MARKET: &str = "op-yes";
const PAIR_ID: &str = "ev-superbowl";

struct Harness {
    primary: Arc<PaperVenue>,
    secondary: Arc<PaperVenue>,
    store: Arc<SqliteStore>,
    manager: Arc<OrderManager>,
    hedger: Arc<Hedger>,
    reconciler: Arc<Reconciler>,
    registry: Arc<PairRegistry>,
    rx: mpsc::Receiver<Fill>,
}

#[derive(Clone, Copy)]
struct HarnessOptions {
    dry_run: bool,
    double_limit: bool,
    allow_partial_hedge: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            double_limit: false,
            allow_partial_hedge: true,
        }
    }
}

fn market_pair() -> MarketPair {
    MarketPair {
        pair_id: PAIR_ID.into(),
        primary: PairLeg {
            venue: Venue::new(PRIMARY_VENUE),
            market_id: PRIMARY_MARKET.into(),
            account_id: "pm-acct".into(),
        },
        secondary: PairLeg {
            venue: Venue::new(SECONDARY_VENUE),
            market_id: SECONDARY_MARKET.into(),
            account_id: "op-acct".into(),
        },
    }
}

fn build(options: HarnessOptions) -> Harness {
    let primary = Arc::new(PaperVenue::new(PaperVenueConfig {
        venue: Venue::new(PRIMARY_VENUE),
        ..PaperVenueConfig::default()
    }));
    let secondary = Arc::new(PaperVenue::new(PaperVenueConfig {
        venue: Venue::new(SECONDARY_VENUE),
        ..PaperVenueConfig::default()
    }));
    primary.set_book(scripted_book(
        &Venue::new(PRIMARY_VENUE),
        PRIMARY_MARKET,
        &[(dec!(0.40), dec!(100))],
        &[(dec!(0.42), dec!(100))],
    ));
    secondary.set_book(scripted_book(
        &Venue::new(SECONDARY_VENUE),
        SECONDARY_MARKET,
        &[(dec!(0.48), dec!(100))],
        &[(dec!(0.50), dec!(100))],
    ));

    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert(Venue::new(PRIMARY_VENUE), primary.clone());
    adapters.insert(Venue::new(SECONDARY_VENUE), secondary.clone());

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let telemetry = Arc::new(NoopTelemetry);
    let (tx, rx) = mpsc::channel(256);
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        telemetry.clone(),
        ReconcilerConfig {
            lru_capacity: 256,
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(30),
        },
        tx,
    ));
    let accounts = Arc::new(
        AccountPool::new(vec![
            AccountSpec {
                account_id: "pm-acct".into(),
                venue: Venue::new(PRIMARY_VENUE),
                tokens_per_sec: 100,
                burst: 100,
                weight: Decimal::ONE,
            },
            AccountSpec {
                account_id: "op-acct".into(),
                venue: Venue::new(SECONDARY_VENUE),
                tokens_per_sec: 100,
                burst: 100,
                weight: Decimal::ONE,
            },
        ])
        .unwrap(),
    );
    let risk = RiskManager::new(RiskLimits {
        exposure_cap: dec!(10000),
        max_open_orders_per_pair: 2,
        balance_safety_margin: dec!(0.95),
        max_slippage: dec!(0.5),
        cool_down: chrono::Duration::seconds(300),
    });
    let manager = Arc::new(OrderManager::new(
        adapters.clone(),
        store.clone(),
        risk,
        accounts,
        vec![market_pair()],
        telemetry.clone(),
        Some(reconciler.clone() as Arc<dyn FillTracking>),
        OrderManagerConfig {
            dry_run: options.dry_run,
            double_limit_enabled: options.double_limit,
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            place_timeout: Duration::from_secs(1),
            cancel_timeout: Duration::from_secs(1),
            max_order_age: None,
        },
        ShutdownSignal::new(),
    ));
    let mut fees = HashMap::new();
    fees.insert(
        Venue::new(PRIMARY_VENUE),
        hedgerow_core::FeeSchedule {
            maker: dec!(0.01),
            taker: dec!(0.01),
        },
    );
    fees.insert(
        Venue::new(SECONDARY_VENUE),
        hedgerow_core::FeeSchedule {
            maker: dec!(0.01),
            taker: dec!(0.01),
        },
    );
    let hedger = Arc::new(Hedger::new(
        adapters,
        manager.clone(),
        store.clone(),
        telemetry,
        fees,
        HedgerConfig {
            hedge_ratio: Decimal::ONE,
            max_slippage: dec!(0.005),
            allow_partial_hedge: options.allow_partial_hedge,
            multi_leg_enabled: false,
            multi_leg_children: Vec::new(),
            hedge_max_retries: 2,
            book_timeout: Duration::from_secs(1),
        },
    ));
    Harness {
        primary,
        secondary,
        store,
        manager,
        hedger,
        reconciler,
        registry: Arc::new(PairRegistry::new()),
        rx,
    }
}

impl Harness {
    fn controller(&self, double_limit: bool) -> PairController {
        let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(Venue::new(PRIMARY_VENUE), self.primary.clone());
        adapters.insert(Venue::new(SECONDARY_VENUE), self.secondary.clone());
        PairController::new(
            market_pair(),
            PairControllerConfig {
                entry_size: dec!(100),
                min_spread_for_entry: dec!(0.05),
                cancel_spread: dec!(0.01),
                max_order_age: Duration::from_secs(60),
                poll_interval: Duration::from_millis(10),
                book_timeout: Duration::from_secs(1),
                double_limit_enabled: double_limit,
                primary_fee: hedgerow_core::FeeSchedule {
                    maker: dec!(0.01),
                    taker: dec!(0.01),
                },
                secondary_fee: hedgerow_core::FeeSchedule {
                    maker: dec!(0.01),
                    taker: dec!(0.01),
                },
            },
            adapters,
            self.manager.clone(),
            self.store.clone(),
            Arc::new(NoopTelemetry),
            self.registry.status(PAIR_ID),
        )
    }

    /// Drain the canonical fill channel and route each fill through the
    /// manager and, when directed, the hedger.
    async fn route_fills(&mut self) {
        while let Ok(fill) = self.rx.try_recv() {
            if let Some(directive) = self.manager.on_fill(&fill).await.unwrap() {
                self.hedger.on_entry_fill(directive).await.unwrap();
            }
        }
    }

    fn primary_fill(&self, venue_order_id: &str, fill_id: &str, size: Decimal) -> VenueFill {
        VenueFill {
            venue: Venue::new(PRIMARY_VENUE),
            venue_order_id: venue_order_id.into(),
            fill_id: Some(fill_id.into()),
            client_order_id: None,
            market_id: PRIMARY_MARKET.into(),
            side: Side::Buy,
            price: dec!(0.42),
            size,
            seq: None,
            ts: Utc::now(),
        }
    }
}

fn entry_spec(size: Decimal) -> OrderSpec {
    OrderSpec {
        venue: Venue::new(PRIMARY_VENUE),
        account_id: "pm-acct".into(),
        market_id: PRIMARY_MARKET.into(),
        pair_id: PAIR_ID.into(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        price: Some(dec!(0.42)),
        size,
        time_in_force: Some(TimeInForce::GoodTilCancelled),
        role: OrderRole::Primary,
        parent_fill_id: None,
    }
}

#[tokio::test]
async fn spread_entry_places_hedges_and_records_trade() {
    let mut harness = build(HarnessOptions::default());
    let controller = harness.controller(false);

    controller.tick().await.unwrap();
    let entry = harness.manager.live_entry(PAIR_ID).expect("entry placed");
    assert_eq!(entry.status, OrderStatus::Live);
    assert_eq!(entry.role, OrderRole::Primary);

    // Full fill arrives over the websocket.
    let venue_order_id = harness
        .primary
        .resting_order_id(&entry.client_order_id)
        .unwrap();
    harness
        .reconciler
        .ingest_push(harness.primary_fill(&venue_order_id, "f-1", dec!(100)))
        .await;
    harness.route_fills().await;

    let order = harness
        .store
        .load_order(&entry.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_size, dec!(100));

    let trades = harness.store.trades().unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.size, dec!(100));
    assert_eq!(trade.entry_price, dec!(0.42));
    assert_eq!(trade.hedge_price, dec!(0.48));
    // (0.48 - 0.42) * 100 minus 1% fees on both legs.
    assert_eq!(trade.fees, dec!(0.90));
    assert_eq!(trade.pnl_estimate, dec!(5.10));
}

#[tokio::test]
async fn double_limit_cancels_sibling_before_hedging() {
    let mut harness = build(HarnessOptions {
        double_limit: true,
        ..HarnessOptions::default()
    });
    let controller = harness.controller(true);
    controller.tick().await.unwrap();

    let open = harness.manager.open_orders();
    assert_eq!(open.len(), 2);
    let leg_a = open
        .iter()
        .find(|digest| digest.role == OrderRole::DoubleA)
        .unwrap()
        .clone();
    let leg_b = open
        .iter()
        .find(|digest| digest.role == OrderRole::DoubleB)
        .unwrap()
        .clone();
    assert_eq!(
        harness
            .secondary
            .fetch_open_orders(&"op-acct".to_string())
            .await
            .unwrap()
            .len(),
        1
    );

    // Leg A fills 50; the sibling must be pulled before the hedge fires.
    let venue_order_id = harness
        .primary
        .resting_order_id(&leg_a.client_order_id)
        .unwrap();
    harness
        .reconciler
        .ingest_push(harness.primary_fill(&venue_order_id, "f-1", dec!(50)))
        .await;
    harness.route_fills().await;

    let record = harness
        .store
        .get_double_limit_by_order(&leg_a.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, hedgerow_core::DoubleLimitState::Resolved);
    assert_eq!(
        record.triggered_order_id.as_deref(),
        Some(leg_a.client_order_id.as_str())
    );
    assert_eq!(
        record.cancelled_order_id.as_deref(),
        Some(leg_b.client_order_id.as_str())
    );

    // The sibling no longer rests on the secondary venue.
    assert!(harness
        .secondary
        .fetch_open_orders(&"op-acct".to_string())
        .await
        .unwrap()
        .is_empty());
    let sibling = harness
        .store
        .load_order(&leg_b.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(sibling.status, OrderStatus::Cancelled);

    let trades = harness.store.trades().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].size, dec!(50));
}

#[tokio::test]
async fn partial_fills_surface_through_polling_diffs() {
    let mut harness = build(HarnessOptions::default());
    let placement = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&placement.client_order_id)
        .unwrap();

    // Poll N observes 30 filled, poll N+1 observes 70.
    harness.primary.report_fill(&venue_order_id, dec!(30));
    let sweep = harness
        .primary
        .fetch_open_orders(&"pm-acct".to_string())
        .await
        .unwrap();
    harness
        .reconciler
        .ingest_poll(&Venue::new(PRIMARY_VENUE), &sweep)
        .await;
    harness.primary.report_fill(&venue_order_id, dec!(70));
    let sweep = harness
        .primary
        .fetch_open_orders(&"pm-acct".to_string())
        .await
        .unwrap();
    harness
        .reconciler
        .ingest_poll(&Venue::new(PRIMARY_VENUE), &sweep)
        .await;

    let first = harness.rx.recv().await.unwrap();
    let second = harness.rx.recv().await.unwrap();
    assert_eq!(first.size, dec!(30));
    assert_eq!(second.size, dec!(40));
    assert_eq!(
        harness
            .store
            .fill_watermark(&Venue::new(PRIMARY_VENUE), &venue_order_id)
            .unwrap(),
        Some(dec!(70))
    );

    harness.manager.on_fill(&first).await.unwrap();
    harness.manager.on_fill(&second).await.unwrap();
    let order = harness
        .store
        .load_order(&placement.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Partial);
    assert_eq!(order.filled_size, dec!(70));
}

#[tokio::test]
async fn duplicate_websocket_frames_hedge_exactly_once() {
    let mut harness = build(HarnessOptions::default());
    let controller = harness.controller(false);
    controller.tick().await.unwrap();
    let entry = harness.manager.live_entry(PAIR_ID).unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&entry.client_order_id)
        .unwrap();

    // The same frame lands twice within the dedup window.
    let frame = harness.primary_fill(&venue_order_id, "f-1", dec!(100));
    harness.reconciler.ingest_push(frame.clone()).await;
    harness.reconciler.ingest_push(frame).await;
    harness.route_fills().await;

    assert_eq!(harness.store.trades().unwrap().len(), 1);
    // One entry on the primary, exactly one hedge on the secondary.
    assert_eq!(harness.secondary.place_calls(), 1);
}

#[tokio::test]
async fn duplicate_directive_is_ignored_by_the_hedger() {
    let harness = build(HarnessOptions::default());
    let placement = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&placement.client_order_id)
        .unwrap();
    let fill = Fill {
        venue: Venue::new(PRIMARY_VENUE),
        venue_order_id,
        fill_id: Some("f-1".into()),
        client_order_id: Some(placement.client_order_id.clone()),
        market_id: PRIMARY_MARKET.into(),
        side: Side::Buy,
        price: dec!(0.42),
        size: dec!(100),
        ts: Utc::now(),
    };
    let directive = harness.manager.on_fill(&fill).await.unwrap().unwrap();
    harness.hedger.on_entry_fill(directive.clone()).await.unwrap();
    harness.hedger.on_entry_fill(directive).await.unwrap();
    assert_eq!(harness.store.trades().unwrap().len(), 1);
}

#[tokio::test]
async fn hedge_aborts_on_slippage_without_partial_hedging() {
    let harness = build(HarnessOptions {
        allow_partial_hedge: false,
        ..HarnessOptions::default()
    });
    // Only 40 contracts rest near the top; the rest sits far below.
    harness.secondary.set_book(scripted_book(
        &Venue::new(SECONDARY_VENUE),
        SECONDARY_MARKET,
        &[(dec!(0.48), dec!(40)), (dec!(0.30), dec!(60))],
        &[(dec!(0.50), dec!(100))],
    ));
    let placement = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&placement.client_order_id)
        .unwrap();
    let fill = Fill {
        venue: Venue::new(PRIMARY_VENUE),
        venue_order_id,
        fill_id: Some("f-1".into()),
        client_order_id: Some(placement.client_order_id.clone()),
        market_id: PRIMARY_MARKET.into(),
        side: Side::Buy,
        price: dec!(0.42),
        size: dec!(100),
        ts: Utc::now(),
    };
    let directive = harness.manager.on_fill(&fill).await.unwrap().unwrap();
    harness.hedger.on_entry_fill(directive).await.unwrap();

    assert!(harness.store.trades().unwrap().is_empty());
    assert_eq!(harness.secondary.place_calls(), 0);
    let incidents = harness.store.recent_incidents(10).unwrap();
    assert!(incidents
        .iter()
        .any(|incident| incident.message == "HEDGE_SLIPPAGE_ABORT"));
}

#[tokio::test]
async fn hedge_book_fetch_failure_is_not_a_slippage_abort() {
    let harness = build(HarnessOptions::default());
    let placement = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&placement.client_order_id)
        .unwrap();
    let fill = Fill {
        venue: Venue::new(PRIMARY_VENUE),
        venue_order_id,
        fill_id: Some("f-1".into()),
        client_order_id: Some(placement.client_order_id.clone()),
        market_id: PRIMARY_MARKET.into(),
        side: Side::Buy,
        price: dec!(0.42),
        size: dec!(100),
        ts: Utc::now(),
    };
    let mut directive = harness.manager.on_fill(&fill).await.unwrap().unwrap();
    // The hedge venue has no book for this market: an outage, not a
    // slippage breach.
    directive.target.market_id = "ghost-market".into();
    harness.hedger.on_entry_fill(directive).await.unwrap_err();

    assert!(harness.store.trades().unwrap().is_empty());
    assert_eq!(harness.secondary.place_calls(), 0);
    let incidents = harness.store.recent_incidents(10).unwrap();
    assert!(incidents
        .iter()
        .any(|incident| incident.message == "HEDGE_BOOK_FETCH_FAILED"));
    assert!(!incidents
        .iter()
        .any(|incident| incident.message == "HEDGE_SLIPPAGE_ABORT"));
}

#[tokio::test]
async fn dry_run_never_touches_the_venue() {
    let harness = build(HarnessOptions {
        dry_run: true,
        ..HarnessOptions::default()
    });
    let controller = harness.controller(false);
    controller.tick().await.unwrap();

    // The order row exists, tagged synthetic, but no adapter call was made
    // and the live view stays empty.
    assert_eq!(harness.primary.place_calls(), 0);
    assert!(harness.manager.open_orders().is_empty());
    let open = harness.store.open_orders().unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].dry_run);
    assert_eq!(open[0].status, OrderStatus::Live);
    assert!(open[0]
        .venue_order_id
        .as_deref()
        .unwrap()
        .starts_with("dry-"));
}

#[tokio::test]
async fn transient_placement_failures_are_retried_with_backoff() {
    let harness = build(HarnessOptions::default());
    harness.primary.fail_next_places(2);
    let placement = harness
        .manager
        .place(entry_spec(dec!(10)), Decimal::ZERO)
        .await
        .unwrap();
    assert_eq!(harness.primary.place_calls(), 3);
    let order = harness
        .store
        .load_order(&placement.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Live);
}

#[tokio::test]
async fn exhausted_retries_error_the_order() {
    let harness = build(HarnessOptions::default());
    harness.primary.fail_next_places(5);
    let err = harness
        .manager
        .place(entry_spec(dec!(10)), Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Venue(_)));
    assert_eq!(harness.primary.place_calls(), 3);
    let open = harness.manager.open_orders();
    assert!(open.is_empty());
}

#[tokio::test]
async fn risk_denial_rejects_before_any_network_call() {
    let harness = build(HarnessOptions::default());
    harness.primary.set_balance("pm-acct", dec!(1));
    let err = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RiskDenied(DenyReason::InsufficientBalance)
    ));
    // Only the balance probe reached the venue; no placement did.
    assert_eq!(harness.primary.place_calls(), 0);
}

#[tokio::test]
async fn spread_decay_pulls_the_resting_entry() {
    let harness = build(HarnessOptions::default());
    let controller = harness.controller(false);
    controller.tick().await.unwrap();
    let entry = harness.manager.live_entry(PAIR_ID).unwrap();

    // The primary ask runs up; the edge is gone.
    harness.primary.set_book(scripted_book(
        &Venue::new(PRIMARY_VENUE),
        PRIMARY_MARKET,
        &[(dec!(0.45), dec!(100))],
        &[(dec!(0.47), dec!(100))],
    ));
    controller.tick().await.unwrap();

    assert!(harness.manager.live_entry(PAIR_ID).is_none());
    let order = harness
        .store
        .load_order(&entry.client_order_id)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn recovery_replays_open_orders_from_the_event_log() {
    let harness = build(HarnessOptions::default());
    let placement = harness
        .manager
        .place(entry_spec(dec!(100)), Decimal::ZERO)
        .await
        .unwrap();
    let venue_order_id = harness
        .primary
        .resting_order_id(&placement.client_order_id)
        .unwrap();
    let fill = Fill {
        venue: Venue::new(PRIMARY_VENUE),
        venue_order_id,
        fill_id: Some("f-1".into()),
        client_order_id: Some(placement.client_order_id.clone()),
        market_id: PRIMARY_MARKET.into(),
        side: Side::Buy,
        price: dec!(0.42),
        size: dec!(30),
        ts: Utc::now(),
    };
    harness.manager.on_fill(&fill).await.unwrap();

    // A fresh manager over the same store reconstructs the machine.
    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert(Venue::new(PRIMARY_VENUE), harness.primary.clone());
    adapters.insert(Venue::new(SECONDARY_VENUE), harness.secondary.clone());
    let recovered = Arc::new(OrderManager::new(
        adapters,
        harness.store.clone(),
        RiskManager::new(RiskLimits {
            exposure_cap: dec!(10000),
            max_open_orders_per_pair: 2,
            balance_safety_margin: dec!(0.95),
            max_slippage: dec!(0.5),
            cool_down: chrono::Duration::seconds(300),
        }),
        Arc::new(AccountPool::new(vec![]).unwrap()),
        vec![market_pair()],
        Arc::new(NoopTelemetry),
        None,
        OrderManagerConfig::default(),
        ShutdownSignal::new(),
    ));
    let restored = recovered.recover().unwrap();
    assert_eq!(restored, 1);
    let digest = recovered.live_entry(PAIR_ID).unwrap();
    assert_eq!(digest.client_order_id, placement.client_order_id);
    assert_eq!(digest.status, OrderStatus::Partial);
}

#[tokio::test]
async fn simulation_is_deterministic_and_read_only() {
    let harness = build(HarnessOptions::default());
    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert(Venue::new(PRIMARY_VENUE), harness.primary.clone());
    adapters.insert(Venue::new(SECONDARY_VENUE), harness.secondary.clone());
    let service = HealthcheckService::new(
        vec![market_pair()],
        adapters,
        harness.store.clone(),
        HealthcheckConfig {
            canonical_size: dec!(100),
            book_timeout: Duration::from_secs(1),
            primary_fee: hedgerow_core::FeeSchedule {
                maker: dec!(0.01),
                taker: dec!(0.01),
            },
            secondary_fee: hedgerow_core::FeeSchedule {
                maker: dec!(0.01),
                taker: dec!(0.01),
            },
            hedge_ratio: Decimal::ONE,
            multi_leg_children: Vec::new(),
        },
    );

    let first = service.simulate(PAIR_ID, Some(dec!(100))).await.unwrap();
    let second = service.simulate(PAIR_ID, Some(dec!(100))).await.unwrap();
    assert_eq!(first.plan, second.plan);
    assert_eq!(first.expected_pnl, second.expected_pnl);
    assert!(first.plan["viable"].as_bool().unwrap());
    // Simulation never places orders.
    assert_eq!(harness.primary.place_calls(), 0);
    assert_eq!(harness.secondary.place_calls(), 0);

    let health = service.health().await;
    assert_eq!(health.len(), 1);
    assert!(health[0].is_ok());
    assert!(health[0].net_spread.is_some());
}

#[tokio::test]
async fn simulation_scales_hedge_legs_by_the_hedge_ratio() {
    let harness = build(HarnessOptions::default());
    let service = |hedge_ratio: Decimal| {
        let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(Venue::new(PRIMARY_VENUE), harness.primary.clone());
        adapters.insert(Venue::new(SECONDARY_VENUE), harness.secondary.clone());
        HealthcheckService::new(
            vec![market_pair()],
            adapters,
            harness.store.clone(),
            HealthcheckConfig {
                canonical_size: dec!(100),
                book_timeout: Duration::from_secs(1),
                primary_fee: hedgerow_core::FeeSchedule {
                    maker: dec!(0.01),
                    taker: dec!(0.01),
                },
                secondary_fee: hedgerow_core::FeeSchedule {
                    maker: dec!(0.01),
                    taker: dec!(0.01),
                },
                hedge_ratio,
                multi_leg_children: Vec::new(),
            },
        )
    };

    let full = service(Decimal::ONE)
        .simulate(PAIR_ID, Some(dec!(100)))
        .await
        .unwrap();
    let half = service(dec!(0.5))
        .simulate(PAIR_ID, Some(dec!(100)))
        .await
        .unwrap();

    let leg_size = |run: &hedgerow_core::SimulatedRun| -> Decimal {
        run.plan["hedge_legs"][0]["size"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap()
    };
    // The would-be hedge covers entry × hedge_ratio, like the live hedger.
    assert_eq!(leg_size(&full), dec!(100));
    assert_eq!(leg_size(&half), dec!(50));
    assert_eq!(half.plan["hedge_ratio"].as_str().unwrap(), "0.5");
    // The entry leg itself is unaffected by the ratio.
    assert_eq!(half.plan["entry_leg"]["size"].as_str().unwrap(), "100");
    // Pnl accrues on the matched size, so a smaller hedge earns less.
    assert!(half.expected_pnl > Decimal::ZERO);
    assert!(half.expected_pnl < full.expected_pnl);
}
