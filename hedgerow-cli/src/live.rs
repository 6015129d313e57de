//! Root supervisor: builds the engine from configuration, spawns every task
//! and owns cooperative shutdown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hedgerow_config::AppConfig;
use hedgerow_core::{MarketPair, Venue};
use hedgerow_engine::{
    spawn_fill_router, AccountPool, AccountSpec, HealthcheckConfig, HealthcheckService, Hedger,
    HedgerConfig, OrderManager, OrderManagerConfig, PairController, PairControllerConfig,
    PairRegistry, Reconciler, ReconcilerConfig, RiskLimits, RiskManager, ShutdownSignal,
    Telemetry,
};
use hedgerow_paper::{PaperVenue, PaperVenueConfig};
use hedgerow_store::{SqliteStore, StoreError};
use hedgerow_venue::{AccountLimiter, VenueAdapter};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::TelegramNotifier;
use crate::control::{spawn_control_server, ControlState};
use crate::telemetry::{spawn_metrics_server, EngineMetrics};

/// Open the configured database. `sqlite://` prefixes and bare paths are
/// both accepted.
pub fn open_store(dsn: &str) -> Result<SqliteStore, StoreError> {
    let path = dsn.trim_start_matches("sqlite://");
    if path == ":memory:" {
        return SqliteStore::open_in_memory();
    }
    let path = PathBuf::from(path);
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).ok();
        }
    }
    SqliteStore::open(&path)
}

/// Everything the commands need, wired once from configuration.
pub struct Engine {
    pub adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    pub manager: Arc<OrderManager>,
    pub hedger: Arc<Hedger>,
    pub reconciler: Arc<Reconciler>,
    pub registry: Arc<PairRegistry>,
    pub healthcheck: Arc<HealthcheckService>,
    pub pairs: Vec<MarketPair>,
    pub store: Arc<SqliteStore>,
    pub metrics: Arc<EngineMetrics>,
    pub fill_rx: tokio::sync::mpsc::Receiver<hedgerow_core::Fill>,
    pub shutdown: ShutdownSignal,
}

/// Construct an adapter for `venue`.
///
/// Concrete venue REST/WebSocket clients live outside this workspace and
/// plug in here; the deterministic paper adapter is the one compiled in and
/// carries dry runs, local operation and the test suite.
fn adapter_for(venue: &Venue) -> Arc<dyn VenueAdapter> {
    Arc::new(PaperVenue::new(PaperVenueConfig {
        venue: venue.clone(),
        ..PaperVenueConfig::default()
    }))
}

pub fn build_engine(
    cfg: &AppConfig,
    pairs: Vec<MarketPair>,
    store: Arc<SqliteStore>,
) -> Result<Engine> {
    let shutdown = ShutdownSignal::new();
    let metrics = Arc::new(EngineMetrics::new());
    let telemetry: Arc<dyn Telemetry> = metrics.clone();

    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    for pair in &pairs {
        for leg in [&pair.primary, &pair.secondary] {
            adapters
                .entry(leg.venue.clone())
                .or_insert_with(|| adapter_for(&leg.venue));
        }
    }

    let (fill_tx, fill_rx) = tokio::sync::mpsc::channel(1024);
    let stale_threshold = pairs
        .iter()
        .flat_map(|pair| [&pair.primary.venue, &pair.secondary.venue])
        .map(|venue| cfg.connectivity_for(venue).stale_threshold_ms)
        .min()
        .unwrap_or(30_000);
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        telemetry.clone(),
        ReconcilerConfig {
            lru_capacity: 1024,
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(5),
            stale_threshold: Duration::from_millis(stale_threshold),
        },
        fill_tx,
    ));

    let accounts = Arc::new(
        AccountPool::new(
            cfg.accounts
                .iter()
                .map(|account| AccountSpec {
                    account_id: account.account_id.clone(),
                    venue: Venue::new(&account.venue),
                    tokens_per_sec: account.tokens_per_sec,
                    burst: account.burst,
                    weight: account.weight,
                })
                .collect(),
        )
        .context("invalid account rate budget")?,
    );

    let hedge_cfg = &cfg.market_hedge_mode;
    let risk = RiskManager::new(RiskLimits {
        exposure_cap: hedge_cfg.exposure_cap,
        max_open_orders_per_pair: hedge_cfg.max_open_orders_per_pair,
        balance_safety_margin: hedge_cfg.balance_safety_margin,
        max_slippage: hedge_cfg.max_slippage,
        cool_down: chrono::Duration::seconds(hedge_cfg.cool_down_secs as i64),
    });

    let manager = Arc::new(OrderManager::new(
        adapters.clone(),
        store.clone(),
        risk,
        accounts,
        pairs.clone(),
        telemetry.clone(),
        Some(reconciler.clone() as Arc<dyn hedgerow_engine::FillTracking>),
        OrderManagerConfig {
            dry_run: cfg.dry_run,
            double_limit_enabled: cfg.double_limit_enabled,
            max_retries: cfg.place_max_retries,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(4),
            place_timeout: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(5),
            max_order_age: Some(Duration::from_millis(hedge_cfg.max_order_age_ms)),
        },
        shutdown.clone(),
    ));

    let fees: HashMap<Venue, hedgerow_core::FeeSchedule> = adapters
        .keys()
        .map(|venue| (venue.clone(), cfg.fees_for(venue)))
        .collect();
    let hedger = Arc::new(Hedger::new(
        adapters.clone(),
        manager.clone(),
        store.clone(),
        telemetry.clone(),
        fees,
        HedgerConfig {
            hedge_ratio: hedge_cfg.hedge_ratio,
            max_slippage: hedge_cfg.max_slippage,
            allow_partial_hedge: cfg.allow_partial_hedge,
            multi_leg_enabled: cfg.multi_leg_enabled,
            multi_leg_children: cfg.multi_leg_children.clone(),
            hedge_max_retries: cfg.hedge_max_retries,
            book_timeout: Duration::from_secs(2),
        },
    ));

    let primary_fee = pairs
        .first()
        .map(|pair| cfg.fees_for(&pair.primary.venue))
        .unwrap_or_default();
    let secondary_fee = pairs
        .first()
        .map(|pair| cfg.fees_for(&pair.secondary.venue))
        .unwrap_or_default();
    let healthcheck = Arc::new(HealthcheckService::new(
        pairs.clone(),
        adapters.clone(),
        store.clone(),
        HealthcheckConfig {
            canonical_size: hedge_cfg.entry_size,
            book_timeout: Duration::from_secs(2),
            primary_fee,
            secondary_fee,
            hedge_ratio: hedge_cfg.hedge_ratio,
            multi_leg_children: cfg.multi_leg_children.clone(),
        },
    ));

    Ok(Engine {
        adapters,
        manager,
        hedger,
        reconciler,
        registry: Arc::new(PairRegistry::new()),
        healthcheck,
        pairs,
        store,
        metrics,
        fill_rx,
        shutdown,
    })
}

/// Run the live engine until Ctrl-C.
pub async fn run_live(cfg: AppConfig, pairs: Vec<MarketPair>, store: Arc<SqliteStore>) -> Result<()> {
    let engine = build_engine(&cfg, pairs, store)?;
    let Engine {
        adapters,
        manager,
        hedger,
        reconciler,
        registry,
        healthcheck,
        pairs,
        store,
        metrics,
        fill_rx,
        shutdown,
    } = engine;
    shutdown.hook_ctrl_c();

    let restored = manager.recover()?;
    if restored > 0 {
        info!(count = restored, "resumed with open orders");
    }

    let notifier = Arc::new(TelegramNotifier::new(&cfg.telegram));
    let heartbeat = notifier.spawn_heartbeat(
        Duration::from_secs(cfg.telegram.heartbeat_secs),
        shutdown.clone(),
    );

    let metrics_addr: SocketAddr = cfg
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics_addr '{}'", cfg.metrics_addr))?;
    let metrics_task = spawn_metrics_server(metrics.registry(), metrics_addr);

    let control_addr: SocketAddr = cfg
        .control_addr
        .parse()
        .with_context(|| format!("invalid control_addr '{}'", cfg.control_addr))?;
    let control_task = spawn_control_server(
        Arc::new(ControlState {
            started_at: Instant::now(),
            pair_count: pairs.len(),
            manager: manager.clone(),
            registry: registry.clone(),
            healthcheck: healthcheck.clone(),
        }),
        control_addr,
    );

    let router_task = spawn_fill_router(
        manager.clone(),
        hedger.clone(),
        registry.clone(),
        store.clone(),
        fill_rx,
        shutdown.clone(),
    );

    // One websocket reader and one poller per (venue, account).
    let mut source_tasks: Vec<JoinHandle<()>> = Vec::new();
    if !cfg.dry_run {
        let mut seen: HashSet<(Venue, String)> = HashSet::new();
        for pair in &pairs {
            for leg in [&pair.primary, &pair.secondary] {
                if !seen.insert((leg.venue.clone(), leg.account_id.clone())) {
                    continue;
                }
                let adapter = adapters
                    .get(&leg.venue)
                    .expect("adapter exists for every pair venue")
                    .clone();
                let connectivity = cfg.connectivity_for(&leg.venue);
                if connectivity.use_websocket && adapter.capabilities().supports_websocket {
                    source_tasks.push(reconciler.spawn_push_task(
                        adapter.clone(),
                        leg.account_id.clone(),
                        shutdown.clone(),
                    ));
                }
                let rate = cfg.rate_limit_for(&leg.venue);
                let limiter = AccountLimiter::new(rate.tokens_per_sec, rate.burst)
                    .context("invalid venue rate limit")?;
                source_tasks.push(reconciler.spawn_poll_task(
                    adapter,
                    leg.account_id.clone(),
                    Some(limiter),
                    Duration::from_millis(connectivity.poll_interval_ms),
                    shutdown.clone(),
                ));
            }
        }
    }

    let mut controller_tasks: Vec<JoinHandle<()>> = Vec::new();
    for pair in &pairs {
        let controller = Arc::new(PairController::new(
            pair.clone(),
            PairControllerConfig {
                entry_size: pair_entry_size(&cfg, &pair.pair_id),
                min_spread_for_entry: cfg.market_hedge_mode.min_spread_for_entry,
                cancel_spread: cfg.market_hedge_mode.cancel_spread,
                max_order_age: Duration::from_millis(cfg.market_hedge_mode.max_order_age_ms),
                poll_interval: Duration::from_millis(
                    cfg.connectivity_for(&pair.primary.venue).poll_interval_ms,
                ),
                book_timeout: Duration::from_secs(2),
                double_limit_enabled: cfg.double_limit_enabled,
                primary_fee: cfg.fees_for(&pair.primary.venue),
                secondary_fee: cfg.fees_for(&pair.secondary.venue),
            },
            adapters.clone(),
            manager.clone(),
            store.clone(),
            metrics.clone(),
            registry.status(&pair.pair_id),
        ));
        controller_tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    info!(
        pairs = pairs.len(),
        dry_run = cfg.dry_run,
        double_limit = cfg.double_limit_enabled,
        %metrics_addr,
        %control_addr,
        "hedgerow engine running"
    );
    notifier.send("hedgerow engine started").await;

    shutdown.wait().await;
    info!("shutdown requested; pulling open orders");
    manager.cancel_all_open().await;

    for task in controller_tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "controller join failed");
        }
    }
    for task in source_tasks {
        task.abort();
    }
    router_task.abort();
    metrics_task.abort();
    control_task.abort();
    if let Some(task) = heartbeat {
        task.abort();
    }
    notifier.send("hedgerow engine stopped").await;
    info!("clean shutdown complete");
    Ok(())
}

/// One-shot `/health` from the command line.
pub async fn run_health(cfg: AppConfig, pairs: Vec<MarketPair>, store: Arc<SqliteStore>) -> Result<()> {
    let engine = build_engine(&cfg, pairs, store)?;
    let report = engine.healthcheck.health().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One-shot `/simulate` from the command line.
pub async fn run_simulate(
    cfg: AppConfig,
    pairs: Vec<MarketPair>,
    store: Arc<SqliteStore>,
    pair_id: &str,
    size: Option<rust_decimal::Decimal>,
) -> Result<()> {
    let engine = build_engine(&cfg, pairs, store)?;
    let run = engine.healthcheck.simulate(pair_id, size).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "id": run.id,
            "pair_id": run.pair_id,
            "size": run.size.to_string(),
            "expected_pnl": run.expected_pnl.to_string(),
            "plan": run.plan,
        }))?
    );
    Ok(())
}

fn pair_entry_size(cfg: &AppConfig, pair_id: &str) -> rust_decimal::Decimal {
    cfg.market_pairs
        .iter()
        .find(|pair| pair.pair_id == pair_id)
        .and_then(|pair| pair.entry_size)
        .unwrap_or(cfg.market_hedge_mode.entry_size)
}
