//! Per-pair control loop: evaluate spreads, gate entries, drive the order
//! manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hedgerow_core::{
    BookSnapshot, FeeSchedule, Fill, Incident, MarketPair, OrderRole, OrderSpec, OrderType, Side,
    Size, SpreadAnalyzer, SpreadOutcome, SpreadParams, TimeInForce, Venue,
};
use hedgerow_store::Store;
use hedgerow_venue::VenueAdapter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hedger::Hedger;
use crate::manager::OrderManager;
use crate::telemetry::Telemetry;
use crate::{EngineError, EngineResult, ShutdownSignal};

/// Shared per-pair status visible to the control surface.
#[derive(Debug, Default)]
pub struct PairStatus {
    disabled: AtomicBool,
    last_fill: Mutex<Option<DateTime<Utc>>>,
}

impl PairStatus {
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn note_fill(&self, ts: DateTime<Utc>) {
        *self.last_fill.lock().unwrap() = Some(ts);
    }

    #[must_use]
    pub fn last_fill(&self) -> Option<DateTime<Utc>> {
        *self.last_fill.lock().unwrap()
    }
}

/// Registry of every configured pair's status, shared between controllers,
/// the fill router and the control surface.
#[derive(Default)]
pub struct PairRegistry {
    pairs: Mutex<HashMap<String, Arc<PairStatus>>>,
}

impl PairRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, pair_id: &str) -> Arc<PairStatus> {
        let mut pairs = self.pairs.lock().unwrap();
        pairs
            .entry(pair_id.to_string())
            .or_insert_with(|| Arc::new(PairStatus::default()))
            .clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, bool, Option<DateTime<Utc>>)> {
        let pairs = self.pairs.lock().unwrap();
        let mut rows: Vec<_> = pairs
            .iter()
            .map(|(pair_id, status)| {
                (pair_id.clone(), status.is_disabled(), status.last_fill())
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[derive(Clone, Debug)]
pub struct PairControllerConfig {
    /// Target entry size in contracts.
    pub entry_size: Size,
    pub min_spread_for_entry: Decimal,
    /// Pull the resting entry once the spread decays below this.
    pub cancel_spread: Decimal,
    pub max_order_age: Duration,
    pub poll_interval: Duration,
    pub book_timeout: Duration,
    pub double_limit_enabled: bool,
    /// Fee applied to the resting entry leg.
    pub primary_fee: FeeSchedule,
    /// Fee applied to the crossing hedge leg.
    pub secondary_fee: FeeSchedule,
}

impl Default for PairControllerConfig {
    fn default() -> Self {
        Self {
            entry_size: Decimal::from(10u8),
            min_spread_for_entry: Decimal::ZERO,
            cancel_spread: Decimal::ZERO,
            max_order_age: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            book_timeout: Duration::from_secs(2),
            double_limit_enabled: false,
            primary_fee: FeeSchedule::default(),
            secondary_fee: FeeSchedule::default(),
        }
    }
}

/// One control loop per market pair. Ticks on `poll_interval`; a tick that
/// overlaps its predecessor exits early instead of queueing.
pub struct PairController {
    pair: MarketPair,
    cfg: PairControllerConfig,
    analyzer: SpreadAnalyzer,
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    manager: Arc<OrderManager>,
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    status: Arc<PairStatus>,
    tick_guard: tokio::sync::Mutex<()>,
}

impl PairController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: MarketPair,
        cfg: PairControllerConfig,
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        manager: Arc<OrderManager>,
        store: Arc<dyn Store>,
        telemetry: Arc<dyn Telemetry>,
        status: Arc<PairStatus>,
    ) -> Self {
        Self {
            pair,
            cfg,
            analyzer: SpreadAnalyzer,
            adapters,
            manager,
            store,
            telemetry,
            status,
            tick_guard: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn pair_id(&self) -> &str {
        &self.pair.pair_id
    }

    /// Run the loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        info!(pair_id = %self.pair.pair_id, "pair controller started");
        while shutdown.sleep(self.cfg.poll_interval).await {
            if self.status.is_disabled() {
                continue;
            }
            if let Err(err) = self.tick().await {
                match &err {
                    EngineError::Venue(venue_err) if venue_err.is_transient() => {
                        debug!(pair_id = %self.pair.pair_id, error = %err, "tick skipped");
                    }
                    EngineError::RiskDenied(_) => {
                        debug!(pair_id = %self.pair.pair_id, error = %err, "entry denied");
                    }
                    _ => {
                        error!(pair_id = %self.pair.pair_id, error = %err, "pair tick failed");
                        let incident = Incident::error(
                            "pair_tick_failed",
                            json!({
                                "pair_id": self.pair.pair_id,
                                "error": err.to_string(),
                            }),
                        );
                        self.telemetry.incident(incident.level);
                        if let Err(store_err) = self.store.record_incident(&incident) {
                            warn!(error = %store_err, "failed to record tick incident");
                        }
                    }
                }
            }
        }
        info!(pair_id = %self.pair.pair_id, "pair controller stopped");
    }

    /// One evaluation pass. Reentrancy-safe: overlapping ticks exit early.
    pub async fn tick(&self) -> EngineResult<()> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!(pair_id = %self.pair.pair_id, "tick overlapped; skipping");
            return Ok(());
        };

        let (primary_book, secondary_book) = self.fetch_books().await?;
        let outcome = self.analyzer.evaluate(
            &primary_book,
            &secondary_book,
            SpreadParams {
                notional: self.cfg.entry_size,
                entry_side: Side::Buy,
                primary_fee: self.cfg.primary_fee.maker,
                secondary_fee: self.cfg.secondary_fee.taker,
            },
        );
        let report = match outcome {
            SpreadOutcome::NoQuote => {
                debug!(pair_id = %self.pair.pair_id, "no quote on one side");
                return Ok(());
            }
            SpreadOutcome::Quote(report) => report,
        };
        self.telemetry
            .spread_observed(&self.pair.pair_id, report.net_spread.to_f64().unwrap_or(0.0));

        if let Some(live) = self.manager.live_entry(&self.pair.pair_id) {
            let age = Utc::now().signed_duration_since(live.created_at);
            let too_old = age.to_std().map(|age| age > self.cfg.max_order_age).unwrap_or(false);
            if report.net_spread < self.cfg.cancel_spread || too_old {
                info!(
                    pair_id = %self.pair.pair_id,
                    client_order_id = %live.client_order_id,
                    net_spread = %report.net_spread,
                    too_old,
                    "pulling resting entry"
                );
                self.manager.cancel(&live.client_order_id).await?;
            }
            return Ok(());
        }

        if report.net_spread < self.cfg.min_spread_for_entry {
            return Ok(());
        }
        let size = self.cfg.entry_size.min(report.executable_size);
        if size <= Decimal::ZERO {
            return Ok(());
        }

        let entry_price = primary_book
            .best_ask()
            .map(|level| level.price)
            .ok_or_else(|| EngineError::InvalidState("entry book lost its ask".into()))?;
        let primary_spec = OrderSpec {
            venue: self.pair.primary.venue.clone(),
            account_id: self.pair.primary.account_id.clone(),
            market_id: self.pair.primary.market_id.clone(),
            pair_id: self.pair.pair_id.clone(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(entry_price),
            size,
            time_in_force: Some(TimeInForce::GoodTilCancelled),
            role: OrderRole::Primary,
            parent_fill_id: None,
        };

        if self.cfg.double_limit_enabled {
            let exit_price = secondary_book
                .best_bid()
                .map(|level| level.price)
                .ok_or_else(|| EngineError::InvalidState("exit book lost its bid".into()))?;
            let secondary_spec = OrderSpec {
                venue: self.pair.secondary.venue.clone(),
                account_id: self.pair.secondary.account_id.clone(),
                market_id: self.pair.secondary.market_id.clone(),
                pair_id: self.pair.pair_id.clone(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                price: Some(exit_price),
                size,
                time_in_force: Some(TimeInForce::GoodTilCancelled),
                role: OrderRole::DoubleB,
                parent_fill_id: None,
            };
            let (cid_a, cid_b) = self
                .manager
                .place_double_limit(primary_spec, secondary_spec)
                .await?;
            info!(
                pair_id = %self.pair.pair_id,
                %cid_a,
                cid_b = cid_b.as_deref().unwrap_or("-"),
                net_spread = %report.net_spread,
                "double limit entry placed"
            );
        } else {
            let placement = self
                .manager
                .place(primary_spec, report.primary_slippage)
                .await?;
            info!(
                pair_id = %self.pair.pair_id,
                client_order_id = %placement.client_order_id,
                price = %entry_price,
                %size,
                net_spread = %report.net_spread,
                "entry placed"
            );
        }
        Ok(())
    }

    async fn fetch_books(&self) -> EngineResult<(BookSnapshot, BookSnapshot)> {
        let primary = self.adapter(&self.pair.primary.venue)?;
        let secondary = self.adapter(&self.pair.secondary.venue)?;
        let (primary_book, secondary_book) = tokio::join!(
            tokio::time::timeout(
                self.cfg.book_timeout,
                primary.fetch_book(&self.pair.primary.market_id),
            ),
            tokio::time::timeout(
                self.cfg.book_timeout,
                secondary.fetch_book(&self.pair.secondary.market_id),
            ),
        );
        let primary_book = primary_book
            .map_err(|_| hedgerow_venue::VenueError::Transient("book fetch deadline".into()))??;
        let secondary_book = secondary_book
            .map_err(|_| hedgerow_venue::VenueError::Transient("book fetch deadline".into()))??;
        Ok((primary_book, secondary_book))
    }

    fn adapter(&self, venue: &Venue) -> EngineResult<Arc<dyn VenueAdapter>> {
        self.adapters
            .get(venue)
            .cloned()
            .ok_or_else(|| EngineError::UnknownVenue(venue.to_string()))
    }
}

/// Route canonical fills from the reconciler into the order manager, then
/// hand entry fills to the hedger. One task per outstanding hedge placement.
pub fn spawn_fill_router(
    manager: Arc<OrderManager>,
    hedger: Arc<Hedger>,
    registry: Arc<PairRegistry>,
    store: Arc<dyn Store>,
    mut rx: mpsc::Receiver<Fill>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let fill = tokio::select! {
                fill = rx.recv() => match fill {
                    Some(fill) => fill,
                    None => break,
                },
                _ = shutdown.wait() => break,
            };
            match manager.on_fill(&fill).await {
                Ok(Some(directive)) => {
                    registry
                        .status(&directive.entry.pair_id)
                        .note_fill(fill.ts);
                    let hedger = hedger.clone();
                    tokio::spawn(async move {
                        if let Err(err) = hedger.on_entry_fill(directive).await {
                            warn!(error = %err, "hedge placement failed");
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    // A fill the engine cannot reconcile with its own state
                    // is an invariant breach: disable the pair.
                    error!(error = %err, venue_order_id = %fill.venue_order_id, "fill routing failed");
                    if let Some(pair_id) = fill
                        .client_order_id
                        .as_deref()
                        .and_then(|cid| manager.pair_for_order(cid))
                    {
                        registry.status(&pair_id).disable();
                    }
                    let incident = Incident::critical(
                        "fill_routing_failed",
                        json!({
                            "venue": fill.venue.as_str(),
                            "venue_order_id": fill.venue_order_id,
                            "error": err.to_string(),
                        }),
                    );
                    let _ = store.record_incident(&incident);
                }
            }
        }
    })
}
