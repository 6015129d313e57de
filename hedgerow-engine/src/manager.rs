//! Order placement, cancellation and the double-limit coupled-order
//! protocol.
//!
//! The manager owns every order state machine. All lifecycle events funnel
//! through [`OrderManager::apply_event`], which appends the event-log row
//! before the in-memory state moves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hedgerow_core::{
    ClientOrderId, DoubleLimit, DoubleLimitState, Fill, Incident, MarketPair, Order, OrderRole,
    OrderSpec, OrderStatus, OrderType, Price, Venue, VenueOrderId,
};
use hedgerow_store::Store;
use hedgerow_venue::{PlaceAck, VenueAdapter, VenueError};
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountPool;
use crate::fsm::{OrderEvent, OrderFsm, Transition};
use crate::hedger::HedgeDirective;
use crate::reconciler::FillTracking;
use crate::risk::{ProposedOrder, RiskManager, Verdict};
use crate::telemetry::Telemetry;
use crate::{EngineError, EngineResult, ShutdownSignal};

#[derive(Clone, Debug)]
pub struct OrderManagerConfig {
    pub dry_run: bool,
    pub double_limit_enabled: bool,
    /// Attempts per network operation, transient failures only.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub place_timeout: Duration,
    pub cancel_timeout: Duration,
    /// Resting orders older than this are expired and pulled.
    pub max_order_age: Option<Duration>,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            double_limit_enabled: false,
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(4),
            place_timeout: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(5),
            max_order_age: Some(Duration::from_secs(60)),
        }
    }
}

/// Lightweight status row mirrored out of each state machine so read paths
/// never contend with the per-order locks.
#[derive(Clone, Debug)]
pub struct OrderDigest {
    pub client_order_id: ClientOrderId,
    pub pair_id: String,
    pub venue: Venue,
    pub role: OrderRole,
    pub status: OrderStatus,
    pub dry_run: bool,
    pub created_at: chrono::DateTime<Utc>,
}

/// Result of a placement: the assigned client id plus whatever executed
/// inside the ack (market/IOC orders settle immediately on most venues).
#[derive(Clone, Debug)]
pub struct Placement {
    pub client_order_id: ClientOrderId,
    pub filled_size: Decimal,
    pub avg_price: Option<Price>,
}

pub struct OrderManager {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<dyn Store>,
    risk: RiskManager,
    accounts: Arc<AccountPool>,
    pairs: HashMap<String, MarketPair>,
    telemetry: Arc<dyn Telemetry>,
    tracking: Option<Arc<dyn FillTracking>>,
    cfg: OrderManagerConfig,
    shutdown: ShutdownSignal,
    slots: Mutex<HashMap<ClientOrderId, Arc<AsyncMutex<OrderFsm>>>>,
    digests: Mutex<HashMap<ClientOrderId, OrderDigest>>,
    by_venue_order: Mutex<HashMap<(Venue, VenueOrderId), ClientOrderId>>,
    dl_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    age_timers: Mutex<HashMap<ClientOrderId, JoinHandle<()>>>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        store: Arc<dyn Store>,
        risk: RiskManager,
        accounts: Arc<AccountPool>,
        pairs: Vec<MarketPair>,
        telemetry: Arc<dyn Telemetry>,
        tracking: Option<Arc<dyn FillTracking>>,
        cfg: OrderManagerConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            adapters,
            store,
            risk,
            accounts,
            pairs: pairs
                .into_iter()
                .map(|pair| (pair.pair_id.clone(), pair))
                .collect(),
            telemetry,
            tracking,
            cfg,
            shutdown,
            slots: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
            by_venue_order: Mutex::new(HashMap::new()),
            dl_locks: Mutex::new(HashMap::new()),
            age_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Place an order. The `NEW` row is persisted before the risk gate and
    /// before any network call, so a crash mid-placement is recoverable.
    pub async fn place(
        self: &Arc<Self>,
        spec: OrderSpec,
        predicted_slippage: Decimal,
    ) -> EngineResult<Placement> {
        let client_order_id = next_client_order_id(&spec.pair_id, spec.role);
        self.place_with_client_id(spec, client_order_id, predicted_slippage)
            .await
    }

    async fn place_with_client_id(
        self: &Arc<Self>,
        spec: OrderSpec,
        client_order_id: ClientOrderId,
        predicted_slippage: Decimal,
    ) -> EngineResult<Placement> {
        let adapter = self.adapter(&spec.venue)?.clone();
        let account = self
            .accounts
            .handle(&spec.account_id)
            .ok_or_else(|| EngineError::UnknownAccount(spec.account_id.clone()))?;
        let order = Order::from_spec(&spec, client_order_id.clone(), self.cfg.dry_run);
        self.store.upsert_order(&order)?;
        let fsm = Arc::new(AsyncMutex::new(OrderFsm::new(order)));
        self.slots
            .lock()
            .unwrap()
            .insert(client_order_id.clone(), fsm.clone());
        self.refresh_digest_blocking(&fsm).await;

        let notional = spec.price.unwrap_or(Decimal::ZERO) * spec.size;
        let balance = if self.cfg.dry_run {
            // Synthetic runs never touch the venue.
            self.risk.limits().exposure_cap
        } else {
            account.limiter.acquire().await;
            self.with_retries("fetch_balance", || adapter.fetch_balance(&spec.account_id))
                .await?
        };
        let state = self
            .accounts
            .state_for(&spec.account_id, &spec.pair_id, balance);
        let proposed = ProposedOrder {
            pair_id: spec.pair_id.clone(),
            notional,
            predicted_slippage,
        };
        if let Verdict::Deny(reason) = self.risk.evaluate(&state, &proposed, Utc::now()) {
            debug!(%client_order_id, %reason, "risk denied placement");
            self.apply_event(
                &fsm,
                &client_order_id,
                &OrderEvent::PlaceRejected {
                    reason: reason.to_string(),
                },
            )
            .await?;
            return Err(EngineError::RiskDenied(reason));
        }
        self.accounts
            .reserve(&spec.account_id, &spec.pair_id, notional);

        self.apply_event(&fsm, &client_order_id, &OrderEvent::PlaceSubmitted)
            .await?;

        let ack = if self.cfg.dry_run {
            PlaceAck {
                venue_order_id: format!("dry-{client_order_id}"),
                filled_size: None,
                avg_price: None,
                raw: Some(json!({ "synthetic": true })),
            }
        } else {
            let attempt = self
                .with_retries("place", || {
                    let adapter = adapter.clone();
                    let spec = spec.clone();
                    let cid = client_order_id.clone();
                    let account = account.clone();
                    async move {
                        account.limiter.acquire().await;
                        match tokio::time::timeout(
                            self.cfg.place_timeout,
                            adapter.place(&spec.account_id, &cid, &spec),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(VenueError::Transient("place deadline exceeded".into())),
                        }
                    }
                })
                .await;
            match attempt {
                Ok(ack) => ack,
                Err(err) => {
                    self.fail_placement(&fsm, &client_order_id, &spec, notional, &err)
                        .await?;
                    return Err(err);
                }
            }
        };

        self.apply_event(
            &fsm,
            &client_order_id,
            &OrderEvent::PlaceAcked {
                venue_order_id: ack.venue_order_id.clone(),
            },
        )
        .await?;
        self.by_venue_order.lock().unwrap().insert(
            (spec.venue.clone(), ack.venue_order_id.clone()),
            client_order_id.clone(),
        );
        self.telemetry.order_placed();
        info!(
            %client_order_id,
            venue = %spec.venue,
            market_id = %spec.market_id,
            side = spec.side.as_str(),
            role = spec.role.as_str(),
            dry_run = self.cfg.dry_run,
            "order placed"
        );

        // IOC/market placements settle inside the ack.
        if spec.order_type == OrderType::Market && !self.cfg.dry_run {
            self.settle_from_ack(&fsm, &client_order_id, &spec, &ack)
                .await?;
        } else if spec.order_type == OrderType::Limit && !self.cfg.dry_run {
            if let Some(tracking) = &self.tracking {
                tracking.track(
                    spec.venue.clone(),
                    ack.venue_order_id.clone(),
                    client_order_id.clone(),
                    spec.size,
                );
            }
            self.schedule_age_timer(&client_order_id);
        }
        Ok(Placement {
            client_order_id,
            filled_size: ack.filled_size.unwrap_or(Decimal::ZERO),
            avg_price: ack.avg_price,
        })
    }

    /// Cancel an order. Terminal and not-yet-acked orders are a no-op.
    pub async fn cancel(self: &Arc<Self>, client_order_id: &str) -> EngineResult<()> {
        let fsm = self
            .slot(client_order_id)
            .ok_or_else(|| EngineError::UnknownOrder(client_order_id.into()))?;
        let (venue, venue_order_id, market_id, account_id, dry_run) = {
            let guard = fsm.lock().await;
            let order = guard.order();
            if !matches!(order.status, OrderStatus::Live | OrderStatus::Partial) {
                debug!(%client_order_id, status = order.status.as_str(), "cancel no-op");
                return Ok(());
            }
            (
                order.venue.clone(),
                order.venue_order_id.clone(),
                order.market_id.clone(),
                order.account_id.clone(),
                order.dry_run,
            )
        };
        let Some(venue_order_id) = venue_order_id else {
            return Ok(());
        };
        self.apply_event(&fsm, client_order_id, &OrderEvent::CancelRequested)
            .await?;

        if dry_run {
            self.apply_event(&fsm, client_order_id, &OrderEvent::CancelAcked)
                .await?;
            self.finish_order(client_order_id, &venue, &venue_order_id)
                .await;
            return Ok(());
        }

        let adapter = self.adapter(&venue)?.clone();
        let account = self.accounts.handle(&account_id);
        let result = self
            .with_retries("cancel", || {
                let adapter = adapter.clone();
                let venue_order_id = venue_order_id.clone();
                let market_id = market_id.clone();
                let account_id = account_id.clone();
                let limiter = account.clone();
                async move {
                    if let Some(handle) = &limiter {
                        handle.limiter.acquire().await;
                    }
                    match tokio::time::timeout(
                        self.cfg.cancel_timeout,
                        adapter.cancel(&account_id, &venue_order_id, &market_id),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(VenueError::Transient("cancel deadline exceeded".into())),
                    }
                }
            })
            .await;
        match result {
            Ok(()) => {
                self.apply_event(&fsm, client_order_id, &OrderEvent::CancelAcked)
                    .await?;
                self.telemetry.order_cancelled();
                info!(%client_order_id, %venue, "order cancelled");
                self.finish_order(client_order_id, &venue, &venue_order_id)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.apply_event(
                    &fsm,
                    client_order_id,
                    &OrderEvent::CancelRejected {
                        reason: err.to_string(),
                    },
                )
                .await?;
                self.store.record_incident(&Incident::warning(
                    "cancel_failure",
                    json!({
                        "client_order_id": client_order_id,
                        "venue": venue.as_str(),
                        "error": err.to_string(),
                        "attempts": self.cfg.max_retries,
                    }),
                ))?;
                self.finish_order(client_order_id, &venue, &venue_order_id)
                    .await;
                Err(err)
            }
        }
    }

    /// Place both legs of a double limit. The `ARMED` row with both client
    /// ids is persisted before either placement; a failed leg best-effort
    /// cancels its sibling and marks the record `FAILED`.
    ///
    /// With `double_limit_enabled = false` only leg A is placed.
    pub async fn place_double_limit(
        self: &Arc<Self>,
        mut spec_a: OrderSpec,
        mut spec_b: OrderSpec,
    ) -> EngineResult<(ClientOrderId, Option<ClientOrderId>)> {
        if !self.cfg.double_limit_enabled {
            let placement = self.place(spec_a, Decimal::ZERO).await?;
            return Ok((placement.client_order_id, None));
        }
        spec_a.role = OrderRole::DoubleA;
        spec_b.role = OrderRole::DoubleB;
        let pair_key = spec_a.pair_id.clone();
        let cid_a = next_client_order_id(&spec_a.pair_id, OrderRole::DoubleA);
        let cid_b = next_client_order_id(&spec_b.pair_id, OrderRole::DoubleB);
        let record = DoubleLimit {
            id: Uuid::new_v4().simple().to_string(),
            pair_key,
            order_a_ref: cid_a.clone(),
            order_b_ref: cid_b.clone(),
            venue_a: spec_a.venue.clone(),
            venue_b: spec_b.venue.clone(),
            state: DoubleLimitState::Armed,
            triggered_order_id: None,
            cancelled_order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_double_limit(&record)?;

        let placed_a = self
            .place_with_client_id(spec_a, cid_a.clone(), Decimal::ZERO)
            .await;
        if let Err(err) = placed_a {
            self.store.update_double_limit_state(
                &record.id,
                DoubleLimitState::Failed,
                None,
                None,
            )?;
            return Err(err);
        }
        let placed_b = self
            .place_with_client_id(spec_b, cid_b.clone(), Decimal::ZERO)
            .await;
        if let Err(err) = placed_b {
            warn!(record_id = %record.id, error = %err, "double limit leg B failed; pulling leg A");
            if let Err(cancel_err) = self.cancel(&cid_a).await {
                warn!(%cid_a, error = %cancel_err, "cleanup cancel failed");
            }
            self.store.update_double_limit_state(
                &record.id,
                DoubleLimitState::Failed,
                None,
                None,
            )?;
            return Err(err);
        }
        info!(record_id = %record.id, %cid_a, %cid_b, "double limit armed");
        Ok((cid_a, Some(cid_b)))
    }

    /// Route a canonical fill into its state machine. For a double-limit leg
    /// the sibling cancel is issued before the hedge directive is returned,
    /// minimizing the double-exposure window.
    pub async fn on_fill(self: &Arc<Self>, fill: &Fill) -> EngineResult<Option<HedgeDirective>> {
        let client_order_id = match self.resolve_client_id(fill) {
            Some(cid) => cid,
            None => {
                debug!(
                    venue = %fill.venue,
                    venue_order_id = %fill.venue_order_id,
                    "fill for unknown order dropped"
                );
                return Ok(None);
            }
        };
        let fsm = self
            .slot(&client_order_id)
            .ok_or_else(|| EngineError::UnknownOrder(client_order_id.clone()))?;

        let mut canonical = fill.clone();
        canonical.client_order_id = Some(client_order_id.clone());
        if !self.store.record_fill(&canonical)? {
            self.telemetry.fill_duplicate();
            return Ok(None);
        }

        let order = {
            // Per-order serialization: the FSM mutates only under this lock.
            let outcome = self
                .apply_event(
                    &fsm,
                    &client_order_id,
                    &OrderEvent::FillReceived { size: fill.size },
                )
                .await?;
            if outcome == Transition::Illegal {
                return Ok(None);
            }
            let guard = fsm.lock().await;
            guard.order().clone()
        };
        self.telemetry.fill_emitted();
        self.accounts.release_exposure(
            &order.account_id,
            order.price.unwrap_or(Decimal::ZERO) * fill.size,
        );
        if order.is_terminal() {
            if let Some(venue_order_id) = &order.venue_order_id {
                self.finish_order(&client_order_id, &order.venue, venue_order_id)
                    .await;
            }
        }

        // The filled order's lock is released before the sibling cancel;
        // cross-order work only ever holds one order lock at a time.
        if self.cfg.double_limit_enabled && order.role != OrderRole::Hedge {
            self.trigger_double_limit(&client_order_id, &order).await?;
        }

        if order.role == OrderRole::Hedge {
            return Ok(None);
        }
        let Some(pair) = self.pairs.get(&order.pair_id) else {
            return Ok(None);
        };
        let Some(target) = pair.opposing_leg(&order.venue) else {
            return Ok(None);
        };
        Ok(Some(HedgeDirective {
            fill: canonical,
            entry: order,
            target: target.clone(),
        }))
    }

    /// The live `PRIMARY` (or double-limit) entry order for a pair, if any.
    #[must_use]
    pub fn live_entry(&self, pair_id: &str) -> Option<OrderDigest> {
        let digests = self.digests.lock().unwrap();
        digests
            .values()
            .find(|digest| {
                digest.pair_id == pair_id
                    && digest.role != OrderRole::Hedge
                    && digest.status.is_open()
            })
            .cloned()
    }

    /// The pair an order belongs to, for incident attribution.
    #[must_use]
    pub fn pair_for_order(&self, client_order_id: &str) -> Option<String> {
        self.digests
            .lock()
            .unwrap()
            .get(client_order_id)
            .map(|digest| digest.pair_id.clone())
    }

    /// Open (non-terminal, non-synthetic) order digests, for `/status`.
    #[must_use]
    pub fn open_orders(&self) -> Vec<OrderDigest> {
        let digests = self.digests.lock().unwrap();
        digests
            .values()
            .filter(|digest| digest.status.is_open() && !digest.dry_run)
            .cloned()
            .collect()
    }

    /// Cancel every open order; used during shutdown. Orders that cannot be
    /// confirmed cancelled are recorded as `SHUTDOWN_INFLIGHT` incidents.
    pub async fn cancel_all_open(self: &Arc<Self>) {
        let open: Vec<OrderDigest> = {
            let digests = self.digests.lock().unwrap();
            digests
                .values()
                .filter(|digest| digest.status.is_open())
                .cloned()
                .collect()
        };
        for digest in open {
            if let Err(err) = self.cancel(&digest.client_order_id).await {
                warn!(
                    client_order_id = %digest.client_order_id,
                    error = %err,
                    "unconfirmed cancel during shutdown"
                );
                let _ = self.store.record_incident(&Incident::warning(
                    "SHUTDOWN_INFLIGHT",
                    json!({
                        "client_order_id": digest.client_order_id,
                        "venue": digest.venue.as_str(),
                        "error": err.to_string(),
                    }),
                ));
            }
        }
        let timers: Vec<JoinHandle<()>> = {
            let mut map = self.age_timers.lock().unwrap();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for timer in timers {
            timer.abort();
        }
    }

    /// Restore state machines for persisted open orders after a restart.
    pub fn recover(self: &Arc<Self>) -> EngineResult<usize> {
        let open = self.store.open_orders()?;
        let mut restored = 0;
        for order in open {
            let events = self.store.order_events(&order.client_order_id)?;
            let replayed = OrderFsm::replay(
                order.clone(),
                events
                    .iter()
                    .filter_map(|row| OrderEvent::from_stage(&row.stage, &row.payload)),
            );
            if let Some(venue_order_id) = &replayed.order().venue_order_id {
                self.by_venue_order.lock().unwrap().insert(
                    (order.venue.clone(), venue_order_id.clone()),
                    order.client_order_id.clone(),
                );
                if let Some(tracking) = &self.tracking {
                    tracking.track(
                        order.venue.clone(),
                        venue_order_id.clone(),
                        order.client_order_id.clone(),
                        order.requested_size,
                    );
                }
            }
            let digest = digest_of(replayed.order());
            self.slots.lock().unwrap().insert(
                order.client_order_id.clone(),
                Arc::new(AsyncMutex::new(replayed)),
            );
            self.digests
                .lock()
                .unwrap()
                .insert(order.client_order_id.clone(), digest);
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "restored open orders from event log");
        }
        Ok(restored)
    }

    async fn trigger_double_limit(
        self: &Arc<Self>,
        client_order_id: &str,
        order: &Order,
    ) -> EngineResult<()> {
        let Some(record) = self.store.get_double_limit_by_order(client_order_id)? else {
            return Ok(());
        };
        let lock = self.dl_lock(&record.id);
        let _guard = lock.lock().await;
        // Re-read under the record lock; the sibling may have won the race.
        let Some(latest) = self.store.get_double_limit_by_order(client_order_id)? else {
            return Ok(());
        };
        if latest.state != DoubleLimitState::Armed {
            return Ok(());
        }
        let Some((sibling, _)) = latest.sibling_of(client_order_id) else {
            return Ok(());
        };
        let sibling = sibling.clone();
        self.store.update_double_limit_state(
            &latest.id,
            DoubleLimitState::Triggered,
            Some(client_order_id),
            Some(&sibling),
        )?;
        self.store.update_double_limit_state(
            &latest.id,
            DoubleLimitState::Cancelling,
            None,
            None,
        )?;
        info!(record_id = %latest.id, triggered = %client_order_id, cancelling = %sibling, "double limit triggered");
        let cancel_result = self.cancel(&sibling).await;

        let sibling_status = self
            .digests
            .lock()
            .unwrap()
            .get(&sibling)
            .map(|digest| digest.status);
        match sibling_status {
            Some(OrderStatus::Filled) => {
                // Both legs executed: the exact double-exposure case the
                // protocol exists to prevent.
                self.store.update_double_limit_state(
                    &latest.id,
                    DoubleLimitState::Failed,
                    None,
                    None,
                )?;
                self.store.record_incident(&Incident::critical(
                    "double_limit_both_legs_filled",
                    json!({
                        "record_id": latest.id,
                        "triggered": client_order_id,
                        "sibling": sibling,
                        "pair_key": latest.pair_key,
                    }),
                ))?;
                self.accounts.begin_cooldown(
                    &order.account_id,
                    chrono::Duration::seconds(self.risk.limits().cool_down.num_seconds()),
                );
            }
            _ => {
                if cancel_result.is_ok() {
                    self.store.update_double_limit_state(
                        &latest.id,
                        DoubleLimitState::Resolved,
                        None,
                        None,
                    )?;
                }
                // On a failed cancel the record stays CANCELLING; the cancel
                // path has already logged the incident.
            }
        }
        Ok(())
    }

    async fn settle_from_ack(
        self: &Arc<Self>,
        fsm: &Arc<AsyncMutex<OrderFsm>>,
        client_order_id: &str,
        spec: &OrderSpec,
        ack: &PlaceAck,
    ) -> EngineResult<()> {
        let filled = ack.filled_size.unwrap_or(Decimal::ZERO);
        let price = ack.avg_price.unwrap_or(Decimal::ZERO);
        if filled > Decimal::ZERO {
            let fill = Fill {
                venue: spec.venue.clone(),
                venue_order_id: ack.venue_order_id.clone(),
                fill_id: Some(format!("ack-{client_order_id}")),
                client_order_id: Some(client_order_id.to_string()),
                market_id: spec.market_id.clone(),
                side: spec.side,
                price,
                size: filled,
                ts: Utc::now(),
            };
            self.store.record_fill(&fill)?;
            self.store
                .save_fill_watermark(&spec.venue, &ack.venue_order_id, filled)?;
            self.apply_event(
                fsm,
                client_order_id,
                &OrderEvent::FillReceived { size: filled },
            )
            .await?;
        }
        // The venue cancelled whatever the IOC did not execute.
        if filled < spec.size {
            self.apply_event(fsm, client_order_id, &OrderEvent::CancelRequested)
                .await?;
            self.apply_event(fsm, client_order_id, &OrderEvent::CancelAcked)
                .await?;
        }
        self.finish_order(client_order_id, &spec.venue, &ack.venue_order_id)
            .await;
        Ok(())
    }

    async fn fail_placement(
        self: &Arc<Self>,
        fsm: &Arc<AsyncMutex<OrderFsm>>,
        client_order_id: &str,
        spec: &OrderSpec,
        notional: Decimal,
        err: &EngineError,
    ) -> EngineResult<()> {
        self.telemetry.order_failed();
        self.accounts
            .close_order(&spec.account_id, &spec.pair_id, notional);
        let event = match err {
            EngineError::Venue(VenueError::Rejected(reason)) => OrderEvent::PlaceRejected {
                reason: reason.clone(),
            },
            other => OrderEvent::ErrorObserved {
                reason: other.to_string(),
            },
        };
        if self.shutdown.triggered() {
            let _ = self.store.record_incident(&Incident::warning(
                "SHUTDOWN_INFLIGHT",
                json!({
                    "client_order_id": client_order_id,
                    "venue": spec.venue.as_str(),
                    "error": err.to_string(),
                }),
            ));
        }
        self.apply_event(fsm, client_order_id, &event).await?;
        Ok(())
    }

    /// Append the event-log row, then apply the transition, then mirror the
    /// updated order back to storage. Illegal events record an incident and
    /// leave state untouched.
    async fn apply_event(
        &self,
        fsm: &Arc<AsyncMutex<OrderFsm>>,
        client_order_id: &str,
        event: &OrderEvent,
    ) -> EngineResult<Transition> {
        let mut guard = fsm.lock().await;
        match guard.next(event) {
            Transition::Illegal => {
                let incident = Incident::warning(
                    "illegal_order_transition",
                    json!({
                        "client_order_id": client_order_id,
                        "state": guard.status().as_str(),
                        "event": event.stage(),
                    }),
                );
                self.telemetry.incident(incident.level);
                self.store.record_incident(&incident)?;
                Ok(Transition::Illegal)
            }
            Transition::Discard => Ok(Transition::Discard),
            Transition::Apply(_) => {
                // Log row first so replay can always reconstruct the state.
                self.store
                    .append_order_event(client_order_id, event.stage(), &event.payload())?;
                let transition = guard.apply(event);
                self.store.upsert_order(guard.order())?;
                let digest = digest_of(guard.order());
                drop(guard);
                self.digests
                    .lock()
                    .unwrap()
                    .insert(client_order_id.to_string(), digest);
                Ok(transition)
            }
        }
    }

    async fn refresh_digest_blocking(&self, fsm: &Arc<AsyncMutex<OrderFsm>>) {
        let guard = fsm.lock().await;
        let digest = digest_of(guard.order());
        self.digests
            .lock()
            .unwrap()
            .insert(digest.client_order_id.clone(), digest);
    }

    async fn finish_order(&self, client_order_id: &str, venue: &Venue, venue_order_id: &str) {
        if let Some(tracking) = &self.tracking {
            tracking.untrack(venue, venue_order_id);
        }
        let timer = self.age_timers.lock().unwrap().remove(client_order_id);
        if let Some(handle) = timer {
            handle.abort();
        }
        // Retire the order's slot and return the unfilled remainder.
        let remaining = {
            let slot = self.slot(client_order_id);
            match slot {
                Some(fsm) => {
                    let guard = fsm.lock().await;
                    let order = guard.order();
                    (
                        order.account_id.clone(),
                        order.pair_id.clone(),
                        order.price.unwrap_or(Decimal::ZERO) * order.remaining_size(),
                    )
                }
                None => return,
            }
        };
        self.accounts
            .close_order(&remaining.0, &remaining.1, remaining.2);
    }

    fn schedule_age_timer(self: &Arc<Self>, client_order_id: &str) {
        let Some(max_age) = self.cfg.max_order_age else {
            return;
        };
        let manager = Arc::downgrade(self);
        let cid = client_order_id.to_string();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            if !shutdown.sleep(max_age).await {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let Some(fsm) = manager.slot(&cid) else {
                return;
            };
            let expired = manager
                .apply_event(&fsm, &cid, &OrderEvent::TimeoutElapsed)
                .await;
            if matches!(expired, Ok(Transition::Apply(OrderStatus::Expired))) {
                info!(client_order_id = %cid, "resting order expired");
                let (venue, venue_order_id, market_id, account_id) = {
                    let guard = fsm.lock().await;
                    let order = guard.order();
                    (
                        order.venue.clone(),
                        order.venue_order_id.clone(),
                        order.market_id.clone(),
                        order.account_id.clone(),
                    )
                };
                if let (Some(venue_order_id), Ok(adapter)) =
                    (venue_order_id, manager.adapter(&venue))
                {
                    // Best-effort venue-side cleanup of the expired order.
                    if let Err(err) =
                        adapter.cancel(&account_id, &venue_order_id, &market_id).await
                    {
                        warn!(client_order_id = %cid, error = %err, "expiry cancel failed");
                    }
                    manager.finish_order(&cid, &venue, &venue_order_id).await;
                }
            }
        });
        self.age_timers
            .lock()
            .unwrap()
            .insert(client_order_id.to_string(), handle);
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut call: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, VenueError>>,
    {
        let attempts = self.cfg.max_retries.max(1);
        let mut delay = self.cfg.backoff_base;
        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    debug!(op, attempt, error = %err, "transient venue error; backing off");
                    tokio::time::sleep(jitter(delay)).await;
                    delay = (delay * 2).min(self.cfg.backoff_cap);
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop always returns")
    }

    fn resolve_client_id(&self, fill: &Fill) -> Option<ClientOrderId> {
        if let Some(cid) = &fill.client_order_id {
            if self.slot(cid).is_some() {
                return Some(cid.clone());
            }
        }
        self.by_venue_order
            .lock()
            .unwrap()
            .get(&(fill.venue.clone(), fill.venue_order_id.clone()))
            .cloned()
    }

    fn slot(&self, client_order_id: &str) -> Option<Arc<AsyncMutex<OrderFsm>>> {
        self.slots.lock().unwrap().get(client_order_id).cloned()
    }

    fn dl_lock(&self, record_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.dl_locks.lock().unwrap();
        locks
            .entry(record_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn adapter(&self, venue: &Venue) -> EngineResult<&Arc<dyn VenueAdapter>> {
        self.adapters
            .get(venue)
            .ok_or_else(|| EngineError::UnknownVenue(venue.to_string()))
    }
}

fn digest_of(order: &Order) -> OrderDigest {
    OrderDigest {
        client_order_id: order.client_order_id.clone(),
        pair_id: order.pair_id.clone(),
        venue: order.venue.clone(),
        role: order.role,
        status: order.status,
        dry_run: order.dry_run,
        created_at: order.created_at,
    }
}

/// `{pair_id}-{role}-{millis}-{hex8}`; unique per process, generated before
/// the network call so a crash before the ack is recoverable.
fn next_client_order_id(pair_id: &str, role: OrderRole) -> ClientOrderId {
    let millis = Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{pair_id}-{}-{millis}-{}", role.tag(), &suffix[..8])
}

fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75_f64..=1.25_f64);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_ids_are_unique_and_tagged() {
        let a = next_client_order_id("ev-1", OrderRole::Primary);
        let b = next_client_order_id("ev-1", OrderRole::Primary);
        assert_ne!(a, b);
        assert!(a.starts_with("ev-1-pri-"));
        let hedge = next_client_order_id("ev-1", OrderRole::Hedge);
        assert!(hedge.contains("-hdg-"));
    }

    #[test]
    fn jitter_stays_within_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = jitter(base);
            assert!(jittered >= Duration::from_millis(750));
            assert!(jittered <= Duration::from_millis(1250));
        }
    }
}
