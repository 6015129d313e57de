//! Fill reconciliation across heterogeneous sources.
//!
//! Each venue delivers fills over a push stream (websocket), a pull loop
//! (REST polling of open orders), or both. The reconciler merges them into
//! one canonical, deduplicated, monotonic fill stream per order.
//!
//! The cumulative-filled watermark is the single monotonic guard: a fill is
//! emitted only for the positive delta above the persisted watermark, so no
//! emission can ever decrease `filled_size` or push it past the requested
//! size, regardless of source interleaving.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hedgerow_core::{ClientOrderId, Fill, Incident, Size, Venue, VenueOrderId};
use hedgerow_store::Store;
use hedgerow_venue::{AccountLimiter, VenueAdapter, VenueFill, VenueOrder};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::telemetry::Telemetry;
use crate::ShutdownSignal;

/// Orders the reconciler watches. Implemented by [`Reconciler`]; consumed by
/// the order manager when resting orders are acked or retired.
pub trait FillTracking: Send + Sync {
    fn track(
        &self,
        venue: Venue,
        venue_order_id: VenueOrderId,
        client_order_id: ClientOrderId,
        requested_size: Size,
    );

    fn untrack(&self, venue: &Venue, venue_order_id: &str);
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Bounded dedup cache; size it at 10x the expected open-order count.
    pub lru_capacity: usize,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Silence on every source beyond this flags a stale order.
    pub stale_threshold: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 1024,
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(30),
        }
    }
}

struct TrackedOrder {
    client_order_id: ClientOrderId,
    requested_size: Size,
    /// Largest cumulative size already emitted as canonical fills.
    watermark: Size,
    last_event: Instant,
    stale_flagged: bool,
}

/// Bounded insert-once cache absorbing websocket replays and overlapping
/// polls.
struct FillKeyCache {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl FillKeyCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when the key was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    cfg: ReconcilerConfig,
    tx: mpsc::Sender<Fill>,
    tracked: Mutex<HashMap<(Venue, VenueOrderId), TrackedOrder>>,
    seen: Mutex<FillKeyCache>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        telemetry: Arc<dyn Telemetry>,
        cfg: ReconcilerConfig,
        tx: mpsc::Sender<Fill>,
    ) -> Self {
        let mut cache = FillKeyCache::new(cfg.lru_capacity);
        // Warm the cache so a restart does not replay recently stored fills.
        if let Ok(keys) = store.recent_fill_keys(cfg.lru_capacity) {
            for key in keys.into_iter().rev() {
                cache.insert(key);
            }
        }
        Self {
            store,
            telemetry,
            cfg,
            tx,
            tracked: Mutex::new(HashMap::new()),
            seen: Mutex::new(cache),
        }
    }

    /// Consume one push fill event.
    pub async fn ingest_push(&self, event: VenueFill) {
        // Exact keys when the venue assigns fill ids, sequence keys as a
        // fallback; orders without either rely on the watermark alone.
        let dedup_key = match (&event.fill_id, event.seq) {
            (Some(fill_id), _) => Some(format!(
                "{}:{}:{fill_id}",
                event.venue, event.venue_order_id
            )),
            (None, Some(seq)) => Some(format!(
                "{}:{}:seq:{seq}",
                event.venue, event.venue_order_id
            )),
            (None, None) => None,
        };
        if let Some(key) = dedup_key {
            if !self.seen.lock().unwrap().insert(key) {
                self.telemetry.fill_duplicate();
                debug!(
                    venue = %event.venue,
                    venue_order_id = %event.venue_order_id,
                    "duplicate push fill dropped"
                );
                return;
            }
        }
        let emit = self.advance_watermark(
            &event.venue,
            &event.venue_order_id,
            WatermarkAdvance::Delta(event.size),
        );
        let Some((client_order_id, delta)) = emit else {
            return;
        };
        let fill = Fill {
            venue: event.venue.clone(),
            venue_order_id: event.venue_order_id.clone(),
            fill_id: event.fill_id.clone(),
            client_order_id: Some(client_order_id),
            market_id: event.market_id.clone(),
            side: event.side,
            price: event.price,
            size: delta,
            ts: event.ts,
        };
        self.emit(fill).await;
    }

    /// Diff one polling sweep against the per-order watermarks, emitting
    /// synthetic fills for the observed increments.
    pub async fn ingest_poll(&self, venue: &Venue, orders: &[VenueOrder]) {
        for order in orders {
            let emit = self.advance_watermark(
                venue,
                &order.venue_order_id,
                WatermarkAdvance::Cumulative(order.filled_size),
            );
            let Some((client_order_id, delta)) = emit else {
                continue;
            };
            let fill = Fill {
                venue: venue.clone(),
                venue_order_id: order.venue_order_id.clone(),
                fill_id: None,
                client_order_id: Some(client_order_id),
                market_id: order.market_id.clone(),
                side: order.side,
                // Polling reports no execution price; the resting limit
                // price is the best available estimate.
                price: order.price.unwrap_or(Decimal::ZERO),
                size: delta,
                ts: order.updated_at,
            };
            self.emit(fill).await;
        }
    }

    /// Spawn the websocket pump for one (venue, account). Reconnects with a
    /// fixed pause until shutdown.
    pub fn spawn_push_task(
        self: &Arc<Self>,
        adapter: Arc<dyn VenueAdapter>,
        account: String,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            while !shutdown.triggered() {
                match adapter.subscribe_fills(&account).await {
                    Ok(mut rx) => loop {
                        tokio::select! {
                            event = rx.recv() => match event {
                                Some(event) => reconciler.ingest_push(event).await,
                                None => {
                                    warn!(venue = %adapter.venue(), "fill stream closed");
                                    break;
                                }
                            },
                            _ = shutdown.wait() => return,
                        }
                    },
                    Err(err) => {
                        warn!(venue = %adapter.venue(), error = %err, "fill subscription failed");
                    }
                }
                if !shutdown.sleep(Duration::from_secs(5)).await {
                    return;
                }
            }
        })
    }

    /// Spawn the REST polling loop for one (venue, account). The interval is
    /// per venue; venues without websocket support rely on this loop alone.
    pub fn spawn_poll_task(
        self: &Arc<Self>,
        adapter: Arc<dyn VenueAdapter>,
        account: String,
        limiter: Option<AccountLimiter>,
        poll_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let venue = adapter.venue();
            while shutdown.sleep(poll_interval).await {
                if let Some(limiter) = &limiter {
                    limiter.acquire().await;
                }
                let sweep = tokio::time::timeout(
                    reconciler.cfg.poll_timeout,
                    adapter.fetch_open_orders(&account),
                )
                .await;
                match sweep {
                    Ok(Ok(orders)) => reconciler.ingest_poll(&venue, &orders).await,
                    Ok(Err(err)) => {
                        debug!(%venue, error = %err, "open order poll failed");
                    }
                    Err(_) => {
                        debug!(%venue, "open order poll timed out");
                    }
                }
                reconciler.flag_stale_orders(&venue);
            }
        })
    }

    /// Raise `STALE_FILL_SOURCE` once per order whose sources have been
    /// silent beyond the threshold; processing continues either way.
    fn flag_stale_orders(&self, venue: &Venue) {
        let mut stale = Vec::new();
        {
            let mut tracked = self.tracked.lock().unwrap();
            for ((order_venue, venue_order_id), entry) in tracked.iter_mut() {
                if order_venue == venue
                    && !entry.stale_flagged
                    && entry.last_event.elapsed() >= self.cfg.stale_threshold
                {
                    entry.stale_flagged = true;
                    stale.push((venue_order_id.clone(), entry.client_order_id.clone()));
                }
            }
        }
        for (venue_order_id, client_order_id) in stale {
            let incident = Incident::warning(
                "STALE_FILL_SOURCE",
                json!({
                    "venue": venue.as_str(),
                    "venue_order_id": venue_order_id,
                    "client_order_id": client_order_id,
                    "threshold_ms": self.cfg.stale_threshold.as_millis() as u64,
                }),
            );
            self.telemetry.incident(incident.level);
            if let Err(err) = self.store.record_incident(&incident) {
                warn!(error = %err, "failed to record stale source incident");
            }
        }
    }

    fn advance_watermark(
        &self,
        venue: &Venue,
        venue_order_id: &str,
        advance: WatermarkAdvance,
    ) -> Option<(ClientOrderId, Size)> {
        let (client_order_id, new_mark, delta) = {
            let mut tracked = self.tracked.lock().unwrap();
            let entry = match tracked.get_mut(&(venue.clone(), venue_order_id.to_string())) {
                Some(entry) => entry,
                None => {
                    debug!(%venue, venue_order_id, "fill event for untracked order");
                    return None;
                }
            };
            entry.last_event = Instant::now();
            entry.stale_flagged = false;
            let candidate = match advance {
                WatermarkAdvance::Delta(size) => entry.watermark + size,
                WatermarkAdvance::Cumulative(total) => total,
            };
            let clamped = candidate.min(entry.requested_size);
            if clamped <= entry.watermark {
                return None;
            }
            let delta = clamped - entry.watermark;
            entry.watermark = clamped;
            (entry.client_order_id.clone(), clamped, delta)
        };
        if let Err(err) = self
            .store
            .save_fill_watermark(venue, venue_order_id, new_mark)
        {
            warn!(error = %err, venue_order_id, "failed to persist watermark");
        }
        Some((client_order_id, delta))
    }

    async fn emit(&self, fill: Fill) {
        if self.tx.send(fill).await.is_err() {
            warn!("fill channel closed; dropping fill");
        }
    }
}

enum WatermarkAdvance {
    /// A push event reporting one incremental fill.
    Delta(Size),
    /// A poll sweep reporting the venue's cumulative filled size.
    Cumulative(Size),
}

impl FillTracking for Reconciler {
    fn track(
        &self,
        venue: Venue,
        venue_order_id: VenueOrderId,
        client_order_id: ClientOrderId,
        requested_size: Size,
    ) {
        // Resume from the persisted watermark so a restart never re-emits.
        let watermark = self
            .store
            .fill_watermark(&venue, &venue_order_id)
            .ok()
            .flatten()
            .unwrap_or(Decimal::ZERO);
        self.tracked.lock().unwrap().insert(
            (venue, venue_order_id),
            TrackedOrder {
                client_order_id,
                requested_size,
                watermark,
                last_event: Instant::now(),
                stale_flagged: false,
            },
        );
    }

    fn untrack(&self, venue: &Venue, venue_order_id: &str) {
        self.tracked
            .lock()
            .unwrap()
            .remove(&(venue.clone(), venue_order_id.to_string()));
    }
}
