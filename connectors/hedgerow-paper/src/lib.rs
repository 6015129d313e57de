//! In-memory venue adapter with scripted books and scriptable fills.
//!
//! Market orders execute immediately against the scripted book and settle
//! inside the placement ack; limit orders rest until a test (or dry run)
//! reports venue-side fills through [`PaperVenue::report_fill`] or pushes
//! frames through [`PaperVenue::push_fill`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use hedgerow_core::{
    executable_vwap, AccountId, BookSnapshot, MarketId, OrderSpec, OrderType, Price, Side, Size,
    Venue, VenueOrderId,
};
use hedgerow_venue::{
    PlaceAck, VenueAdapter, VenueCapabilities, VenueError, VenueFill, VenueOrder, VenueResult,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PaperVenueConfig {
    pub venue: Venue,
    pub provides_fill_ids: bool,
    pub supports_websocket: bool,
    pub lot_step: Size,
    pub default_balance: Price,
}

impl Default for PaperVenueConfig {
    fn default() -> Self {
        Self {
            venue: Venue::new("paper"),
            provides_fill_ids: true,
            supports_websocket: true,
            lot_step: Decimal::ONE,
            default_balance: Decimal::from(10_000u32),
        }
    }
}

#[derive(Clone, Debug)]
struct RestingOrder {
    client_order_id: String,
    market_id: MarketId,
    side: Side,
    price: Option<Price>,
    size: Size,
    filled_size: Size,
}

pub struct PaperVenue {
    cfg: PaperVenueConfig,
    books: Mutex<HashMap<MarketId, BookSnapshot>>,
    resting: Mutex<HashMap<VenueOrderId, RestingOrder>>,
    balances: Mutex<HashMap<AccountId, Price>>,
    subscribers: Mutex<Vec<mpsc::Sender<VenueFill>>>,
    next_id: AtomicU64,
    /// Pending injected transient failures for retry tests.
    fail_places: AtomicU32,
    place_calls: AtomicU64,
}

impl PaperVenue {
    #[must_use]
    pub fn new(cfg: PaperVenueConfig) -> Self {
        Self {
            cfg,
            books: Mutex::new(HashMap::new()),
            resting: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_places: AtomicU32::new(0),
            place_calls: AtomicU64::new(0),
        }
    }

    /// Replace the scripted book for a market.
    pub fn set_book(&self, book: BookSnapshot) {
        self.books.lock().unwrap().insert(book.market_id.clone(), book);
    }

    pub fn set_balance(&self, account: impl Into<AccountId>, balance: Price) {
        self.balances.lock().unwrap().insert(account.into(), balance);
    }

    /// Make the next `count` placements fail with a transient error.
    pub fn fail_next_places(&self, count: u32) {
        self.fail_places.store(count, Ordering::SeqCst);
    }

    /// Number of placement calls that reached this venue.
    #[must_use]
    pub fn place_calls(&self) -> u64 {
        self.place_calls.load(Ordering::SeqCst)
    }

    /// Venue order id of the resting order with this client id, if any.
    #[must_use]
    pub fn resting_order_id(&self, client_order_id: &str) -> Option<VenueOrderId> {
        let resting = self.resting.lock().unwrap();
        resting
            .iter()
            .find(|(_, order)| order.client_order_id == client_order_id)
            .map(|(venue_order_id, _)| venue_order_id.clone())
    }

    /// Advance the venue-side cumulative filled size of a resting order, as
    /// the real venue would between two polls.
    pub fn report_fill(&self, venue_order_id: &str, cumulative: Size) {
        let mut resting = self.resting.lock().unwrap();
        if let Some(order) = resting.get_mut(venue_order_id) {
            order.filled_size = cumulative.min(order.size);
        }
    }

    /// Push one fill frame to every subscriber, as the venue websocket
    /// would. Duplicate frames are the caller's prerogative.
    pub async fn push_fill(&self, fill: VenueFill) {
        let senders: Vec<mpsc::Sender<VenueFill>> =
            self.subscribers.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(fill.clone()).await;
        }
    }

    fn next_order_id(&self) -> VenueOrderId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("p-{id}")
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn venue(&self) -> Venue {
        self.cfg.venue.clone()
    }

    fn capabilities(&self) -> VenueCapabilities {
        VenueCapabilities {
            provides_fill_ids: self.cfg.provides_fill_ids,
            supports_websocket: self.cfg.supports_websocket,
            lot_step: self.cfg.lot_step,
        }
    }

    async fn place(
        &self,
        _account: &AccountId,
        client_order_id: &str,
        spec: &OrderSpec,
    ) -> VenueResult<PlaceAck> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.fail_places.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_places.store(failures - 1, Ordering::SeqCst);
            return Err(VenueError::Transient("injected outage".into()));
        }
        let venue_order_id = self.next_order_id();
        match spec.order_type {
            OrderType::Market => {
                let books = self.books.lock().unwrap();
                let book = books
                    .get(&spec.market_id)
                    .ok_or_else(|| VenueError::Rejected(format!("no book for {}", spec.market_id)))?;
                let ladder = book.taker_ladder(spec.side);
                let outcome = executable_vwap(ladder, spec.size)
                    .ok_or_else(|| VenueError::Rejected("empty ladder".into()))?;
                debug!(
                    venue = %self.cfg.venue,
                    %venue_order_id,
                    filled = %outcome.achieved,
                    vwap = %outcome.vwap,
                    "market order executed"
                );
                Ok(PlaceAck {
                    venue_order_id,
                    filled_size: Some(outcome.achieved.min(spec.size)),
                    avg_price: Some(outcome.vwap),
                    raw: None,
                })
            }
            OrderType::Limit => {
                self.resting.lock().unwrap().insert(
                    venue_order_id.clone(),
                    RestingOrder {
                        client_order_id: client_order_id.to_string(),
                        market_id: spec.market_id.clone(),
                        side: spec.side,
                        price: spec.price,
                        size: spec.size,
                        filled_size: Decimal::ZERO,
                    },
                );
                Ok(PlaceAck {
                    venue_order_id,
                    filled_size: None,
                    avg_price: None,
                    raw: None,
                })
            }
        }
    }

    async fn cancel(
        &self,
        _account: &AccountId,
        venue_order_id: &VenueOrderId,
        _market_id: &MarketId,
    ) -> VenueResult<()> {
        let removed = self.resting.lock().unwrap().remove(venue_order_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(VenueError::Rejected(format!(
                "unknown order {venue_order_id}"
            ))),
        }
    }

    async fn fetch_book(&self, market_id: &MarketId) -> VenueResult<BookSnapshot> {
        self.books
            .lock()
            .unwrap()
            .get(market_id)
            .cloned()
            .ok_or_else(|| VenueError::Rejected(format!("no book for {market_id}")))
    }

    async fn fetch_balance(&self, account: &AccountId) -> VenueResult<Price> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(account)
            .copied()
            .unwrap_or(self.cfg.default_balance))
    }

    async fn subscribe_fills(
        &self,
        _account: &AccountId,
    ) -> VenueResult<mpsc::Receiver<VenueFill>> {
        if !self.cfg.supports_websocket {
            return Err(VenueError::Rejected(
                "venue has no websocket fill stream".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn fetch_open_orders(&self, _account: &AccountId) -> VenueResult<Vec<VenueOrder>> {
        let resting = self.resting.lock().unwrap();
        Ok(resting
            .iter()
            .map(|(venue_order_id, order)| VenueOrder {
                venue_order_id: venue_order_id.clone(),
                client_order_id: Some(order.client_order_id.clone()),
                market_id: order.market_id.clone(),
                side: order.side,
                price: order.price,
                size: order.size,
                filled_size: order.filled_size,
                status: if order.filled_size.is_zero() {
                    "open".into()
                } else {
                    "partially_filled".into()
                },
                updated_at: Utc::now(),
            })
            .collect())
    }
}

/// Convenience book builder used across tests and demos.
#[must_use]
pub fn scripted_book(
    venue: &Venue,
    market_id: &str,
    bids: &[(Price, Size)],
    asks: &[(Price, Size)],
) -> BookSnapshot {
    BookSnapshot::new(
        venue.clone(),
        market_id,
        1,
        bids.iter()
            .map(|(price, size)| hedgerow_core::Level::new(*price, *size))
            .collect(),
        asks.iter()
            .map(|(price, size)| hedgerow_core::Level::new(*price, *size))
            .collect(),
    )
    .expect("scripted book must be well-formed")
}
