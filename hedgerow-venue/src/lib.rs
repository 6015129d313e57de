//! Venue-agnostic traits used by the rest of the engine.
//!
//! Concrete REST/WebSocket clients live outside this workspace; the engine
//! only ever talks to a [`VenueAdapter`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hedgerow_core::{
    AccountId, BookSnapshot, MarketId, OrderSpec, Price, Side, Size, Venue, VenueOrderId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod limiter;

pub use governor::Quota;
pub use limiter::{AccountLimiter, LimiterError};

/// Convenience alias for adapter results.
pub type VenueResult<T> = Result<T, VenueError>;

/// Common error type returned by venue adapters.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level failure (network, timeout); safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),
    /// The venue refused the request as a business decision; never retried.
    #[error("venue rejection: {0}")]
    Rejected(String),
    /// Authentication failed or credentials are missing.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The request parameters are invalid for the target venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VenueError {
    /// Only transient failures participate in the retry policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Helper used by adapters when mapping any error type into a venue error.
    pub fn from_display(err: impl std::fmt::Display, kind: VenueErrorKind) -> Self {
        match kind {
            VenueErrorKind::Transient => Self::Transient(err.to_string()),
            VenueErrorKind::Rejected => Self::Rejected(err.to_string()),
            VenueErrorKind::Auth => Self::Auth(err.to_string()),
            VenueErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            VenueErrorKind::Serialization => Self::Serialization(err.to_string()),
        }
    }
}

/// Enumerates the broad families of venue errors.
#[derive(Debug, Clone, Copy)]
pub enum VenueErrorKind {
    Transient,
    Rejected,
    Auth,
    InvalidRequest,
    Serialization,
}

/// Static description of what a venue can do, fixed at adapter construction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueCapabilities {
    /// Whether fill events carry a venue-assigned fill id. Venues without
    /// fill ids are reconciled through cumulative-size watermarks instead.
    pub provides_fill_ids: bool,
    /// Whether a push fill stream is available at all.
    pub supports_websocket: bool,
    /// Smallest tradable size increment.
    pub lot_step: Size,
}

/// Acknowledgement returned by a successful placement.
///
/// Market and IOC placements settle inside the ack on most venues; the
/// executed size and average price ride along when the venue reports them.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaceAck {
    pub venue_order_id: VenueOrderId,
    /// Size executed immediately, for market/IOC orders.
    #[serde(default)]
    pub filled_size: Option<Size>,
    /// Average execution price of the immediate fill.
    #[serde(default)]
    pub avg_price: Option<Price>,
    /// Raw venue payload, persisted for auditability.
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

/// An open-order report returned by polling.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueOrder {
    pub venue_order_id: VenueOrderId,
    pub client_order_id: Option<String>,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Option<Price>,
    pub size: Size,
    /// Cumulative filled size as reported by the venue.
    pub filled_size: Size,
    /// Venue-native status string, not interpreted here.
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// A raw fill event delivered by a venue push stream.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueFill {
    pub venue: Venue,
    pub venue_order_id: VenueOrderId,
    pub fill_id: Option<String>,
    pub client_order_id: Option<String>,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Price,
    pub size: Size,
    /// Per-order sequence number when the venue provides ordering.
    pub seq: Option<u64>,
    pub ts: DateTime<Utc>,
}

/// The capability set the engine consumes: place, cancel, fetch book,
/// subscribe fills, fetch open orders.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// The venue this adapter talks to.
    fn venue(&self) -> Venue;

    fn capabilities(&self) -> VenueCapabilities;

    /// Place a new order; the ack carries the venue-assigned id.
    async fn place(
        &self,
        account: &AccountId,
        client_order_id: &str,
        spec: &OrderSpec,
    ) -> VenueResult<PlaceAck>;

    /// Cancel an existing order by venue id.
    async fn cancel(
        &self,
        account: &AccountId,
        venue_order_id: &VenueOrderId,
        market_id: &MarketId,
    ) -> VenueResult<()>;

    /// Fetch the current depth snapshot for a market.
    async fn fetch_book(&self, market_id: &MarketId) -> VenueResult<BookSnapshot>;

    /// Available balance of the account in the venue's quote currency.
    async fn fetch_balance(&self, account: &AccountId) -> VenueResult<Price>;

    /// Subscribe to the account's push fill stream. Adapters for venues
    /// without websocket support return `Rejected`.
    async fn subscribe_fills(&self, account: &AccountId) -> VenueResult<mpsc::Receiver<VenueFill>>;

    /// List open and recently-updated orders for polling reconciliation.
    async fn fetch_open_orders(&self, account: &AccountId) -> VenueResult<Vec<VenueOrder>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(VenueError::Transient("timeout".into()).is_transient());
        assert!(!VenueError::Rejected("insufficient balance".into()).is_transient());
        assert!(!VenueError::Auth("bad key".into()).is_transient());
    }

    #[test]
    fn from_display_maps_kinds() {
        let err = VenueError::from_display("boom", VenueErrorKind::Serialization);
        assert!(matches!(err, VenueError::Serialization(_)));
    }
}
