//! Persistence gateway for the hedging engine.
//!
//! Every order, fill, hedge trade, double-limit record and incident is
//! persisted for auditability and crash recovery. The [`Store`] trait keeps
//! the engine independent of the backing database; [`SqliteStore`] is the
//! implementation shipped with this workspace.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hedgerow_core::{
    DoubleLimit, DoubleLimitState, Fill, Incident, Order, SimulatedRun, Size, Trade, Venue,
};
use thiserror::Error;

mod sqlite;

pub use sqlite::{new_record_id, SqliteStore};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A persisted value no longer matches its enumeration or numeric form.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// One appended lifecycle event of an order, replayable in insertion order.
#[derive(Clone, Debug)]
pub struct OrderEventRow {
    pub id: i64,
    pub client_order_id: String,
    pub stage: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Gateway consumed by the engine; implementations must be thread-safe and
/// keep each call a short transaction.
pub trait Store: Send + Sync {
    /// Idempotent upsert keyed on `client_order_id`.
    fn upsert_order(&self, order: &Order) -> StoreResult<()>;

    fn load_order(&self, client_order_id: &str) -> StoreResult<Option<Order>>;

    /// Orders whose status is non-terminal, for recovery and polling diffs.
    fn open_orders(&self) -> StoreResult<Vec<Order>>;

    /// Append to the order event log. Written before in-memory state moves.
    fn append_order_event(
        &self,
        client_order_id: &str,
        stage: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()>;

    /// Event log of one order in append order.
    fn order_events(&self, client_order_id: &str) -> StoreResult<Vec<OrderEventRow>>;

    /// Record a canonical fill. Returns `false` when the fill was already
    /// present (same venue, order and fill id).
    fn record_fill(&self, fill: &Fill) -> StoreResult<bool>;

    /// Recently recorded fill dedup keys, newest first, to warm caches.
    fn recent_fill_keys(&self, limit: usize) -> StoreResult<Vec<String>>;

    fn fill_watermark(&self, venue: &Venue, venue_order_id: &str) -> StoreResult<Option<Size>>;

    fn save_fill_watermark(
        &self,
        venue: &Venue,
        venue_order_id: &str,
        cumulative: Size,
    ) -> StoreResult<()>;

    fn load_fill_watermarks(&self) -> StoreResult<HashMap<(Venue, String), Size>>;

    fn save_trade(&self, trade: &Trade) -> StoreResult<()>;

    /// All recorded trades, oldest first.
    fn trades(&self) -> StoreResult<Vec<Trade>>;

    fn save_double_limit(&self, record: &DoubleLimit) -> StoreResult<()>;

    fn get_double_limit_by_order(&self, order_ref: &str) -> StoreResult<Option<DoubleLimit>>;

    fn update_double_limit_state(
        &self,
        id: &str,
        state: DoubleLimitState,
        triggered_order_id: Option<&str>,
        cancelled_order_id: Option<&str>,
    ) -> StoreResult<()>;

    fn record_incident(&self, incident: &Incident) -> StoreResult<()>;

    /// Most recent incidents, newest first.
    fn recent_incidents(&self, limit: usize) -> StoreResult<Vec<Incident>>;

    fn record_simulated_run(&self, run: &SimulatedRun) -> StoreResult<()>;
}
