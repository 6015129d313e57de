//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod book;
mod spread;

pub use book::{executable_vwap, slippage_from_top, BookError, BookSnapshot, Level, VwapOutcome};
pub use spread::{FeeSchedule, SpreadAnalyzer, SpreadOutcome, SpreadParams, SpreadReport};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Size = Decimal;
/// Venue-native market identifier (ticker, condition id, token id).
pub type MarketId = String;
/// Identifier of a configured trading account.
pub type AccountId = String;
/// Client-side order identifier, generated before placement and never reused.
pub type ClientOrderId = String;
/// Venue-assigned order identifier, known only after the placement ack.
pub type VenueOrderId = String;

/// Name of a trading venue, normalized to lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Venue(String);

impl Venue {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Venue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Venue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// The side of an order or fill.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(ParseEnumError::new("side", other)),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Rest on the book at the provided limit price.
    Limit,
    /// Execute immediately against the opposing ladder.
    Market,
}

/// Optional time-in-force constraints.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    GoodTilCancelled,
    ImmediateOrCancel,
}

/// Why an order exists within the engine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderRole {
    /// The resting spread-capture leg.
    Primary,
    /// An offsetting leg placed after a primary fill.
    Hedge,
    /// First leg of a coupled double-limit placement.
    DoubleA,
    /// Second leg of a coupled double-limit placement.
    DoubleB,
}

impl OrderRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Hedge => "HEDGE",
            Self::DoubleA => "DOUBLE_A",
            Self::DoubleB => "DOUBLE_B",
        }
    }

    /// Short lowercase tag used inside client order ids.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Primary => "pri",
            Self::Hedge => "hdg",
            Self::DoubleA => "dla",
            Self::DoubleB => "dlb",
        }
    }
}

impl FromStr for OrderRole {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PRIMARY" => Ok(Self::Primary),
            "HEDGE" => Ok(Self::Hedge),
            "DOUBLE_A" => Ok(Self::DoubleA),
            "DOUBLE_B" => Ok(Self::DoubleB),
            other => Err(ParseEnumError::new("order role", other)),
        }
    }
}

/// Order lifecycle status, authoritative in the per-order state machine.
///
/// Statuses are persisted as bounded strings and re-validated against this
/// enumeration when read back.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PendingPlace,
    Live,
    Partial,
    Filled,
    Cancelling,
    Cancelled,
    Rejected,
    Expired,
    Errored,
}

impl OrderStatus {
    /// Terminal statuses accept no further lifecycle events.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired | Self::Errored
        )
    }

    /// The order is resting (or partially resting) on a venue book.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Live | Self::Partial | Self::Cancelling)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PendingPlace => "PENDING_PLACE",
            Self::Live => "LIVE",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Errored => "ERRORED",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(Self::New),
            "PENDING_PLACE" => Ok(Self::PendingPlace),
            "LIVE" => Ok(Self::Live),
            "PARTIAL" => Ok(Self::Partial),
            "FILLED" => Ok(Self::Filled),
            "CANCELLING" => Ok(Self::Cancelling),
            "CANCELLED" => Ok(Self::Cancelled),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            "ERRORED" => Ok(Self::Errored),
            other => Err(ParseEnumError::new("order status", other)),
        }
    }
}

/// Raised when a persisted enum string no longer matches the enumeration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {kind}: '{raw}'")]
pub struct ParseEnumError {
    kind: &'static str,
    raw: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, raw: impl Into<String>) -> Self {
        Self {
            kind,
            raw: raw.into(),
        }
    }
}

/// Desired order placement parameters handed to the order manager.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderSpec {
    pub venue: Venue,
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub pair_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub size: Size,
    pub time_in_force: Option<TimeInForce>,
    pub role: OrderRole,
    /// Canonical key of the fill this order offsets; hedge legs only.
    pub parent_fill_id: Option<String>,
}

/// Order representation aggregating venue state, owned by one state machine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub venue: Venue,
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub pair_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub requested_size: Size,
    pub filled_size: Size,
    pub status: OrderStatus,
    pub role: OrderRole,
    pub parent_fill_id: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last raw venue payload, kept for auditability.
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

impl Order {
    /// Construct a fresh `NEW` order from a spec and its assigned client id.
    #[must_use]
    pub fn from_spec(spec: &OrderSpec, client_order_id: ClientOrderId, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            client_order_id,
            venue_order_id: None,
            venue: spec.venue.clone(),
            account_id: spec.account_id.clone(),
            market_id: spec.market_id.clone(),
            pair_id: spec.pair_id.clone(),
            side: spec.side,
            order_type: spec.order_type,
            price: spec.price,
            requested_size: spec.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::New,
            role: spec.role,
            parent_fill_id: spec.parent_fill_id.clone(),
            dry_run,
            created_at: now,
            updated_at: now,
            raw: None,
        }
    }

    #[must_use]
    pub fn remaining_size(&self) -> Size {
        (self.requested_size - self.filled_size).max(Decimal::ZERO)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Canonical fill event emitted by the reconciler, after deduplication.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fill {
    pub venue: Venue,
    pub venue_order_id: VenueOrderId,
    /// Venue-assigned fill identifier, when the venue provides one.
    pub fill_id: Option<String>,
    pub client_order_id: Option<ClientOrderId>,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Price,
    pub size: Size,
    pub ts: DateTime<Utc>,
}

impl Fill {
    /// Canonical deduplication key: exact when the venue supplies fill ids,
    /// cumulative-delta otherwise.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        match &self.fill_id {
            Some(id) => format!("{}:{}:{}", self.venue, self.venue_order_id, id),
            None => format!(
                "{}:{}:delta:{}:{}",
                self.venue,
                self.venue_order_id,
                self.size,
                self.ts.timestamp_millis()
            ),
        }
    }
}

/// Immutable record linking an entry leg with its offsetting hedge leg.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub id: Uuid,
    pub entry_order_id: ClientOrderId,
    pub hedge_order_id: ClientOrderId,
    pub entry_venue: Venue,
    pub hedge_venue: Venue,
    /// Matched size: min of both legs after slippage handling.
    pub size: Size,
    pub entry_price: Price,
    pub hedge_price: Price,
    pub fees: Price,
    pub pnl_estimate: Price,
    pub ts: DateTime<Utc>,
}

/// Lifecycle of a coupled double-limit order pair.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DoubleLimitState {
    Armed,
    Triggered,
    Cancelling,
    Resolved,
    Failed,
}

impl DoubleLimitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Armed => "ARMED",
            Self::Triggered => "TRIGGERED",
            Self::Cancelling => "CANCELLING",
            Self::Resolved => "RESOLVED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for DoubleLimitState {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ARMED" => Ok(Self::Armed),
            "TRIGGERED" => Ok(Self::Triggered),
            "CANCELLING" => Ok(Self::Cancelling),
            "RESOLVED" => Ok(Self::Resolved),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("double limit state", other)),
        }
    }
}

/// Record of two paired orders where either fill cancels the sibling.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DoubleLimit {
    pub id: String,
    pub pair_key: String,
    pub order_a_ref: ClientOrderId,
    pub order_b_ref: ClientOrderId,
    pub venue_a: Venue,
    pub venue_b: Venue,
    pub state: DoubleLimitState,
    pub triggered_order_id: Option<ClientOrderId>,
    pub cancelled_order_id: Option<ClientOrderId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DoubleLimit {
    /// The sibling of `order_ref`, or `None` when the ref is not a leg.
    #[must_use]
    pub fn sibling_of(&self, order_ref: &str) -> Option<(&ClientOrderId, &Venue)> {
        if self.order_a_ref == order_ref {
            Some((&self.order_b_ref, &self.venue_b))
        } else if self.order_b_ref == order_ref {
            Some((&self.order_a_ref, &self.venue_a))
        } else {
            None
        }
    }
}

/// Severity attached to a recorded incident.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl IncidentLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl FromStr for IncidentLevel {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(ParseEnumError::new("incident level", other)),
        }
    }
}

/// Append-only operational incident.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Incident {
    pub level: IncidentLevel,
    pub message: String,
    pub details: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Incident {
    pub fn new(level: IncidentLevel, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            level,
            message: message.into(),
            details,
            ts: Utc::now(),
        }
    }

    pub fn warning(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new(IncidentLevel::Warning, message, details)
    }

    pub fn error(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new(IncidentLevel::Error, message, details)
    }

    pub fn critical(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new(IncidentLevel::Critical, message, details)
    }
}

/// A read-only plan produced by the simulator, never placed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimulatedRun {
    pub id: String,
    pub pair_id: String,
    pub size: Size,
    /// Full deterministic plan document.
    pub plan: serde_json::Value,
    pub expected_pnl: Price,
    pub notes: Option<String>,
    pub ts: DateTime<Utc>,
}

/// One venue-side of a market pair.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PairLeg {
    pub venue: Venue,
    pub market_id: MarketId,
    pub account_id: AccountId,
}

/// Immutable mapping of one shared event onto two venues.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarketPair {
    /// Shared event identifier, unique across the engine.
    pub pair_id: String,
    /// The venue carrying the resting spread-capture leg.
    pub primary: PairLeg,
    /// The venue the hedge executes on.
    pub secondary: PairLeg,
}

impl MarketPair {
    /// The opposing leg for a fill observed on `venue`.
    #[must_use]
    pub fn opposing_leg(&self, venue: &Venue) -> Option<&PairLeg> {
        if &self.primary.venue == venue {
            Some(&self.secondary)
        } else if &self.secondary.venue == venue {
            Some(&self.primary)
        } else {
            None
        }
    }
}
