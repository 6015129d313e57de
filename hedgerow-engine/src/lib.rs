//! The hedging engine: order lifecycle, fill reconciliation, offsetting and
//! per-pair control.
//!
//! Components are wired together by the binary; everything here talks to
//! venues through [`hedgerow_venue::VenueAdapter`] and to storage through
//! [`hedgerow_store::Store`].

use hedgerow_store::StoreError;
use hedgerow_venue::VenueError;
use thiserror::Error;

pub mod accounts;
pub mod controller;
pub mod fsm;
pub mod healthcheck;
pub mod hedger;
pub mod manager;
pub mod reconciler;
pub mod risk;
mod shutdown;
mod telemetry;

pub use accounts::{AccountPool, AccountSpec};
pub use controller::{
    spawn_fill_router, PairController, PairControllerConfig, PairRegistry, PairStatus,
};
pub use fsm::{OrderEvent, OrderFsm, Transition};
pub use healthcheck::{HealthcheckConfig, HealthcheckService, PairHealth};
pub use hedger::{HedgeDirective, Hedger, HedgerConfig};
pub use manager::{OrderDigest, OrderManager, OrderManagerConfig, Placement};
pub use reconciler::{FillTracking, Reconciler, ReconcilerConfig};
pub use risk::{AccountState, DenyReason, ProposedOrder, RiskLimits, RiskManager, Verdict};
pub use shutdown::ShutdownSignal;
pub use telemetry::{NoopTelemetry, Telemetry};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("risk denied: {0}")]
    RiskDenied(DenyReason),
    #[error("unknown venue '{0}'")]
    UnknownVenue(String),
    #[error("unknown account '{0}'")]
    UnknownAccount(String),
    #[error("unknown order '{0}'")]
    UnknownOrder(String),
    #[error("unknown pair '{0}'")]
    UnknownPair(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("hedging failed: {0}")]
    Hedging(String),
}
