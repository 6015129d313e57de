//! Read-only connectivity checks and order-plan simulation. Neither path
//! ever places an order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use hedgerow_core::{
    executable_vwap, BookSnapshot, FeeSchedule, MarketPair, Side, SimulatedRun, Size,
    SpreadAnalyzer, SpreadOutcome, SpreadParams, Venue,
};
use hedgerow_store::Store;
use hedgerow_venue::VenueAdapter;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::{EngineError, EngineResult};

#[derive(Clone, Debug, Serialize)]
pub struct PairHealth {
    pub pair_id: String,
    pub primary_venue: String,
    pub secondary_venue: String,
    pub primary_ok: bool,
    pub secondary_ok: bool,
    pub net_spread: Option<Decimal>,
    pub executable_size: Option<Size>,
    pub error: Option<String>,
}

impl PairHealth {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.primary_ok && self.secondary_ok
    }
}

#[derive(Clone, Debug)]
pub struct HealthcheckConfig {
    /// Canonical size used for health evaluation.
    pub canonical_size: Size,
    pub book_timeout: Duration,
    pub primary_fee: FeeSchedule,
    pub secondary_fee: FeeSchedule,
    /// Ratio mirrored from the hedger: simulated hedge legs cover
    /// `entry_size × hedge_ratio`, exactly as the live path would.
    pub hedge_ratio: Decimal,
    /// Child weights mirrored from the hedger for simulated hedge legs.
    pub multi_leg_children: Vec<Decimal>,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            canonical_size: Decimal::ONE,
            book_timeout: Duration::from_secs(2),
            primary_fee: FeeSchedule::default(),
            secondary_fee: FeeSchedule::default(),
            hedge_ratio: Decimal::ONE,
            multi_leg_children: Vec::new(),
        }
    }
}

pub struct HealthcheckService {
    pairs: Vec<MarketPair>,
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<dyn Store>,
    analyzer: SpreadAnalyzer,
    cfg: HealthcheckConfig,
}

impl HealthcheckService {
    pub fn new(
        pairs: Vec<MarketPair>,
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        store: Arc<dyn Store>,
        cfg: HealthcheckConfig,
    ) -> Self {
        Self {
            pairs,
            adapters,
            store,
            analyzer: SpreadAnalyzer,
            cfg,
        }
    }

    /// Fetch both books for every enabled pair in parallel and report
    /// per-pair connectivity plus the net spread at the canonical size.
    pub async fn health(&self) -> Vec<PairHealth> {
        join_all(self.pairs.iter().map(|pair| self.check_pair(pair))).await
    }

    async fn check_pair(&self, pair: &MarketPair) -> PairHealth {
        let mut health = PairHealth {
            pair_id: pair.pair_id.clone(),
            primary_venue: pair.primary.venue.to_string(),
            secondary_venue: pair.secondary.venue.to_string(),
            primary_ok: false,
            secondary_ok: false,
            net_spread: None,
            executable_size: None,
            error: None,
        };
        let (primary, secondary) = tokio::join!(
            self.fetch_book(&pair.primary.venue, &pair.primary.market_id),
            self.fetch_book(&pair.secondary.venue, &pair.secondary.market_id),
        );
        let primary = match primary {
            Ok(book) => {
                health.primary_ok = true;
                Some(book)
            }
            Err(err) => {
                health.error = Some(err.to_string());
                None
            }
        };
        let secondary = match secondary {
            Ok(book) => {
                health.secondary_ok = true;
                Some(book)
            }
            Err(err) => {
                health.error.get_or_insert(err.to_string());
                None
            }
        };
        if let (Some(primary), Some(secondary)) = (primary, secondary) {
            if let SpreadOutcome::Quote(report) = self.analyzer.evaluate(
                &primary,
                &secondary,
                SpreadParams {
                    notional: self.cfg.canonical_size,
                    entry_side: Side::Buy,
                    primary_fee: self.cfg.primary_fee.maker,
                    secondary_fee: self.cfg.secondary_fee.taker,
                },
            ) {
                health.net_spread = Some(report.net_spread);
                health.executable_size = Some(report.executable_size);
            }
        }
        health
    }

    /// Build the full order plan for a pair at `size` and persist it as a
    /// `simulated_runs` row. The plan document is a pure function of the two
    /// snapshots, so identical books produce identical JSON.
    pub async fn simulate(&self, pair_id: &str, size: Option<Size>) -> EngineResult<SimulatedRun> {
        let pair = self
            .pairs
            .iter()
            .find(|pair| pair.pair_id == pair_id)
            .ok_or_else(|| EngineError::UnknownPair(pair_id.to_string()))?;
        let size = size.unwrap_or(self.cfg.canonical_size);
        let (primary, secondary) = tokio::join!(
            self.fetch_book(&pair.primary.venue, &pair.primary.market_id),
            self.fetch_book(&pair.secondary.venue, &pair.secondary.market_id),
        );
        let primary = primary?;
        let secondary = secondary?;

        let outcome = self.analyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: size,
                entry_side: Side::Buy,
                primary_fee: self.cfg.primary_fee.maker,
                secondary_fee: self.cfg.secondary_fee.taker,
            },
        );
        let (plan, expected_pnl) = match outcome {
            SpreadOutcome::NoQuote => (
                json!({
                    "pair_id": pair.pair_id,
                    "size": size.to_string(),
                    "viable": false,
                    "reason": "no quote on at least one side",
                }),
                Decimal::ZERO,
            ),
            SpreadOutcome::Quote(report) => {
                let plan_size = size.min(report.executable_size);
                // The would-be hedge covers entry × hedge_ratio, as the live
                // hedger would place it; pnl accrues on the matched size.
                let hedge_size = plan_size * self.cfg.hedge_ratio;
                let matched_size = plan_size.min(hedge_size);
                let hedge_legs = self.plan_hedge_legs(&secondary, hedge_size);
                let expected_pnl = report.net_spread * report.primary_vwap * matched_size;
                (
                    json!({
                        "pair_id": pair.pair_id,
                        "size": plan_size.to_string(),
                        "viable": true,
                        "entry_leg": {
                            "venue": pair.primary.venue.as_str(),
                            "market_id": pair.primary.market_id,
                            "side": "BUY",
                            "order_type": "LIMIT",
                            "price": report.primary_vwap.to_string(),
                            "size": plan_size.to_string(),
                        },
                        "hedge_legs": hedge_legs,
                        "hedge_ratio": self.cfg.hedge_ratio.to_string(),
                        "net_spread": report.net_spread.to_string(),
                        "gross_spread": report.gross_spread.to_string(),
                        "fees": {
                            "primary_maker": self.cfg.primary_fee.maker.to_string(),
                            "secondary_taker": self.cfg.secondary_fee.taker.to_string(),
                        },
                    }),
                    expected_pnl,
                )
            }
        };

        let run = SimulatedRun {
            id: Uuid::new_v4().simple().to_string(),
            pair_id: pair.pair_id.clone(),
            size,
            plan,
            expected_pnl,
            notes: None,
            ts: Utc::now(),
        };
        self.store.record_simulated_run(&run)?;
        Ok(run)
    }

    fn plan_hedge_legs(&self, secondary: &BookSnapshot, total: Size) -> serde_json::Value {
        let weights = if self.cfg.multi_leg_children.is_empty() {
            vec![Decimal::ONE]
        } else {
            self.cfg.multi_leg_children.clone()
        };
        let weight_sum: Decimal = weights.iter().copied().sum();
        let ladder = secondary.taker_ladder(Side::Sell);
        let legs: Vec<serde_json::Value> = weights
            .iter()
            .map(|weight| {
                let leg_size = total * *weight / weight_sum;
                let vwap = executable_vwap(ladder, leg_size).map(|outcome| outcome.vwap.to_string());
                json!({
                    "venue": secondary.venue.as_str(),
                    "market_id": secondary.market_id,
                    "side": "SELL",
                    "order_type": "MARKET",
                    "size": leg_size.to_string(),
                    "estimated_vwap": vwap,
                })
            })
            .collect();
        json!(legs)
    }

    async fn fetch_book(
        &self,
        venue: &Venue,
        market_id: &str,
    ) -> EngineResult<BookSnapshot> {
        let adapter = self
            .adapters
            .get(venue)
            .ok_or_else(|| EngineError::UnknownVenue(venue.to_string()))?;
        match tokio::time::timeout(
            self.cfg.book_timeout,
            adapter.fetch_book(&market_id.to_string()),
        )
        .await
        {
            Ok(Ok(book)) => Ok(book),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                warn!(%venue, market_id, "book fetch deadline exceeded");
                Err(EngineError::Venue(hedgerow_venue::VenueError::Transient(
                    "book fetch deadline exceeded".into(),
                )))
            }
        }
    }
}
