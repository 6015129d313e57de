//! Orderbook snapshots and depth-aware price math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MarketId, Price, Side, Size, Venue};

/// A single price level of a depth ladder.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Level {
    pub price: Price,
    pub size: Size,
}

impl Level {
    #[must_use]
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("crossed book for {market_id}: best bid {bid} >= best ask {ask}")]
    Crossed {
        market_id: MarketId,
        bid: Price,
        ask: Price,
    },
}

/// Immutable top-of-book plus depth ladder for one market on one venue.
///
/// Construction normalizes the ladders: bids sorted descending, asks
/// ascending, non-positive sizes dropped, levels sharing a price merged.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BookSnapshot {
    pub venue: Venue,
    pub market_id: MarketId,
    /// Monotonically increasing sequence (or timestamp-derived) number.
    pub seq: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub ts: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn new(
        venue: Venue,
        market_id: impl Into<MarketId>,
        seq: u64,
        bids: Vec<Level>,
        asks: Vec<Level>,
    ) -> Result<Self, BookError> {
        let market_id = market_id.into();
        let mut bids = normalize(bids);
        bids.reverse(); // descending
        let asks = normalize(asks);
        if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
            if bid.price >= ask.price {
                return Err(BookError::Crossed {
                    market_id,
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        Ok(Self {
            venue,
            market_id,
            seq,
            bids,
            asks,
            ts: Utc::now(),
        })
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    /// The ladder an aggressive order of `side` executes against.
    #[must_use]
    pub fn taker_ladder(&self, side: Side) -> &[Level] {
        match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        }
    }

    /// Total resting size on the taker ladder for `side`.
    #[must_use]
    pub fn taker_depth(&self, side: Side) -> Size {
        self.taker_ladder(side).iter().map(|level| level.size).sum()
    }
}

/// Sort ascending by price, drop non-positive sizes, merge equal prices.
fn normalize(mut levels: Vec<Level>) -> Vec<Level> {
    levels.retain(|level| level.size > Decimal::ZERO);
    levels.sort_by(|a, b| a.price.cmp(&b.price));
    let mut merged: Vec<Level> = Vec::with_capacity(levels.len());
    for level in levels {
        match merged.last_mut() {
            Some(last) if last.price == level.price => last.size += level.size,
            _ => merged.push(level),
        }
    }
    merged
}

/// Result of walking a ladder toward a target size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VwapOutcome {
    /// Volume-weighted average price over the achieved size.
    pub vwap: Price,
    /// Size actually available; below the target when the ladder is thin.
    pub achieved: Size,
}

impl VwapOutcome {
    /// Whether the ladder could absorb the full target size.
    #[must_use]
    pub fn covers(&self, target: Size) -> bool {
        self.achieved >= target
    }
}

/// Walk `ladder` until the cumulative size reaches `target`.
///
/// Returns `None` for an empty ladder or a non-positive target; otherwise the
/// executable VWAP together with the achievable size.
#[must_use]
pub fn executable_vwap(ladder: &[Level], target: Size) -> Option<VwapOutcome> {
    if ladder.is_empty() || target <= Decimal::ZERO {
        return None;
    }
    let mut remaining = target;
    let mut notional = Decimal::ZERO;
    let mut achieved = Decimal::ZERO;
    for level in ladder {
        let take = level.size.min(remaining);
        notional += take * level.price;
        achieved += take;
        remaining -= take;
        if remaining <= Decimal::ZERO {
            break;
        }
    }
    if achieved.is_zero() {
        return None;
    }
    Some(VwapOutcome {
        vwap: notional / achieved,
        achieved,
    })
}

/// Relative distance of an executable VWAP from the top of the ladder.
#[must_use]
pub fn slippage_from_top(ladder: &[Level], outcome: &VwapOutcome) -> Decimal {
    match ladder.first() {
        Some(top) if !top.price.is_zero() => ((outcome.vwap - top.price) / top.price).abs(),
        _ => Decimal::ZERO,
    }
}
