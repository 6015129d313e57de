//! The offsetting engine: consumes canonical fills on entry legs and places
//! slippage-bounded market/IOC hedges on the opposing venue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hedgerow_core::{
    executable_vwap, slippage_from_top, FeeSchedule, Fill, Incident, Order, OrderRole, OrderSpec,
    OrderType, PairLeg, Price, Side, Size, TimeInForce, Trade, Venue,
};
use hedgerow_store::Store;
use hedgerow_venue::VenueAdapter;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manager::OrderManager;
use crate::telemetry::Telemetry;
use crate::{EngineError, EngineResult};

/// Everything the hedger needs to offset one entry fill, assembled by the
/// order manager after the double-limit sibling (if any) has been cancelled.
#[derive(Clone, Debug)]
pub struct HedgeDirective {
    pub fill: Fill,
    pub entry: Order,
    /// The opposing leg of the pair: the venue and market to hedge on.
    pub target: PairLeg,
}

#[derive(Clone, Debug)]
pub struct HedgerConfig {
    pub hedge_ratio: Decimal,
    pub max_slippage: Decimal,
    /// Shrink the hedge instead of aborting when depth is thin.
    pub allow_partial_hedge: bool,
    pub multi_leg_enabled: bool,
    /// Relative child weights when a hedge is split into legs.
    pub multi_leg_children: Vec<Decimal>,
    pub hedge_max_retries: u32,
    pub book_timeout: Duration,
}

impl Default for HedgerConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: Decimal::ONE,
            max_slippage: Decimal::new(5, 3),
            allow_partial_hedge: true,
            multi_leg_enabled: false,
            multi_leg_children: Vec::new(),
            hedge_max_retries: 2,
            book_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Hedger {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    manager: Arc<OrderManager>,
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    fees: HashMap<Venue, FeeSchedule>,
    cfg: HedgerConfig,
    /// Per-fill processing guard keyed by canonical fill key. An entry is
    /// inserted before any work and never removed on success, so duplicate
    /// deliveries find it held and are ignored.
    processed: Mutex<HashSet<String>>,
}

impl Hedger {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        manager: Arc<OrderManager>,
        store: Arc<dyn Store>,
        telemetry: Arc<dyn Telemetry>,
        fees: HashMap<Venue, FeeSchedule>,
        cfg: HedgerConfig,
    ) -> Self {
        Self {
            adapters,
            manager,
            store,
            telemetry,
            fees,
            cfg,
            processed: Mutex::new(HashSet::new()),
        }
    }

    /// Offset one entry fill. At-most-once per canonical fill key.
    pub async fn on_entry_fill(&self, directive: HedgeDirective) -> EngineResult<()> {
        let fill_key = directive.fill.dedup_key();
        {
            let mut processed = self.processed.lock().unwrap();
            if !processed.insert(fill_key.clone()) {
                debug!(%fill_key, "duplicate hedge delivery ignored");
                return Ok(());
            }
            if processed.len() > 10_000 {
                processed.clear();
                processed.insert(fill_key.clone());
            }
        }

        let hedge_side = directive.fill.side.inverse();
        let adapter = self
            .adapters
            .get(&directive.target.venue)
            .ok_or_else(|| EngineError::UnknownVenue(directive.target.venue.to_string()))?
            .clone();

        let lot_step = adapter.capabilities().lot_step;
        let target_size = floor_to_step(directive.fill.size * self.cfg.hedge_ratio, lot_step);
        if target_size <= Decimal::ZERO {
            self.record_shortfall(&directive, Decimal::ZERO, Decimal::ZERO)?;
            return Ok(());
        }

        let book = match tokio::time::timeout(
            self.cfg.book_timeout,
            adapter.fetch_book(&directive.target.market_id),
        )
        .await
        {
            Ok(Ok(book)) => book,
            Ok(Err(err)) => {
                self.record_abort(
                    &directive,
                    target_size,
                    "HEDGE_BOOK_FETCH_FAILED",
                    &err.to_string(),
                )?;
                return Err(err.into());
            }
            Err(_) => {
                self.record_abort(
                    &directive,
                    target_size,
                    "HEDGE_BOOK_FETCH_TIMEOUT",
                    "book fetch deadline exceeded",
                )?;
                return Err(EngineError::Hedging("book fetch deadline exceeded".into()));
            }
        };

        let ladder = book.taker_ladder(hedge_side);
        let Some(sized) = self.size_within_slippage(ladder, target_size) else {
            self.telemetry.hedge_aborted();
            self.record_abort(
                &directive,
                target_size,
                "HEDGE_SLIPPAGE_ABORT",
                "slippage above cap",
            )?;
            return Ok(());
        };
        let (hedge_size, predicted_slippage) = sized;

        let legs = self.leg_sizes(hedge_size, lot_step);
        let mut hedged = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let mut hedge_order_ids: Vec<String> = Vec::new();
        for leg_size in legs {
            if leg_size <= Decimal::ZERO {
                continue;
            }
            match self
                .place_leg(&directive, hedge_side, leg_size, predicted_slippage)
                .await
            {
                Ok(placement) => {
                    hedged += placement.filled_size;
                    notional += placement.filled_size
                        * placement.avg_price.unwrap_or(Decimal::ZERO);
                    hedge_order_ids.push(placement.client_order_id);
                }
                Err(err) => {
                    warn!(error = %err, "hedge leg placement failed");
                }
            }
        }

        // IOC legs can come back short; retry the remainder a bounded number
        // of times before recording the shortfall.
        let mut retries = 0;
        while hedged < hedge_size && retries < self.cfg.hedge_max_retries {
            retries += 1;
            let remainder = floor_to_step(hedge_size - hedged, lot_step);
            if remainder <= Decimal::ZERO {
                break;
            }
            match self
                .place_leg(&directive, hedge_side, remainder, predicted_slippage)
                .await
            {
                Ok(placement) => {
                    hedged += placement.filled_size;
                    notional +=
                        placement.filled_size * placement.avg_price.unwrap_or(Decimal::ZERO);
                    hedge_order_ids.push(placement.client_order_id);
                }
                Err(err) => {
                    warn!(attempt = retries, error = %err, "hedge remainder retry failed");
                }
            }
        }

        if hedged <= Decimal::ZERO {
            self.record_shortfall(&directive, hedge_size, hedged)?;
            return Ok(());
        }
        if hedged < hedge_size {
            self.record_shortfall(&directive, hedge_size, hedged)?;
        }

        let avg_hedge_price = notional / hedged;
        let trade = self.build_trade(&directive, hedged, avg_hedge_price, &hedge_order_ids);
        self.store.save_trade(&trade)?;
        self.telemetry.hedge_placed();
        info!(
            entry_order_id = %trade.entry_order_id,
            hedge_venue = %trade.hedge_venue,
            size = %trade.size,
            hedge_price = %trade.hedge_price,
            pnl_estimate = %trade.pnl_estimate,
            "hedge completed"
        );
        Ok(())
    }

    /// Largest size at or under `target` whose executable slippage stays
    /// within the cap. Shrinks in 10% steps when partial hedging is allowed.
    fn size_within_slippage(
        &self,
        ladder: &[hedgerow_core::Level],
        target: Size,
    ) -> Option<(Size, Decimal)> {
        let outcome = executable_vwap(ladder, target)?;
        let achievable = outcome.achieved.min(target);
        let slippage = slippage_from_top(ladder, &outcome);
        if slippage <= self.cfg.max_slippage && outcome.covers(target) {
            return Some((target, slippage));
        }
        if !self.cfg.allow_partial_hedge {
            return None;
        }
        let step = achievable / Decimal::from(10u8);
        let mut candidate = achievable;
        while candidate > Decimal::ZERO {
            if let Some(outcome) = executable_vwap(ladder, candidate) {
                let slippage = slippage_from_top(ladder, &outcome);
                if outcome.covers(candidate) && slippage <= self.cfg.max_slippage {
                    return Some((candidate, slippage));
                }
            }
            candidate -= step;
        }
        None
    }

    fn leg_sizes(&self, total: Size, lot_step: Size) -> Vec<Size> {
        if !self.cfg.multi_leg_enabled || self.cfg.multi_leg_children.is_empty() {
            return vec![total];
        }
        let weight_sum: Decimal = self.cfg.multi_leg_children.iter().copied().sum();
        if weight_sum <= Decimal::ZERO {
            return vec![total];
        }
        let mut legs: Vec<Size> = self
            .cfg
            .multi_leg_children
            .iter()
            .map(|weight| floor_to_step(total * *weight / weight_sum, lot_step))
            .collect();
        // Fold rounding residue into the last leg.
        let assigned: Decimal = legs.iter().copied().sum();
        let residue = total - assigned;
        if residue > Decimal::ZERO {
            if let Some(last) = legs.last_mut() {
                *last += residue;
            }
        }
        legs
    }

    async fn place_leg(
        &self,
        directive: &HedgeDirective,
        side: Side,
        size: Size,
        predicted_slippage: Decimal,
    ) -> EngineResult<crate::manager::Placement> {
        let spec = OrderSpec {
            venue: directive.target.venue.clone(),
            account_id: directive.target.account_id.clone(),
            market_id: directive.target.market_id.clone(),
            pair_id: directive.entry.pair_id.clone(),
            side,
            order_type: OrderType::Market,
            price: None,
            size,
            time_in_force: Some(TimeInForce::ImmediateOrCancel),
            role: OrderRole::Hedge,
            parent_fill_id: Some(directive.fill.dedup_key()),
        };
        self.manager.place(spec, predicted_slippage).await
    }

    fn build_trade(
        &self,
        directive: &HedgeDirective,
        hedged: Size,
        avg_hedge_price: Price,
        hedge_order_ids: &[String],
    ) -> Trade {
        let size = directive.fill.size.min(hedged);
        let entry_fee_rate = self
            .fees
            .get(&directive.entry.venue)
            .map(|schedule| schedule.maker)
            .unwrap_or_default();
        let hedge_fee_rate = self
            .fees
            .get(&directive.target.venue)
            .map(|schedule| schedule.taker)
            .unwrap_or_default();
        let fees = directive.fill.price * size * entry_fee_rate
            + avg_hedge_price * size * hedge_fee_rate;
        let gross = match directive.fill.side {
            Side::Buy => (avg_hedge_price - directive.fill.price) * size,
            Side::Sell => (directive.fill.price - avg_hedge_price) * size,
        };
        Trade {
            id: Uuid::new_v4(),
            entry_order_id: directive.entry.client_order_id.clone(),
            hedge_order_id: hedge_order_ids.join(","),
            entry_venue: directive.entry.venue.clone(),
            hedge_venue: directive.target.venue.clone(),
            size,
            entry_price: directive.fill.price,
            hedge_price: avg_hedge_price,
            fees,
            pnl_estimate: gross - fees,
            ts: Utc::now(),
        }
    }

    fn record_abort(
        &self,
        directive: &HedgeDirective,
        target_size: Size,
        code: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let incident = Incident::error(
            code,
            json!({
                "entry_order_id": directive.entry.client_order_id,
                "fill_key": directive.fill.dedup_key(),
                "target_venue": directive.target.venue.as_str(),
                "target_size": target_size.to_string(),
                "reason": reason,
            }),
        );
        self.telemetry.incident(incident.level);
        self.store.record_incident(&incident)?;
        Ok(())
    }

    fn record_shortfall(
        &self,
        directive: &HedgeDirective,
        wanted: Size,
        hedged: Size,
    ) -> EngineResult<()> {
        let incident = Incident::warning(
            "HEDGE_UNDERSIZED",
            json!({
                "entry_order_id": directive.entry.client_order_id,
                "fill_key": directive.fill.dedup_key(),
                "target_venue": directive.target.venue.as_str(),
                "wanted": wanted.to_string(),
                "hedged": hedged.to_string(),
            }),
        );
        self.telemetry.incident(incident.level);
        self.store.record_incident(&incident)?;
        Ok(())
    }
}

fn floor_to_step(size: Size, step: Size) -> Size {
    if step <= Decimal::ZERO {
        return size;
    }
    (size / step).floor() * step
}
