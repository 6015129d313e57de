//! Cross-venue spread evaluation over two book snapshots.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book::{executable_vwap, slippage_from_top, BookSnapshot};
use crate::{Price, Side, Size};

/// Per-venue fee rates applied to spread math.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FeeSchedule {
    #[serde(default)]
    pub maker: Decimal,
    #[serde(default)]
    pub taker: Decimal,
}

/// Inputs for one spread evaluation.
#[derive(Clone, Copy, Debug)]
pub struct SpreadParams {
    /// Target size, in contracts.
    pub notional: Size,
    /// Side of the resting primary entry order.
    pub entry_side: Side,
    /// Fee rate charged on the primary leg (maker, the leg rests).
    pub primary_fee: Decimal,
    /// Fee rate charged on the secondary leg (taker, the hedge crosses).
    pub secondary_fee: Decimal,
}

/// Result of evaluating a pair of books at a target size.
#[derive(Clone, Debug, PartialEq)]
pub enum SpreadOutcome {
    /// Either required ladder was empty.
    NoQuote,
    Quote(SpreadReport),
}

impl SpreadOutcome {
    #[must_use]
    pub fn quote(&self) -> Option<&SpreadReport> {
        match self {
            Self::NoQuote => None,
            Self::Quote(report) => Some(report),
        }
    }
}

/// Depth-aware spread numbers for one direction of one pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpreadReport {
    pub entry_side: Side,
    /// Executable VWAP of the primary entry at the evaluated size.
    pub primary_vwap: Price,
    /// Executable VWAP of the secondary exit at the evaluated size.
    pub secondary_vwap: Price,
    /// Net spread after fees, normalized by the primary entry VWAP.
    pub net_spread: Decimal,
    /// Spread before fee deductions, same normalization.
    pub gross_spread: Decimal,
    /// Size achievable on both legs (min of the two ladders).
    pub executable_size: Size,
    pub primary_slippage: Decimal,
    pub secondary_slippage: Decimal,
}

/// Pure, stateless evaluator. Never mutates its inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpreadAnalyzer;

impl SpreadAnalyzer {
    /// Evaluate entering `params.entry_side` on the primary book and exiting
    /// on the secondary book at `params.notional`.
    ///
    /// An entry buy walks the primary asks and exits into the secondary bids;
    /// an entry sell is the mirror image. The net spread deducts the primary
    /// fee from the entry and the secondary fee from the exit, normalized by
    /// the primary entry VWAP.
    #[must_use]
    pub fn evaluate(
        &self,
        primary: &BookSnapshot,
        secondary: &BookSnapshot,
        params: SpreadParams,
    ) -> SpreadOutcome {
        let entry_ladder = primary.taker_ladder(params.entry_side);
        let exit_ladder = secondary.taker_ladder(params.entry_side.inverse());

        let Some(entry) = executable_vwap(entry_ladder, params.notional) else {
            return SpreadOutcome::NoQuote;
        };
        let Some(exit) = executable_vwap(exit_ladder, params.notional) else {
            return SpreadOutcome::NoQuote;
        };
        if entry.vwap.is_zero() {
            return SpreadOutcome::NoQuote;
        }

        // Per-unit edge: what the exit returns minus what the entry costs.
        let (entry_cost, exit_proceeds) = match params.entry_side {
            Side::Buy => (
                entry.vwap * (Decimal::ONE + params.primary_fee),
                exit.vwap * (Decimal::ONE - params.secondary_fee),
            ),
            Side::Sell => (
                exit.vwap * (Decimal::ONE + params.secondary_fee),
                entry.vwap * (Decimal::ONE - params.primary_fee),
            ),
        };
        let gross = match params.entry_side {
            Side::Buy => (exit.vwap - entry.vwap) / entry.vwap,
            Side::Sell => (entry.vwap - exit.vwap) / entry.vwap,
        };
        let net = (exit_proceeds - entry_cost) / entry.vwap;

        SpreadOutcome::Quote(SpreadReport {
            entry_side: params.entry_side,
            primary_vwap: entry.vwap,
            secondary_vwap: exit.vwap,
            net_spread: net,
            gross_spread: gross,
            executable_size: entry.achieved.min(exit.achieved),
            primary_slippage: slippage_from_top(entry_ladder, &entry),
            secondary_slippage: slippage_from_top(exit_ladder, &exit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Level;
    use crate::Venue;
    use rust_decimal_macros::dec;

    fn book(venue: &str, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> BookSnapshot {
        BookSnapshot::new(
            Venue::new(venue),
            "mkt",
            1,
            bids.into_iter().map(|(p, s)| Level::new(p, s)).collect(),
            asks.into_iter().map(|(p, s)| Level::new(p, s)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn buy_entry_spread_is_exit_minus_entry() {
        // Primary 0.40/0.42, secondary 0.48/0.50 at 100 contracts each.
        let primary = book(
            "polymarket",
            vec![(dec!(0.40), dec!(100))],
            vec![(dec!(0.42), dec!(100))],
        );
        let secondary = book(
            "opinion",
            vec![(dec!(0.48), dec!(100))],
            vec![(dec!(0.50), dec!(100))],
        );
        let outcome = SpreadAnalyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: dec!(100),
                entry_side: Side::Buy,
                primary_fee: Decimal::ZERO,
                secondary_fee: Decimal::ZERO,
            },
        );
        let report = outcome.quote().unwrap();
        assert_eq!(report.primary_vwap, dec!(0.42));
        assert_eq!(report.secondary_vwap, dec!(0.48));
        assert_eq!(report.executable_size, dec!(100));
        // (0.48 - 0.42) / 0.42
        assert_eq!(report.net_spread, dec!(0.06) / dec!(0.42));
        assert_eq!(report.gross_spread, report.net_spread);
    }

    #[test]
    fn fees_reduce_the_net_spread() {
        let primary = book(
            "polymarket",
            vec![(dec!(0.40), dec!(100))],
            vec![(dec!(0.42), dec!(100))],
        );
        let secondary = book(
            "opinion",
            vec![(dec!(0.48), dec!(100))],
            vec![(dec!(0.50), dec!(100))],
        );
        let with_fees = SpreadAnalyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: dec!(100),
                entry_side: Side::Buy,
                primary_fee: dec!(0.01),
                secondary_fee: dec!(0.01),
            },
        );
        let report = with_fees.quote().unwrap();
        // exit 0.48*0.99 - entry 0.42*1.01, over 0.42
        let expected = (dec!(0.48) * dec!(0.99) - dec!(0.42) * dec!(1.01)) / dec!(0.42);
        assert_eq!(report.net_spread, expected);
        assert!(report.net_spread < report.gross_spread);
    }

    #[test]
    fn thin_ladder_caps_executable_size() {
        let primary = book(
            "polymarket",
            vec![],
            vec![(dec!(0.42), dec!(100))],
        );
        let secondary = book(
            "opinion",
            vec![(dec!(0.48), dec!(40))],
            vec![],
        );
        let outcome = SpreadAnalyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: dec!(100),
                entry_side: Side::Buy,
                primary_fee: Decimal::ZERO,
                secondary_fee: Decimal::ZERO,
            },
        );
        assert_eq!(outcome.quote().unwrap().executable_size, dec!(40));
    }

    #[test]
    fn empty_ladder_yields_no_quote() {
        let primary = book("polymarket", vec![(dec!(0.40), dec!(10))], vec![]);
        let secondary = book(
            "opinion",
            vec![(dec!(0.48), dec!(100))],
            vec![(dec!(0.50), dec!(100))],
        );
        let outcome = SpreadAnalyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: dec!(10),
                entry_side: Side::Buy,
                primary_fee: Decimal::ZERO,
                secondary_fee: Decimal::ZERO,
            },
        );
        assert_eq!(outcome, SpreadOutcome::NoQuote);
    }

    #[test]
    fn sell_entry_mirrors_the_direction() {
        // Sell into primary bids at 0.52, buy back on secondary asks at 0.45.
        let primary = book(
            "polymarket",
            vec![(dec!(0.52), dec!(50))],
            vec![(dec!(0.54), dec!(50))],
        );
        let secondary = book(
            "opinion",
            vec![(dec!(0.43), dec!(50))],
            vec![(dec!(0.45), dec!(50))],
        );
        let outcome = SpreadAnalyzer.evaluate(
            &primary,
            &secondary,
            SpreadParams {
                notional: dec!(50),
                entry_side: Side::Sell,
                primary_fee: Decimal::ZERO,
                secondary_fee: Decimal::ZERO,
            },
        );
        let report = outcome.quote().unwrap();
        assert_eq!(report.gross_spread, (dec!(0.52) - dec!(0.45)) / dec!(0.52));
        assert!(report.net_spread > Decimal::ZERO);
    }
}
