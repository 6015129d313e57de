//! Pre-trade risk gating.

use chrono::{DateTime, Duration, Utc};
use hedgerow_core::Price;
use rust_decimal::Decimal;
use serde::Serialize;

/// Static limits, built once from configuration.
#[derive(Clone, Debug)]
pub struct RiskLimits {
    /// Cap on projected gross exposure per account, in quote units.
    pub exposure_cap: Decimal,
    pub max_open_orders_per_pair: u32,
    /// Fraction of the available balance an order may commit.
    pub balance_safety_margin: Decimal,
    /// Ceiling on predicted entry slippage.
    pub max_slippage: Decimal,
    /// How long an account sits out after an incident.
    pub cool_down: Duration,
}

/// Mutable account view assembled by the caller at evaluation time.
#[derive(Clone, Debug)]
pub struct AccountState {
    pub account_id: String,
    pub available_balance: Price,
    /// Exposure already committed to resting and in-flight orders.
    pub gross_exposure: Decimal,
    pub open_orders_in_pair: u32,
    /// Set when a recent incident put the account in cool-down.
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// The order the gate is asked to approve.
#[derive(Clone, Debug)]
pub struct ProposedOrder {
    pub pair_id: String,
    /// `requested_size × price` in quote units.
    pub notional: Decimal,
    pub predicted_slippage: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    CoolDown,
    ExposureCap,
    OpenOrderCap,
    InsufficientBalance,
    Slippage,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::CoolDown => "account in cool-down",
            Self::ExposureCap => "projected exposure exceeds cap",
            Self::OpenOrderCap => "per-pair open order cap reached",
            Self::InsufficientBalance => "order notional exceeds safe balance",
            Self::Slippage => "predicted slippage above ceiling",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Pure, idempotent pre-trade gate. Checks run in a fixed order; the first
/// failing check wins.
#[derive(Clone, Debug)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    #[must_use]
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    #[must_use]
    pub fn evaluate(
        &self,
        account: &AccountState,
        proposed: &ProposedOrder,
        now: DateTime<Utc>,
    ) -> Verdict {
        if let Some(until) = account.cooldown_until {
            if now < until {
                return Verdict::Deny(DenyReason::CoolDown);
            }
        }
        if account.gross_exposure + proposed.notional > self.limits.exposure_cap {
            return Verdict::Deny(DenyReason::ExposureCap);
        }
        if account.open_orders_in_pair >= self.limits.max_open_orders_per_pair {
            return Verdict::Deny(DenyReason::OpenOrderCap);
        }
        if proposed.notional > account.available_balance * self.limits.balance_safety_margin {
            return Verdict::Deny(DenyReason::InsufficientBalance);
        }
        if proposed.predicted_slippage > self.limits.max_slippage {
            return Verdict::Deny(DenyReason::Slippage);
        }
        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            exposure_cap: dec!(1000),
            max_open_orders_per_pair: 2,
            balance_safety_margin: dec!(0.95),
            max_slippage: dec!(0.01),
            cool_down: Duration::seconds(300),
        }
    }

    fn account() -> AccountState {
        AccountState {
            account_id: "acct".into(),
            available_balance: dec!(500),
            gross_exposure: dec!(100),
            open_orders_in_pair: 0,
            cooldown_until: None,
        }
    }

    fn proposal(notional: Decimal) -> ProposedOrder {
        ProposedOrder {
            pair_id: "ev-1".into(),
            notional,
            predicted_slippage: dec!(0.001),
        }
    }

    #[test]
    fn clean_order_is_allowed() {
        let manager = RiskManager::new(limits());
        let verdict = manager.evaluate(&account(), &proposal(dec!(42)), Utc::now());
        assert!(verdict.is_allowed());
    }

    #[test]
    fn cooldown_wins_over_every_other_check() {
        let manager = RiskManager::new(limits());
        let mut state = account();
        state.cooldown_until = Some(Utc::now() + Duration::seconds(60));
        // This order would also blow the exposure cap; cool-down reports first.
        let verdict = manager.evaluate(&state, &proposal(dec!(5000)), Utc::now());
        assert_eq!(verdict, Verdict::Deny(DenyReason::CoolDown));
    }

    #[test]
    fn expired_cooldown_is_ignored() {
        let manager = RiskManager::new(limits());
        let mut state = account();
        state.cooldown_until = Some(Utc::now() - Duration::seconds(1));
        assert!(manager
            .evaluate(&state, &proposal(dec!(42)), Utc::now())
            .is_allowed());
    }

    #[test]
    fn exposure_cap_considers_existing_exposure() {
        let manager = RiskManager::new(limits());
        let verdict = manager.evaluate(&account(), &proposal(dec!(901)), Utc::now());
        assert_eq!(verdict, Verdict::Deny(DenyReason::ExposureCap));
    }

    #[test]
    fn open_order_cap_applies_per_pair() {
        let manager = RiskManager::new(limits());
        let mut state = account();
        state.open_orders_in_pair = 2;
        let verdict = manager.evaluate(&state, &proposal(dec!(10)), Utc::now());
        assert_eq!(verdict, Verdict::Deny(DenyReason::OpenOrderCap));
    }

    #[test]
    fn balance_check_applies_safety_margin() {
        let manager = RiskManager::new(limits());
        // 500 * 0.95 = 475
        let verdict = manager.evaluate(&account(), &proposal(dec!(480)), Utc::now());
        assert_eq!(verdict, Verdict::Deny(DenyReason::InsufficientBalance));
    }

    #[test]
    fn slippage_is_the_last_check() {
        let manager = RiskManager::new(limits());
        let mut proposed = proposal(dec!(42));
        proposed.predicted_slippage = dec!(0.02);
        let verdict = manager.evaluate(&account(), &proposed, Utc::now());
        assert_eq!(verdict, Verdict::Deny(DenyReason::Slippage));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let manager = RiskManager::new(limits());
        let state = account();
        let proposed = proposal(dec!(42));
        let now = Utc::now();
        assert_eq!(
            manager.evaluate(&state, &proposed, now),
            manager.evaluate(&state, &proposed, now)
        );
    }
}
