//! Account selection and per-account bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use hedgerow_core::{AccountId, Price, Venue};
use hedgerow_venue::{AccountLimiter, LimiterError};
use rust_decimal::Decimal;
use tracing::warn;

use crate::risk::AccountState;

/// Static description of one configured account.
#[derive(Clone, Debug)]
pub struct AccountSpec {
    pub account_id: AccountId,
    pub venue: Venue,
    pub tokens_per_sec: u32,
    pub burst: u32,
    pub weight: Decimal,
}

/// Immutable per-account handle: identity plus its rate limiter.
#[derive(Debug)]
pub struct AccountHandle {
    pub account_id: AccountId,
    pub venue: Venue,
    pub limiter: AccountLimiter,
    pub weight: Decimal,
}

#[derive(Debug, Default)]
struct AccountBook {
    gross_exposure: Decimal,
    open_by_pair: HashMap<String, u32>,
    cooldown_until: Option<DateTime<Utc>>,
}

/// Owns every account handle and the mutable bookkeeping the risk gate
/// reads: committed exposure, open-order counts and cool-down windows.
pub struct AccountPool {
    handles: HashMap<AccountId, Arc<AccountHandle>>,
    by_venue: HashMap<Venue, Vec<AccountId>>,
    books: Mutex<HashMap<AccountId, AccountBook>>,
    rr_cursor: Mutex<HashMap<Venue, usize>>,
}

impl AccountPool {
    pub fn new(specs: Vec<AccountSpec>) -> Result<Self, LimiterError> {
        let mut handles = HashMap::new();
        let mut by_venue: HashMap<Venue, Vec<AccountId>> = HashMap::new();
        let mut books = HashMap::new();
        for spec in specs {
            let limiter = AccountLimiter::new(spec.tokens_per_sec, spec.burst)?;
            by_venue
                .entry(spec.venue.clone())
                .or_default()
                .push(spec.account_id.clone());
            books.insert(spec.account_id.clone(), AccountBook::default());
            handles.insert(
                spec.account_id.clone(),
                Arc::new(AccountHandle {
                    account_id: spec.account_id,
                    venue: spec.venue,
                    limiter,
                    weight: spec.weight,
                }),
            );
        }
        Ok(Self {
            handles,
            by_venue,
            books: Mutex::new(books),
            rr_cursor: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn handle(&self, account_id: &str) -> Option<Arc<AccountHandle>> {
        self.handles.get(account_id).cloned()
    }

    /// Select an account for `venue`: the preferred id when it exists, else
    /// round-robin over the venue's pool to spread load.
    pub fn select(&self, venue: &Venue, preferred: Option<&str>) -> Option<Arc<AccountHandle>> {
        if let Some(wanted) = preferred {
            if let Some(handle) = self.handles.get(wanted) {
                return Some(handle.clone());
            }
            warn!(account_id = wanted, %venue, "preferred account missing; falling back");
        }
        let pool = self.by_venue.get(venue)?;
        if pool.is_empty() {
            return None;
        }
        let mut cursors = self.rr_cursor.lock().unwrap();
        let cursor = cursors.entry(venue.clone()).or_insert(0);
        let account_id = &pool[*cursor % pool.len()];
        *cursor = (*cursor + 1) % pool.len();
        self.handles.get(account_id).cloned()
    }

    /// Commit exposure for an order about to be placed.
    pub fn reserve(&self, account_id: &str, pair_id: &str, notional: Decimal) {
        let mut books = self.books.lock().unwrap();
        let book = books.entry(account_id.to_string()).or_default();
        book.gross_exposure += notional;
        *book.open_by_pair.entry(pair_id.to_string()).or_insert(0) += 1;
    }

    /// Return filled exposure to the book; the open-order count is
    /// untouched (the order may still be resting).
    pub fn release_exposure(&self, account_id: &str, notional: Decimal) {
        let mut books = self.books.lock().unwrap();
        let book = books.entry(account_id.to_string()).or_default();
        book.gross_exposure = (book.gross_exposure - notional).max(Decimal::ZERO);
    }

    /// Retire a terminal order: drop its open-order slot and return the
    /// exposure of its unfilled remainder.
    pub fn close_order(&self, account_id: &str, pair_id: &str, remaining_notional: Decimal) {
        let mut books = self.books.lock().unwrap();
        let book = books.entry(account_id.to_string()).or_default();
        book.gross_exposure = (book.gross_exposure - remaining_notional).max(Decimal::ZERO);
        if let Some(count) = book.open_by_pair.get_mut(pair_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Put the account in cool-down after an incident.
    pub fn begin_cooldown(&self, account_id: &str, duration: Duration) {
        let mut books = self.books.lock().unwrap();
        let book = books.entry(account_id.to_string()).or_default();
        book.cooldown_until = Some(Utc::now() + duration);
    }

    /// Assemble the risk-gate view of an account. The balance is supplied by
    /// the caller, fetched from the venue at evaluation time.
    #[must_use]
    pub fn state_for(
        &self,
        account_id: &str,
        pair_id: &str,
        available_balance: Price,
    ) -> AccountState {
        let books = self.books.lock().unwrap();
        let book = books.get(account_id);
        AccountState {
            account_id: account_id.to_string(),
            available_balance,
            gross_exposure: book.map(|book| book.gross_exposure).unwrap_or_default(),
            open_orders_in_pair: book
                .and_then(|book| book.open_by_pair.get(pair_id).copied())
                .unwrap_or(0),
            cooldown_until: book.and_then(|book| book.cooldown_until),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pool() -> AccountPool {
        AccountPool::new(vec![
            AccountSpec {
                account_id: "pm-1".into(),
                venue: Venue::new("polymarket"),
                tokens_per_sec: 5,
                burst: 10,
                weight: Decimal::ONE,
            },
            AccountSpec {
                account_id: "pm-2".into(),
                venue: Venue::new("polymarket"),
                tokens_per_sec: 5,
                burst: 10,
                weight: Decimal::ONE,
            },
            AccountSpec {
                account_id: "op-1".into(),
                venue: Venue::new("opinion"),
                tokens_per_sec: 5,
                burst: 10,
                weight: Decimal::ONE,
            },
        ])
        .unwrap()
    }

    #[test]
    fn preferred_account_is_honored() {
        let pool = pool();
        let handle = pool
            .select(&Venue::new("polymarket"), Some("pm-2"))
            .unwrap();
        assert_eq!(handle.account_id, "pm-2");
    }

    #[test]
    fn round_robin_cycles_the_venue_pool() {
        let pool = pool();
        let venue = Venue::new("polymarket");
        let first = pool.select(&venue, None).unwrap();
        let second = pool.select(&venue, None).unwrap();
        let third = pool.select(&venue, None).unwrap();
        assert_ne!(first.account_id, second.account_id);
        assert_eq!(first.account_id, third.account_id);
    }

    #[test]
    fn missing_preferred_falls_back_to_pool() {
        let pool = pool();
        let handle = pool.select(&Venue::new("opinion"), Some("ghost")).unwrap();
        assert_eq!(handle.account_id, "op-1");
    }

    #[test]
    fn exposure_reserve_and_release_balance_out() {
        let pool = pool();
        pool.reserve("pm-1", "ev-1", dec!(100));
        pool.reserve("pm-1", "ev-1", dec!(50));
        let state = pool.state_for("pm-1", "ev-1", dec!(1000));
        assert_eq!(state.gross_exposure, dec!(150));
        assert_eq!(state.open_orders_in_pair, 2);

        // A partial fill returns exposure but keeps the order slot open.
        pool.release_exposure("pm-1", dec!(40));
        let state = pool.state_for("pm-1", "ev-1", dec!(1000));
        assert_eq!(state.gross_exposure, dec!(110));
        assert_eq!(state.open_orders_in_pair, 2);

        pool.close_order("pm-1", "ev-1", dec!(60));
        let state = pool.state_for("pm-1", "ev-1", dec!(1000));
        assert_eq!(state.gross_exposure, dec!(50));
        assert_eq!(state.open_orders_in_pair, 1);

        // Closing with more than remains clamps at zero.
        pool.close_order("pm-1", "ev-1", dec!(500));
        let state = pool.state_for("pm-1", "ev-1", dec!(1000));
        assert_eq!(state.gross_exposure, Decimal::ZERO);
        assert_eq!(state.open_orders_in_pair, 0);
    }

    #[test]
    fn cooldown_shows_up_in_account_state() {
        let pool = pool();
        pool.begin_cooldown("op-1", Duration::seconds(300));
        let state = pool.state_for("op-1", "ev-1", dec!(1000));
        assert!(state.cooldown_until.unwrap() > Utc::now());
    }
}
