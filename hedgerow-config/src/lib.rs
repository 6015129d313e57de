//! Layered configuration loading utilities.
//!
//! Sources (lowest to highest precedence):
//! 1. `config/default.toml`
//! 2. `config/{environment}.toml` (if an environment name is given)
//! 3. `config/local.toml` (optional, ignored in git)
//! 4. Environment variables prefixed with `HEDGEROW__`
//!
//! The resulting [`AppConfig`] is built once at startup and validated;
//! unknown keys are rejected at deserialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use hedgerow_core::{FeeSchedule, MarketPair, PairLeg, Venue};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no accounts loaded")]
    NoAccounts,
    #[error("no enabled market pairs")]
    NoEnabledPairs,
}

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default)]
    pub market_hedge_mode: MarketHedgeConfig,
    #[serde(default)]
    pub double_limit_enabled: bool,
    #[serde(default = "default_true")]
    pub allow_partial_hedge: bool,
    #[serde(default)]
    pub multi_leg_enabled: bool,
    /// Relative child weights used when a hedge is split into legs.
    #[serde(default)]
    pub multi_leg_children: Vec<Decimal>,
    #[serde(default = "default_hedge_max_retries")]
    pub hedge_max_retries: u32,
    #[serde(default = "default_place_max_retries")]
    pub place_max_retries: u32,
    pub exchanges: ExchangeRoutingConfig,
    #[serde(default)]
    pub market_pairs: Vec<MarketPairConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub fees: HashMap<String, FeeSchedule>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub connectivity: HashMap<String, ConnectivityConfig>,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Knobs of the spread-triggered hedging strategy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketHedgeConfig {
    #[serde(default = "default_hedge_ratio")]
    pub hedge_ratio: Decimal,
    /// Maximum tolerated hedge-leg slippage, as a fraction of top-of-book.
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    #[serde(default)]
    pub min_spread_for_entry: Decimal,
    /// Resting orders are pulled once the spread decays below this.
    #[serde(default)]
    pub cancel_spread: Decimal,
    #[serde(default = "default_max_order_age_ms")]
    pub max_order_age_ms: u64,
    /// Cap on projected gross exposure per account, in quote units.
    #[serde(default = "default_exposure_cap")]
    pub exposure_cap: Decimal,
    /// Cool-down after an incident before an account trades again.
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
    #[serde(default = "default_max_open_orders_per_pair")]
    pub max_open_orders_per_pair: u32,
    /// Fraction of the available balance an order may commit.
    #[serde(default = "default_balance_safety_margin")]
    pub balance_safety_margin: Decimal,
    /// Target size, in contracts, used for spread evaluation and entries.
    #[serde(default = "default_entry_size")]
    pub entry_size: Decimal,
}

impl Default for MarketHedgeConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: default_hedge_ratio(),
            max_slippage: default_max_slippage(),
            min_spread_for_entry: Decimal::ZERO,
            cancel_spread: Decimal::ZERO,
            max_order_age_ms: default_max_order_age_ms(),
            exposure_cap: default_exposure_cap(),
            cool_down_secs: default_cool_down_secs(),
            max_open_orders_per_pair: default_max_open_orders_per_pair(),
            balance_safety_margin: default_balance_safety_margin(),
            entry_size: default_entry_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeRoutingConfig {
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketPairConfig {
    pub pair_id: String,
    pub primary_market_id: String,
    pub secondary_market_id: String,
    #[serde(default)]
    pub primary_account_id: Option<String>,
    #[serde(default)]
    pub secondary_account_id: Option<String>,
    /// Pair-specific override of the routing in `[exchanges]`.
    #[serde(default)]
    pub primary_exchange: Option<String>,
    #[serde(default)]
    pub secondary_exchange: Option<String>,
    #[serde(default)]
    pub entry_size: Option<Decimal>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub dsn: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_tokens_per_sec")]
    pub tokens_per_sec: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_sec: default_tokens_per_sec(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectivityConfig {
    #[serde(default = "default_true")]
    pub use_websocket: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Silence on every fill source beyond this raises a stale incident.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            use_websocket: true,
            poll_interval_ms: default_poll_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Liveness message cadence; 0 disables the heartbeat.
    #[serde(default)]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub account_id: String,
    pub venue: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_tokens_per_sec")]
    pub tokens_per_sec: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_weight")]
    pub weight: Decimal,
}

impl AppConfig {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.market_hedge_mode.hedge_ratio <= Decimal::ZERO {
            return Err(ConfigError::Invalid("hedge_ratio must be positive".into()));
        }
        if self.market_hedge_mode.max_slippage < Decimal::ZERO {
            return Err(ConfigError::Invalid("max_slippage must not be negative".into()));
        }
        if self.market_hedge_mode.balance_safety_margin <= Decimal::ZERO
            || self.market_hedge_mode.balance_safety_margin > Decimal::ONE
        {
            return Err(ConfigError::Invalid(
                "balance_safety_margin must be in (0, 1]".into(),
            ));
        }
        if self.multi_leg_enabled && self.multi_leg_children.is_empty() {
            return Err(ConfigError::Invalid(
                "multi_leg_enabled requires multi_leg_children".into(),
            ));
        }
        if self
            .multi_leg_children
            .iter()
            .any(|child| *child <= Decimal::ZERO)
        {
            return Err(ConfigError::Invalid(
                "multi_leg_children must all be positive".into(),
            ));
        }
        if self.exchanges.primary.eq_ignore_ascii_case(&self.exchanges.secondary) {
            return Err(ConfigError::Invalid(
                "primary and secondary exchange must differ".into(),
            ));
        }
        if self.database.backend == DatabaseBackend::Postgres {
            return Err(ConfigError::Invalid(
                "database.backend = postgres is not available in this build".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for pair in &self.market_pairs {
            if !seen.insert(pair.pair_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate market pair '{}'",
                    pair.pair_id
                )));
            }
        }
        Ok(())
    }

    /// Accounts available for `venue`, preserving file order.
    pub fn accounts_for(&self, venue: &Venue) -> Vec<&AccountConfig> {
        self.accounts
            .iter()
            .filter(|account| Venue::new(&account.venue) == *venue)
            .collect()
    }

    /// Resolve the enabled pair configs into immutable [`MarketPair`] values,
    /// assigning each leg its preferred account or the first configured one
    /// for the venue.
    pub fn resolve_pairs(&self) -> Result<Vec<MarketPair>, ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        let mut pairs = Vec::new();
        for pair in self.market_pairs.iter().filter(|pair| pair.enabled) {
            let primary_venue = Venue::new(
                pair.primary_exchange
                    .as_deref()
                    .unwrap_or(&self.exchanges.primary),
            );
            let secondary_venue = Venue::new(
                pair.secondary_exchange
                    .as_deref()
                    .unwrap_or(&self.exchanges.secondary),
            );
            let primary_account =
                self.pick_account(&primary_venue, pair.primary_account_id.as_deref())?;
            let secondary_account =
                self.pick_account(&secondary_venue, pair.secondary_account_id.as_deref())?;
            pairs.push(MarketPair {
                pair_id: pair.pair_id.clone(),
                primary: PairLeg {
                    venue: primary_venue,
                    market_id: pair.primary_market_id.clone(),
                    account_id: primary_account.account_id.clone(),
                },
                secondary: PairLeg {
                    venue: secondary_venue,
                    market_id: pair.secondary_market_id.clone(),
                    account_id: secondary_account.account_id.clone(),
                },
            });
        }
        if pairs.is_empty() {
            return Err(ConfigError::NoEnabledPairs);
        }
        Ok(pairs)
    }

    fn pick_account(
        &self,
        venue: &Venue,
        preferred: Option<&str>,
    ) -> Result<&AccountConfig, ConfigError> {
        let pool = self.accounts_for(venue);
        if let Some(wanted) = preferred {
            if let Some(account) = pool.iter().find(|account| account.account_id == wanted) {
                return Ok(account);
            }
        }
        pool.first().copied().ok_or_else(|| {
            ConfigError::Invalid(format!("no accounts configured for venue '{venue}'"))
        })
    }

    /// Fee schedule for `venue`, zero when unconfigured.
    #[must_use]
    pub fn fees_for(&self, venue: &Venue) -> FeeSchedule {
        self.fees
            .iter()
            .find(|(name, _)| Venue::new(name.as_str()) == *venue)
            .map(|(_, schedule)| *schedule)
            .unwrap_or_default()
    }

    /// Connectivity settings for `venue`, defaults when unconfigured.
    #[must_use]
    pub fn connectivity_for(&self, venue: &Venue) -> ConnectivityConfig {
        self.connectivity
            .iter()
            .find(|(name, _)| Venue::new(name.as_str()) == *venue)
            .map(|(_, cfg)| *cfg)
            .unwrap_or_default()
    }

    /// Rate-limit budget for `venue`, defaults when unconfigured.
    #[must_use]
    pub fn rate_limit_for(&self, venue: &Venue) -> RateLimitConfig {
        self.rate_limits
            .iter()
            .find(|(name, _)| Venue::new(name.as_str()) == *venue)
            .map(|(_, cfg)| *cfg)
            .unwrap_or_default()
    }
}

/// Load configuration by merging files and environment variables.
pub fn load_config(base_dir: &Path, env: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::from(base_dir.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_dir.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_dir.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("HEDGEROW")
            .separator("__")
            .ignore_empty(true),
    );
    let config = builder.build()?;
    let app: AppConfig = config.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_control_addr() -> String {
    "127.0.0.1:8090".into()
}

fn default_hedge_ratio() -> Decimal {
    Decimal::ONE
}

fn default_max_slippage() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_order_age_ms() -> u64 {
    60_000
}

fn default_exposure_cap() -> Decimal {
    Decimal::from(10_000u32)
}

fn default_cool_down_secs() -> u64 {
    300
}

fn default_max_open_orders_per_pair() -> u32 {
    2
}

fn default_balance_safety_margin() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_entry_size() -> Decimal {
    Decimal::from(10u8)
}

fn default_hedge_max_retries() -> u32 {
    2
}

fn default_place_max_retries() -> u32 {
    3
}

fn default_tokens_per_sec() -> u32 {
    5
}

fn default_burst() -> u32 {
    10
}

fn default_weight() -> Decimal {
    Decimal::ONE
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn minimal() -> AppConfig {
        AppConfig {
            dry_run: true,
            log_level: default_log_level(),
            log_path: None,
            metrics_addr: default_metrics_addr(),
            control_addr: default_control_addr(),
            market_hedge_mode: MarketHedgeConfig::default(),
            double_limit_enabled: false,
            allow_partial_hedge: true,
            multi_leg_enabled: false,
            multi_leg_children: Vec::new(),
            hedge_max_retries: 2,
            place_max_retries: 3,
            exchanges: ExchangeRoutingConfig {
                primary: "polymarket".into(),
                secondary: "opinion".into(),
            },
            market_pairs: vec![MarketPairConfig {
                pair_id: "ev-1".into(),
                primary_market_id: "pm-1".into(),
                secondary_market_id: "op-1".into(),
                primary_account_id: None,
                secondary_account_id: None,
                primary_exchange: None,
                secondary_exchange: None,
                entry_size: None,
                enabled: true,
            }],
            database: DatabaseConfig {
                backend: DatabaseBackend::Sqlite,
                dsn: ":memory:".into(),
            },
            fees: HashMap::new(),
            rate_limits: HashMap::new(),
            connectivity: HashMap::new(),
            telegram: TelegramConfig::default(),
            accounts: vec![
                AccountConfig {
                    account_id: "pm-acct".into(),
                    venue: "polymarket".into(),
                    api_key: String::new(),
                    api_secret: String::new(),
                    proxy: None,
                    tokens_per_sec: 5,
                    burst: 10,
                    weight: Decimal::ONE,
                },
                AccountConfig {
                    account_id: "op-acct".into(),
                    venue: "opinion".into(),
                    api_key: String::new(),
                    api_secret: String::new(),
                    proxy: None,
                    tokens_per_sec: 5,
                    burst: 10,
                    weight: Decimal::ONE,
                },
            ],
        }
    }

    #[test]
    fn minimal_config_validates() {
        let cfg = minimal();
        cfg.validate().unwrap();
        let pairs = cfg.resolve_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].primary.account_id, "pm-acct");
        assert_eq!(pairs[0].secondary.venue, Venue::new("opinion"));
    }

    #[test]
    fn postgres_backend_is_rejected() {
        let mut cfg = minimal();
        cfg.database.backend = DatabaseBackend::Postgres;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn no_accounts_is_a_distinct_error() {
        let mut cfg = minimal();
        cfg.accounts.clear();
        assert!(matches!(cfg.resolve_pairs(), Err(ConfigError::NoAccounts)));
    }

    #[test]
    fn disabled_pairs_are_skipped() {
        let mut cfg = minimal();
        cfg.market_pairs[0].enabled = false;
        assert!(matches!(
            cfg.resolve_pairs(),
            Err(ConfigError::NoEnabledPairs)
        ));
    }

    #[test]
    fn multi_leg_requires_children() {
        let mut cfg = minimal();
        cfg.multi_leg_enabled = true;
        assert!(cfg.validate().is_err());
        cfg.multi_leg_children = vec![dec!(0.5), dec!(0.5)];
        cfg.validate().unwrap();
    }

    #[test]
    fn preferred_account_wins_over_pool_order() {
        let mut cfg = minimal();
        cfg.accounts.push(AccountConfig {
            account_id: "pm-alt".into(),
            venue: "Polymarket".into(),
            api_key: String::new(),
            api_secret: String::new(),
            proxy: None,
            tokens_per_sec: 5,
            burst: 10,
            weight: Decimal::ONE,
        });
        cfg.market_pairs[0].primary_account_id = Some("pm-alt".into());
        let pairs = cfg.resolve_pairs().unwrap();
        assert_eq!(pairs[0].primary.account_id, "pm-alt");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = serde_json::json!({
            "exchanges": {"primary": "a", "secondary": "b"},
            "database": {"backend": "sqlite", "dsn": ":memory:"},
            "surprise": true,
        });
        let parsed: Result<AppConfig, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }
}
