//! Application Configuration
//!
//! Built-in defaults, then an optional TOML file, then environment overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::models::Address;
use crate::price::SpotApi;
use crate::settlement::NoWinnerPolicy;
use crate::sync::{Backoff, RetryPolicy};
use crate::units::{parse_fixed, PriceE8, PRICE_DECIMALS};

/// Blocksense BTC/USDT aggregator on the default network.
pub const DEFAULT_FEED_ADDRESS: &str = "0x25ef0a9b5041b2Cd96dcb1692B8C553aB2780BA3";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub game: GameConfig,
    pub oracle: OracleConfig,
    pub keeper: KeeperConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub round_duration_secs: i64,
    pub max_price_age_secs: i64,
    pub no_winner_policy: NoWinnerPolicy,
    /// Only this identity may withdraw from the pool. Unset disables withdrawals.
    pub pool_owner: Option<Address>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_duration_secs: 900,
            max_price_age_secs: 1800,
            no_winner_policy: NoWinnerPolicy::RetainInPool,
            pool_owner: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub rpc_url: String,
    pub feed_address: String,
    pub feed_decimals: u32,
    pub request_timeout_ms: u64,
    pub spot_fallbacks: Vec<SpotApi>,
    /// Display price of last resort, 8 decimals.
    pub default_price: PriceE8,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://rpc.testnet.citrea.xyz".to_string(),
            feed_address: DEFAULT_FEED_ADDRESS.to_string(),
            feed_decimals: PRICE_DECIMALS,
            request_timeout_ms: 5_000,
            spot_fallbacks: SpotApi::ALL.to_vec(),
            default_price: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub min_poll_gap_secs: u64,
    pub initial_delay_secs: u64,
    pub transition_delay_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            min_poll_gap_secs: 30,
            initial_delay_secs: 10,
            transition_delay_secs: 5,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_addr: String,
    /// Bearer token for owner-only routes. Unset disables them.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0:3000".to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "roundbet_ledger.db".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, optionally overlaid by a TOML file, then by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay environment variables. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let game = &mut self.game;
        set_parsed(&var, "ROUND_DURATION_SECS", &mut game.round_duration_secs);
        set_parsed(&var, "MAX_PRICE_AGE_SECS", &mut game.max_price_age_secs);
        set_parsed(&var, "NO_WINNER_POLICY", &mut game.no_winner_policy);
        if let Some(v) = var("POOL_OWNER") {
            match Address::parse(&v) {
                Some(owner) => game.pool_owner = Some(owner),
                None => warn!(key = "POOL_OWNER", value = %v, "Ignoring invalid env override"),
            }
        }

        let oracle = &mut self.oracle;
        if let Some(v) = var("ORACLE_RPC_URL").filter(|v| !v.trim().is_empty()) {
            oracle.rpc_url = v;
        }
        if let Some(v) = var("ORACLE_FEED_ADDRESS").filter(|v| !v.trim().is_empty()) {
            oracle.feed_address = v;
        }
        set_parsed(&var, "ORACLE_FEED_DECIMALS", &mut oracle.feed_decimals);
        set_parsed(&var, "ORACLE_TIMEOUT_MS", &mut oracle.request_timeout_ms);
        if let Some(v) = var("SPOT_FALLBACKS") {
            let parsed: Result<Vec<SpotApi>, String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(apis) => oracle.spot_fallbacks = apis,
                Err(e) => warn!(key = "SPOT_FALLBACKS", error = %e, "Ignoring invalid env override"),
            }
        }
        if let Some(v) = var("DEFAULT_PRICE") {
            match parse_fixed(&v, 0) {
                Some(price) => oracle.default_price = price,
                None => warn!(key = "DEFAULT_PRICE", value = %v, "Ignoring invalid env override"),
            }
        }

        let keeper = &mut self.keeper;
        set_flag(&var, "KEEPER_ENABLED", &mut keeper.enabled);
        set_parsed(&var, "KEEPER_POLL_INTERVAL_SECS", &mut keeper.poll_interval_secs);
        set_parsed(&var, "KEEPER_MIN_POLL_GAP_SECS", &mut keeper.min_poll_gap_secs);
        set_parsed(&var, "KEEPER_INITIAL_DELAY_SECS", &mut keeper.initial_delay_secs);
        set_parsed(&var, "KEEPER_TRANSITION_DELAY_SECS", &mut keeper.transition_delay_secs);
        set_parsed(&var, "KEEPER_RETRY_DELAY_SECS", &mut keeper.retry.delay_secs);
        set_parsed(&var, "KEEPER_RETRY_MAX_ATTEMPTS", &mut keeper.retry.max_attempts);
        set_parsed(&var, "KEEPER_RETRY_BACKOFF", &mut keeper.retry.backoff);

        set_flag(&var, "API_ENABLED", &mut self.server.enabled);
        if let Some(v) = var("API_BIND_ADDR").filter(|v| !v.trim().is_empty()) {
            self.server.bind_addr = v;
        }
        if let Some(v) = var("API_ADMIN_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.server.admin_token = Some(v.trim().to_string());
        }
        if let Some(v) = var("LEDGER_DB_PATH").filter(|v| !v.trim().is_empty()) {
            self.storage.db_path = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.game.round_duration_secs <= 0 {
            bail!("round_duration_secs must be positive");
        }
        if self.game.max_price_age_secs <= 0 {
            bail!("max_price_age_secs must be positive");
        }
        if self.oracle.request_timeout_ms == 0 {
            bail!("oracle request_timeout_ms must be positive");
        }
        if self.keeper.poll_interval_secs == 0 {
            bail!("keeper poll_interval_secs must be positive");
        }
        if self.keeper.retry.max_attempts == 0 {
            bail!("keeper retry max_attempts must be at least 1");
        }
        if self.keeper.transition_delay_secs >= self.keeper.poll_interval_secs {
            bail!(
                "keeper transition_delay_secs ({}) must be shorter than poll_interval_secs ({})",
                self.keeper.transition_delay_secs,
                self.keeper.poll_interval_secs
            );
        }
        Ok(())
    }
}

fn set_parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(v) = var(key) {
        match v.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %v, "Ignoring invalid env override"),
        }
    }
}

fn set_flag(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(v) = var(key) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => warn!(key, value = %v, "Ignoring invalid env override"),
        }
    }
}
