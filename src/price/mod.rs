//! Price Source
//!
//! Wraps the oracle capability `latest() -> (value, updated_at)` and classifies readings by age.
//!
//! - [`PriceSource::get_price`] is strict: the primary feed must answer with a reading no older
//!   than `max_price_age_secs`. Round finalization only ever uses this path.
//! - [`PriceSource::get_price_with_fallback`] never fails: primary, then each fallback feed in
//!   order, then the last good reading, then a configured default. Display only.

pub mod chainlink;
pub mod manual;
pub mod spot;

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::OracleConfig;
use crate::units::PriceE8;

pub use chainlink::ChainlinkFeed;
pub use manual::ManualFeed;
pub use spot::{SpotApi, SpotFeed};

/// A normalised oracle answer: 8-decimal price plus the feed's own update time (Unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OracleReading {
    pub value: PriceE8,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// The feed call failed or returned an unusable answer.
    Unavailable { source: String, reason: String },
    /// The feed answered, but its `updated_at` is older than allowed.
    Stale { age_secs: i64, max_age_secs: i64 },
}

impl PriceError {
    pub fn unavailable(source: &str, reason: impl ToString) -> Self {
        Self::Unavailable {
            source: source.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for PriceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { source, reason } => write!(f, "{}: {}", source, reason),
            Self::Stale {
                age_secs,
                max_age_secs,
            } => write!(f, "reading is {}s old (max {}s)", age_secs, max_age_secs),
        }
    }
}

impl std::error::Error for PriceError {}

/// Oracle feed capability. Implementations block for at most their request timeout.
pub trait OracleFeed: Send + Sync {
    fn name(&self) -> &str;

    fn latest(&self) -> Result<OracleReading, PriceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { age_secs: i64 },
    Stale { age_secs: i64 },
}

/// Classify a reading at `now`. Readings stamped in the future count as age zero.
pub fn classify(reading: &OracleReading, now: i64, max_age_secs: i64) -> Freshness {
    let age_secs = (now - reading.updated_at).max(0);
    if age_secs > max_age_secs {
        Freshness::Stale { age_secs }
    } else {
        Freshness::Fresh { age_secs }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum PriceOrigin {
    Primary,
    Fallback(String),
    LastKnownGood,
    Default,
}

/// Result of the degrading read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayPrice {
    pub value: PriceE8,
    pub updated_at: Option<i64>,
    pub origin: PriceOrigin,
}

pub struct PriceSource {
    primary: Arc<dyn OracleFeed>,
    fallbacks: Vec<Arc<dyn OracleFeed>>,
    clock: Arc<dyn Clock>,
    max_price_age_secs: i64,
    default_price: PriceE8,
    last_good: RwLock<Option<OracleReading>>,
}

impl PriceSource {
    pub fn new(primary: Arc<dyn OracleFeed>, clock: Arc<dyn Clock>, max_price_age_secs: i64) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            clock,
            max_price_age_secs,
            default_price: 0,
            last_good: RwLock::new(None),
        }
    }

    pub fn with_fallback(mut self, feed: Arc<dyn OracleFeed>) -> Self {
        self.fallbacks.push(feed);
        self
    }

    pub fn with_default_price(mut self, price: PriceE8) -> Self {
        self.default_price = price;
        self
    }

    /// Chainlink-style primary plus the configured spot fallbacks.
    pub fn from_config(
        cfg: &OracleConfig,
        clock: Arc<dyn Clock>,
        max_price_age_secs: i64,
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(cfg.request_timeout_ms);
        let primary = ChainlinkFeed::new(&cfg.rpc_url, &cfg.feed_address, cfg.feed_decimals, timeout)?;
        let mut source = Self::new(Arc::new(primary), clock.clone(), max_price_age_secs)
            .with_default_price(cfg.default_price);
        for api in &cfg.spot_fallbacks {
            source = source.with_fallback(Arc::new(SpotFeed::new(*api, clock.clone(), timeout)?));
        }
        Ok(source)
    }

    /// Strict read used for round start and finalization.
    pub fn get_price(&self) -> Result<OracleReading, PriceError> {
        let reading = self.primary.latest()?;
        self.ensure_fresh(&reading, self.clock.now())?;
        self.remember(reading);
        Ok(reading)
    }

    /// Re-check a previously fetched reading against `now`.
    pub fn ensure_fresh(&self, reading: &OracleReading, now: i64) -> Result<(), PriceError> {
        match classify(reading, now, self.max_price_age_secs) {
            Freshness::Fresh { .. } => Ok(()),
            Freshness::Stale { age_secs } => Err(PriceError::Stale {
                age_secs,
                max_age_secs: self.max_price_age_secs,
            }),
        }
    }

    /// Degrading read for display. Never fails.
    pub fn get_price_with_fallback(&self) -> DisplayPrice {
        match self.get_price() {
            Ok(reading) => {
                return DisplayPrice {
                    value: reading.value,
                    updated_at: Some(reading.updated_at),
                    origin: PriceOrigin::Primary,
                }
            }
            Err(e) => debug!(source = self.primary.name(), error = %e, "Primary price unusable"),
        }

        let now = self.clock.now();
        for feed in &self.fallbacks {
            let reading = match feed.latest() {
                Ok(r) => r,
                Err(e) => {
                    debug!(source = feed.name(), error = %e, "Fallback price failed");
                    continue;
                }
            };
            if let Err(e) = self.ensure_fresh(&reading, now) {
                debug!(source = feed.name(), error = %e, "Fallback price stale");
                continue;
            }
            self.remember(reading);
            return DisplayPrice {
                value: reading.value,
                updated_at: Some(reading.updated_at),
                origin: PriceOrigin::Fallback(feed.name().to_string()),
            };
        }

        if let Some(reading) = *self.last_good.read() {
            warn!(
                updated_at = reading.updated_at,
                "All price sources failed, serving last known good price"
            );
            return DisplayPrice {
                value: reading.value,
                updated_at: Some(reading.updated_at),
                origin: PriceOrigin::LastKnownGood,
            };
        }

        warn!("All price sources failed and no price seen yet, serving default");
        DisplayPrice {
            value: self.default_price,
            updated_at: None,
            origin: PriceOrigin::Default,
        }
    }

    pub fn last_known_good(&self) -> Option<OracleReading> {
        *self.last_good.read()
    }

    fn remember(&self, reading: OracleReading) {
        let mut last = self.last_good.write();
        let newer = last.map_or(true, |prev| reading.updated_at >= prev.updated_at);
        if newer {
            *last = Some(reading);
        }
    }
}
