//! Spot price aggregators used as fallback sources.
//!
//! Public REST quotes carry no update time of their own, so a reading is stamped with
//! the clock time at which it was fetched.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{OracleFeed, OracleReading, PriceError};
use crate::clock::Clock;
use crate::units::{parse_fixed, PriceE8, PRICE_DECIMALS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotApi {
    CoinDesk,
    CoinGecko,
    Coinbase,
}

impl SpotApi {
    /// Default fallback order.
    pub const ALL: [SpotApi; 3] = [SpotApi::CoinDesk, SpotApi::CoinGecko, SpotApi::Coinbase];

    pub fn name(&self) -> &'static str {
        match self {
            SpotApi::CoinDesk => "coindesk",
            SpotApi::CoinGecko => "coingecko",
            SpotApi::Coinbase => "coinbase",
        }
    }

    pub fn url(&self) -> &'static str {
        match self {
            SpotApi::CoinDesk => "https://api.coindesk.com/v1/bpi/currentprice/USD.json",
            SpotApi::CoinGecko => {
                "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd"
            }
            SpotApi::Coinbase => "https://api.coinbase.com/v2/exchange-rates?currency=BTC",
        }
    }

    fn pointer(&self) -> &'static str {
        match self {
            SpotApi::CoinDesk => "/bpi/USD/rate",
            SpotApi::CoinGecko => "/bitcoin/usd",
            SpotApi::Coinbase => "/data/rates/USD",
        }
    }

    /// Pull the BTC/USD quote out of the API's JSON body as an 8-decimal price.
    pub fn extract(&self, body: &Value) -> Option<PriceE8> {
        let raw = match body.pointer(self.pointer())? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        parse_fixed(&raw, PRICE_DECIMALS).filter(|p| *p > 0)
    }
}

impl FromStr for SpotApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coindesk" => Ok(SpotApi::CoinDesk),
            "coingecko" => Ok(SpotApi::CoinGecko),
            "coinbase" => Ok(SpotApi::Coinbase),
            other => Err(format!("unknown spot api: {}", other)),
        }
    }
}

pub struct SpotFeed {
    api: SpotApi,
    client: Client,
    clock: Arc<dyn Clock>,
}

impl SpotFeed {
    pub fn new(api: SpotApi, clock: Arc<dyn Clock>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build spot HTTP client")?;
        Ok(Self { api, client, clock })
    }
}

impl OracleFeed for SpotFeed {
    fn name(&self) -> &str {
        self.api.name()
    }

    fn latest(&self) -> Result<OracleReading, PriceError> {
        let body: Value = self
            .client
            .get(self.api.url())
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| PriceError::unavailable(self.api.name(), e))?;

        let value = self
            .api
            .extract(&body)
            .ok_or_else(|| PriceError::unavailable(self.api.name(), "price missing from response"))?;

        Ok(OracleReading {
            value,
            updated_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_coindesk_string_with_commas() {
        let body = json!({"bpi": {"USD": {"rate": "61,000.1234", "rate_float": 61000.1234}}});
        assert_eq!(SpotApi::CoinDesk.extract(&body), Some(6_100_012_340_000));
    }

    #[test]
    fn test_extract_coingecko_number() {
        let body = json!({"bitcoin": {"usd": 60500}});
        assert_eq!(SpotApi::CoinGecko.extract(&body), Some(6_050_000_000_000));
    }

    #[test]
    fn test_extract_coinbase_rate() {
        let body = json!({"data": {"currency": "BTC", "rates": {"USD": "60999.995"}}});
        assert_eq!(SpotApi::Coinbase.extract(&body), Some(6_099_999_500_000));
    }

    #[test]
    fn test_extract_missing_or_bad() {
        assert_eq!(SpotApi::CoinGecko.extract(&json!({"bitcoin": {}})), None);
        assert_eq!(SpotApi::Coinbase.extract(&json!({"data": {"rates": {"USD": "n/a"}}})), None);
        assert_eq!(SpotApi::CoinGecko.extract(&json!({"bitcoin": {"usd": 0}})), None);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("CoinGecko".parse::<SpotApi>(), Ok(SpotApi::CoinGecko));
        assert!("kraken".parse::<SpotApi>().is_err());
    }
}
