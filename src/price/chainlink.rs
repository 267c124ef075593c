//! AggregatorV3 Price Feed
//!
//! Reads `latestRoundData()` from a Chainlink-compatible aggregator (Chainlink, Blocksense)
//! with a plain JSON-RPC `eth_call`. The call returns five 32-byte words:
//! `(roundId, answer, startedAt, updatedAt, answeredInRound)`.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{OracleFeed, OracleReading, PriceError};
use crate::units::normalize_answer;

/// `latestRoundData()` selector.
const LATEST_ROUND_DATA: &str = "0xfeaf968c";
const WORD: usize = 32;

/// Decoded `latestRoundData()` return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundData {
    pub round_id: u128,
    pub answer: i128,
    pub started_at: i64,
    pub updated_at: i64,
    pub answered_in_round: u128,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

pub struct ChainlinkFeed {
    client: Client,
    rpc_url: String,
    feed_address: String,
    decimals: u32,
    name: String,
}

impl ChainlinkFeed {
    pub fn new(rpc_url: &str, feed_address: &str, decimals: u32, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            feed_address: feed_address.to_string(),
            decimals,
            name: format!("aggregator:{}", feed_address.to_lowercase()),
        })
    }

    fn fetch_round_data(&self) -> Result<RoundData> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{
                "to": self.feed_address,
                "data": LATEST_ROUND_DATA
            }, "latest"],
            "id": 1
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .context("RPC request failed")?
            .json()
            .context("failed to parse RPC response")?;

        if let Some(err) = response.error {
            return Err(anyhow::anyhow!("RPC error: {}", err));
        }

        let result = response
            .result
            .ok_or_else(|| anyhow::anyhow!("no result in RPC response"))?;

        decode_round_data(&result)
    }
}

impl OracleFeed for ChainlinkFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn latest(&self) -> Result<OracleReading, PriceError> {
        let data = self
            .fetch_round_data()
            .map_err(|e| PriceError::unavailable(&self.name, format!("{:#}", e)))?;

        if data.answered_in_round < data.round_id {
            return Err(PriceError::unavailable(
                &self.name,
                format!(
                    "round {} answered in earlier round {}",
                    data.round_id, data.answered_in_round
                ),
            ));
        }

        let value = normalize_answer(data.answer, self.decimals).ok_or_else(|| {
            PriceError::unavailable(&self.name, format!("unusable answer {}", data.answer))
        })?;

        debug!(
            feed = %self.feed_address,
            round_id = data.round_id,
            value,
            updated_at = data.updated_at,
            "Aggregator round read"
        );

        Ok(OracleReading {
            value,
            updated_at: data.updated_at,
        })
    }
}

/// Decode the hex ABI return of `latestRoundData()`.
pub fn decode_round_data(result_hex: &str) -> Result<RoundData> {
    let bytes =
        hex::decode(result_hex.trim_start_matches("0x")).context("failed to decode hex response")?;

    if bytes.len() < 5 * WORD {
        return Err(anyhow::anyhow!("response too short: {} bytes", bytes.len()));
    }

    Ok(RoundData {
        round_id: word_u128(&bytes, 0),
        answer: word_i128(&bytes, 1),
        started_at: word_u64(&bytes, 2) as i64,
        updated_at: word_u64(&bytes, 3) as i64,
        answered_in_round: word_u128(&bytes, 4),
    })
}

fn word(bytes: &[u8], index: usize) -> &[u8] {
    &bytes[index * WORD..(index + 1) * WORD]
}

fn word_u128(bytes: &[u8], index: usize) -> u128 {
    let w = word(bytes, index);
    u128::from_be_bytes(w[16..32].try_into().unwrap_or([0; 16]))
}

// int256 answers are sign-extended, the low 16 bytes keep two's complement intact.
fn word_i128(bytes: &[u8], index: usize) -> i128 {
    let w = word(bytes, index);
    i128::from_be_bytes(w[16..32].try_into().unwrap_or([0; 16]))
}

fn word_u64(bytes: &[u8], index: usize) -> u64 {
    let w = word(bytes, index);
    u64::from_be_bytes(w[24..32].try_into().unwrap_or([0; 8]))
}
