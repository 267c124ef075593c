//! Core data model: rounds, stakes, identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::units::{Amount, PriceE8};

/// Identity of a bettor or pool operator (wallet address, normalised to lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn from_is_up(is_up: bool) -> Self {
        if is_up {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Direction::Up)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "higher" | "true" => Ok(Direction::Up),
            "down" | "lower" | "false" => Ok(Direction::Down),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed betting cycle.
///
/// `end_price` and `outcome` are `Some` exactly when `finalized` is true. Rounds are only
/// built through [`Round::open`] and [`Round::finalize`], which keep that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub start_price: PriceE8,
    pub end_price: Option<PriceE8>,
    pub outcome: Option<Direction>,
    pub finalized: bool,
    pub finalized_at: Option<i64>,
}

impl Round {
    pub fn open(id: u64, start_time: i64, duration_secs: i64, start_price: PriceE8) -> Self {
        Self {
            id,
            start_time,
            end_time: start_time + duration_secs,
            start_price,
            end_price: None,
            outcome: None,
            finalized: false,
            finalized_at: None,
        }
    }

    /// Finalized copy of this round. A flat round resolves Down (`end > start` is required for Up).
    pub fn finalize(&self, end_price: PriceE8, now: i64) -> Self {
        let mut closed = self.clone();
        closed.end_price = Some(end_price);
        closed.outcome = Some(Direction::from_is_up(end_price > self.start_price));
        closed.finalized = true;
        closed.finalized_at = Some(now);
        closed
    }

    pub fn outcome_is_up(&self) -> Option<bool> {
        self.outcome.map(|d| d.is_up())
    }

    pub fn phase(&self, now: i64) -> RoundPhase {
        if self.finalized {
            RoundPhase::Finalized
        } else if now >= self.end_time {
            RoundPhase::Expired
        } else {
            RoundPhase::Active
        }
    }

    pub fn needs_transition(&self, now: i64) -> bool {
        now >= self.end_time && !self.finalized
    }

    pub fn time_left(&self, now: i64) -> i64 {
        (self.end_time - now).max(0)
    }

    pub fn is_consistent(&self) -> bool {
        self.finalized == self.end_price.is_some()
            && self.finalized == self.outcome.is_some()
            && self.end_time > self.start_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Accepting bets, `now < end_time`.
    Active,
    /// Past `end_time`, waiting for a transition.
    Expired,
    /// Terminal for this round id.
    Finalized,
}

/// A single bet. Immutable once placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub id: Uuid,
    pub bettor: Address,
    pub round_id: u64,
    pub amount: Amount,
    pub direction: Direction,
    pub placed_at: i64,
}

/// Read-only view returned by the status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundStatus {
    pub round: Round,
    pub phase: RoundPhase,
    pub needs_transition: bool,
    pub time_left: i64,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolSnapshot {
    /// Value available to cover payouts (includes value owed as pending rewards).
    pub balance: Amount,
    /// Stakes on the active round, not yet settled into the pool.
    pub escrowed: Amount,
    /// Sum of all unclaimed pending rewards.
    pub pending_total: Amount,
}

impl PoolSnapshot {
    /// Portion of the pool not owed to anyone.
    pub fn withdrawable(&self) -> Amount {
        self.balance.saturating_sub(self.pending_total)
    }
}
