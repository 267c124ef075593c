//! Game error taxonomy.
//!
//! Every core operation reports a `GameError`. Callers branch on [`GameError::class`]
//! rather than on individual variants: staleness is retried on a timer, idempotency
//! signals mean "someone else already did it, refresh", the rest surface unchanged.

use serde::Serialize;

use crate::price::PriceError;
use crate::units::{format_amount, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Caller mistake. Never retried automatically.
    Input,
    /// Oracle data missing or too old. Retry after a back-off.
    Staleness,
    /// Redundant transition attempt. Not an error for the caller.
    Idempotency,
    /// Bookkeeping invariant failure. Hard error, not retried.
    Consistency,
    /// Persistence or other infrastructure failure.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    InvalidAmount,
    RoundEnded { round_id: u64 },
    RoundFinalized { round_id: u64 },
    RoundNotFound(u64),
    NoActiveRound,
    NotPoolOwner,
    PriceFeedTooOld { age_secs: i64, max_age_secs: i64 },
    OracleUnavailable(String),
    RoundNotExpired { round_id: u64, time_left: i64 },
    RoundAlreadyFinalized { round_id: u64 },
    NoRewardsAvailable,
    InsufficientPoolBalance { requested: Amount, available: Amount },
    /// A stake or pool total no longer fits the amount type.
    AmountOverflow,
    Storage(String),
}

impl GameError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount
            | Self::RoundEnded { .. }
            | Self::RoundFinalized { .. }
            | Self::RoundNotFound(_)
            | Self::NoActiveRound
            | Self::NotPoolOwner => ErrorClass::Input,
            Self::PriceFeedTooOld { .. } | Self::OracleUnavailable(_) => ErrorClass::Staleness,
            Self::RoundNotExpired { .. } | Self::RoundAlreadyFinalized { .. } => {
                ErrorClass::Idempotency
            }
            Self::NoRewardsAvailable
            | Self::InsufficientPoolBalance { .. }
            | Self::AmountOverflow => ErrorClass::Consistency,
            Self::Storage(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Staleness
    }

    pub fn is_idempotency_signal(&self) -> bool {
        self.class() == ErrorClass::Idempotency
    }

    /// Stable machine-readable name for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "invalid_amount",
            Self::RoundEnded { .. } => "round_ended",
            Self::RoundFinalized { .. } => "round_finalized",
            Self::RoundNotFound(_) => "round_not_found",
            Self::NoActiveRound => "no_active_round",
            Self::NotPoolOwner => "not_pool_owner",
            Self::PriceFeedTooOld { .. } => "price_feed_too_old",
            Self::OracleUnavailable(_) => "oracle_unavailable",
            Self::RoundNotExpired { .. } => "round_not_expired",
            Self::RoundAlreadyFinalized { .. } => "round_already_finalized",
            Self::NoRewardsAvailable => "no_rewards_available",
            Self::InsufficientPoolBalance { .. } => "insufficient_pool_balance",
            Self::AmountOverflow => "amount_overflow",
            Self::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Bet amount must be greater than zero"),
            Self::RoundEnded { round_id } => write!(f, "Round {} already ended", round_id),
            Self::RoundFinalized { round_id } => write!(f, "Round {} already finalized", round_id),
            Self::RoundNotFound(id) => write!(f, "Round {} not found", id),
            Self::NoActiveRound => write!(f, "No round has been started yet"),
            Self::NotPoolOwner => write!(f, "Only the pool owner can withdraw"),
            Self::PriceFeedTooOld { age_secs, max_age_secs } => write!(
                f,
                "Price feed too old: age {}s exceeds max {}s",
                age_secs, max_age_secs
            ),
            Self::OracleUnavailable(reason) => write!(f, "Oracle unavailable: {}", reason),
            Self::RoundNotExpired { round_id, time_left } => write!(
                f,
                "Round {} has not ended yet ({}s left)",
                round_id, time_left
            ),
            Self::RoundAlreadyFinalized { round_id } => {
                write!(f, "Round {} was already finalized", round_id)
            }
            Self::NoRewardsAvailable => write!(f, "No rewards to claim"),
            Self::InsufficientPoolBalance { requested, available } => write!(
                f,
                "Insufficient pool balance: requested {}, available {}",
                format_amount(*requested),
                format_amount(*available)
            ),
            Self::AmountOverflow => write!(f, "Stake totals exceed the supported amount range"),
            Self::Storage(msg) => write!(f, "Ledger storage error: {}", msg),
        }
    }
}

impl std::error::Error for GameError {}

impl From<PriceError> for GameError {
    fn from(err: PriceError) -> Self {
        match err {
            PriceError::Stale {
                age_secs,
                max_age_secs,
            } => Self::PriceFeedTooOld {
                age_secs,
                max_age_secs,
            },
            PriceError::Unavailable { .. } => Self::OracleUnavailable(err.to_string()),
        }
    }
}
