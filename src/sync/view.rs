//! Client-facing snapshot of the round, ready for display.

use serde::Serialize;

use crate::error::GameError;
use crate::game::PredictionGame;
use crate::models::{PoolSnapshot, RoundPhase, RoundStatus};
use crate::price::{DisplayPrice, PriceOrigin};
use crate::units::{format_amount, format_price, PriceE8};

/// Rounds with less than this left are flagged as expiring soon.
pub const EXPIRING_SOON_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundView {
    pub round_id: u64,
    pub phase: RoundPhase,
    pub start_price: PriceE8,
    pub start_price_display: String,
    pub end_time: i64,
    pub time_left_secs: i64,
    /// `MM:SS`
    pub time_left: String,
    pub expiring_soon: bool,
    pub needs_transition: bool,
    pub price: PriceE8,
    pub price_display: String,
    pub price_origin: PriceOrigin,
    pub price_updated_at: Option<i64>,
    pub pool_balance: String,
    pub checked_at: i64,
}

impl RoundView {
    pub fn build(status: &RoundStatus, price: &DisplayPrice, pool: &PoolSnapshot) -> Self {
        Self {
            round_id: status.round.id,
            phase: status.phase,
            start_price: status.round.start_price,
            start_price_display: format_price(status.round.start_price),
            end_time: status.round.end_time,
            time_left_secs: status.time_left,
            time_left: format_time_left(status.time_left),
            expiring_soon: status.phase == RoundPhase::Active && status.time_left < EXPIRING_SOON_SECS,
            needs_transition: status.needs_transition,
            price: price.value,
            price_display: format_price(price.value),
            price_origin: price.origin.clone(),
            price_updated_at: price.updated_at,
            pool_balance: format_amount(pool.balance),
            checked_at: status.checked_at,
        }
    }

    /// Fresh view straight from the game. Blocks on the display price lookup.
    pub fn snapshot(game: &PredictionGame) -> Result<Self, GameError> {
        let status = game.check_status()?;
        let price = game.display_price();
        Ok(Self::build(&status, &price, &game.pool()))
    }
}

pub fn format_time_left(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Round;

    fn status(now: i64) -> RoundStatus {
        let round = Round::open(3, 0, 900, 6_000_000_000_000);
        RoundStatus {
            phase: round.phase(now),
            needs_transition: round.needs_transition(now),
            time_left: round.time_left(now),
            checked_at: now,
            round,
        }
    }

    #[test]
    fn test_time_left_format() {
        assert_eq!(format_time_left(900), "15:00");
        assert_eq!(format_time_left(65), "01:05");
        assert_eq!(format_time_left(-3), "00:00");
    }

    #[test]
    fn test_view_flags() {
        let price = DisplayPrice {
            value: 6_100_000_000_000,
            updated_at: None,
            origin: PriceOrigin::Default,
        };
        let pool = PoolSnapshot {
            balance: 30_000_000_000_000_000,
            ..PoolSnapshot::default()
        };

        let view = RoundView::build(&status(100), &price, &pool);
        assert!(!view.expiring_soon);
        assert_eq!(view.time_left, "13:20");
        assert_eq!(view.pool_balance, "0.03");
        assert_eq!(view.start_price_display, "60000.00000000");

        let view = RoundView::build(&status(850), &price, &pool);
        assert!(view.expiring_soon);
        assert!(!view.needs_transition);

        let view = RoundView::build(&status(901), &price, &pool);
        assert!(!view.expiring_soon);
        assert!(view.needs_transition);
        assert_eq!(view.time_left, "00:00");
    }
}
