//! Round Controller
//!
//! State machine over the current round:
//!
//! ```text
//! Active --(clock passes end_time)--> Expired --transition--> Finalized(n) + Active(n+1)
//! ```
//!
//! A transition fetches a strict price *before* taking the store lock, then re-validates
//! everything under the lock: the round it observed must still be current, must have expired,
//! and the price must still be fresh at commit time. Finalization, settlement credits and the
//! opening of the next round are committed as a single mutation. Redundant callers get
//! `RoundAlreadyFinalized` or `RoundNotExpired` and nothing changes.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::GameError;
use crate::ledger::{Mutation, RoundStore};
use crate::models::{Address, Direction, Round, RoundStatus, Stake};
use crate::price::{DisplayPrice, PriceSource};
use crate::settlement::{Settlement, SettlementAccountant};
use crate::units::{format_amount, format_price, Amount, PriceE8};

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub finalized: Round,
    pub next: Round,
    pub settlement: Settlement,
}

pub struct RoundController {
    store: Arc<RoundStore>,
    prices: Arc<PriceSource>,
    accountant: Arc<SettlementAccountant>,
    clock: Arc<dyn Clock>,
    round_duration_secs: i64,
}

impl RoundController {
    pub fn new(
        store: Arc<RoundStore>,
        prices: Arc<PriceSource>,
        accountant: Arc<SettlementAccountant>,
        clock: Arc<dyn Clock>,
        round_duration_secs: i64,
    ) -> Self {
        Self {
            store,
            prices,
            accountant,
            clock,
            round_duration_secs,
        }
    }

    /// Open round 1 from a fresh price if the store is empty. Returns the current round.
    pub fn bootstrap(&self) -> Result<Round, GameError> {
        if let Some(round) = self.store.read(|state| state.current_round().cloned()) {
            return Ok(round);
        }

        let reading = self.prices.get_price().map_err(|e| {
            warn!(error = %e, "Cannot open the first round without a fresh price");
            GameError::from(e)
        })?;
        let now = self.clock.now();
        let round = self.store.open_genesis(Round::open(
            1,
            now,
            self.round_duration_secs,
            reading.value,
        ))?;

        info!(
            round_id = round.id,
            start_price = %format_price(round.start_price),
            end_time = round.end_time,
            "Round opened"
        );
        Ok(round)
    }

    /// Read-only status of the current round. Never mutates.
    pub fn check_status(&self) -> Result<RoundStatus, GameError> {
        let now = self.clock.now();
        let round = self.current_round()?;
        Ok(RoundStatus {
            phase: round.phase(now),
            needs_transition: round.needs_transition(now),
            time_left: round.time_left(now),
            checked_at: now,
            round,
        })
    }

    /// Close whichever round is current at call time and open the next one.
    pub fn trigger_transition(&self) -> Result<TransitionOutcome, GameError> {
        let round_id = self.current_round_id()?;
        self.trigger_transition_for(round_id)
    }

    /// Close round `round_id` if it is still the current, expired round.
    pub fn trigger_transition_for(&self, round_id: u64) -> Result<TransitionOutcome, GameError> {
        // Cheap checks first so redundant callers never hit the oracle.
        let observed = self.store.read(|state| state.current_round().cloned());
        let observed = observed.ok_or(GameError::NoActiveRound)?;
        check_target(&observed, round_id, self.clock.now()).map_err(|e| {
            debug!(round_id, error = %e, "Transition not needed");
            e
        })?;

        let reading = self.prices.get_price().map_err(|e| {
            let err = GameError::from(e);
            warn!(round_id, error = %err, "Transition blocked by price feed");
            err
        })?;

        let result = self.store.transact(|state| {
            let current = state.current_round().ok_or(GameError::NoActiveRound)?;
            let now = self.clock.now();
            check_target(current, round_id, now)?;
            self.prices.ensure_fresh(&reading, now)?;

            let finalized = current.finalize(reading.value, now);
            let outcome = finalized.outcome.unwrap_or(Direction::Down);
            let settlement =
                self.accountant
                    .settle_round(round_id, outcome, state.stakes_for(round_id))?;
            let next = Round::open(round_id + 1, now, self.round_duration_secs, reading.value);

            let mutation = Mutation::Transition {
                finalized: finalized.clone(),
                settlement: settlement.clone(),
                next: next.clone(),
            };
            Ok((
                mutation,
                TransitionOutcome {
                    finalized,
                    next,
                    settlement,
                },
            ))
        });

        match &result {
            Ok(outcome) => info!(
                round_id,
                outcome = %outcome.settlement.outcome,
                start_price = %format_price(outcome.finalized.start_price),
                end_price = %format_price(reading.value),
                winners = outcome.settlement.credits.len(),
                paid = %format_amount(outcome.settlement.paid_total()),
                retained = %format_amount(outcome.settlement.retained()),
                next_round_id = outcome.next.id,
                "Round finalized"
            ),
            Err(e) if e.is_idempotency_signal() => {
                debug!(round_id, error = %e, "Transition lost the race")
            }
            Err(e) if e.is_retryable() => {
                warn!(round_id, error = %e, "Price went stale before commit")
            }
            Err(e) => warn!(round_id, error = %e, "Transition failed"),
        }
        result
    }

    /// `startNewRound`: genesis on an empty store, otherwise the same as a transition.
    /// Returns the round that is active afterwards.
    pub fn start_new_round(&self) -> Result<Round, GameError> {
        let has_round = self.store.read(|state| state.current_round().is_some());
        if has_round {
            self.trigger_transition().map(|outcome| outcome.next)
        } else {
            self.bootstrap()
        }
    }

    pub fn place_bet(
        &self,
        bettor: &Address,
        direction: Direction,
        amount: Amount,
    ) -> Result<Stake, GameError> {
        if amount == 0 {
            return Err(GameError::InvalidAmount);
        }
        let now = self.clock.now();
        let stake = self.store.transact(|state| {
            let round = state.current_round().ok_or(GameError::NoActiveRound)?;
            if round.finalized {
                return Err(GameError::RoundFinalized { round_id: round.id });
            }
            if now >= round.end_time {
                return Err(GameError::RoundEnded { round_id: round.id });
            }
            // Everything the ledger holds must stay representable after this stake.
            let pool = state.pool();
            pool.balance
                .checked_add(pool.escrowed)
                .and_then(|held| held.checked_add(amount))
                .ok_or(GameError::InvalidAmount)?;
            let stake = Stake {
                id: Uuid::new_v4(),
                bettor: bettor.clone(),
                round_id: round.id,
                amount,
                direction,
                placed_at: now,
            };
            Ok((
                Mutation::PlaceBet {
                    stake: stake.clone(),
                },
                stake,
            ))
        })?;

        info!(
            round_id = stake.round_id,
            bettor = %stake.bettor,
            direction = %stake.direction,
            amount = %format_amount(stake.amount),
            "Bet placed"
        );
        Ok(stake)
    }

    pub fn current_round(&self) -> Result<Round, GameError> {
        self.store
            .read(|state| state.current_round().cloned())
            .ok_or(GameError::NoActiveRound)
    }

    pub fn current_round_id(&self) -> Result<u64, GameError> {
        self.current_round().map(|r| r.id)
    }

    /// Any round, current or finalized.
    pub fn round(&self, round_id: u64) -> Result<Round, GameError> {
        self.store
            .read(|state| state.round(round_id).cloned())
            .ok_or(GameError::RoundNotFound(round_id))
    }

    /// Finalized rounds, newest first.
    pub fn rounds(&self, limit: usize) -> Vec<Round> {
        self.store.read(|state| state.recent_finalized(limit))
    }

    pub fn user_bets(&self, round_id: u64, bettor: &Address) -> Vec<Stake> {
        self.store.read(|state| state.user_stakes(round_id, bettor))
    }

    /// Strict price, fails on stale or unavailable data.
    pub fn latest_price(&self) -> Result<PriceE8, GameError> {
        Ok(self.prices.get_price()?.value)
    }

    /// Degrading display price. Never fails.
    pub fn display_price(&self) -> DisplayPrice {
        self.prices.get_price_with_fallback()
    }
}

/// Validate that `round_id` names `current` and that it is ready to close at `now`.
fn check_target(current: &Round, round_id: u64, now: i64) -> Result<(), GameError> {
    if round_id < current.id || (round_id == current.id && current.finalized) {
        return Err(GameError::RoundAlreadyFinalized { round_id });
    }
    if round_id > current.id {
        return Err(GameError::RoundNotFound(round_id));
    }
    if now < current.end_time {
        return Err(GameError::RoundNotExpired {
            round_id,
            time_left: current.time_left(now),
        });
    }
    Ok(())
}
