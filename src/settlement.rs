//! Settlement Accountant
//!
//! Turns a finalized round's outcome into pending-reward credits, and owns the claim and
//! pool deposit/withdraw paths.
//!
//! # Payout rule
//!
//! With `W` the winning-side total and `L` the losing-side total, each winning stake is paid
//! `amount + floor(amount * L / W)`. Products are computed exactly with `BigUint`. The floor
//! dust stays in the pool, so the sum of payouts never exceeds `W + L`.
//!
//! When nobody picked the winning side (`W == 0`) the [`NoWinnerPolicy`] decides: retain
//! every stake in the pool (default) or refund each bettor their own stake.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::GameError;
use crate::ledger::{Mutation, RoundStore};
use crate::models::{Address, Direction, PoolSnapshot, Stake};
use crate::units::{format_amount, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoWinnerPolicy {
    /// Losing stakes stay in the pool.
    #[default]
    #[serde(alias = "retain")]
    RetainInPool,
    /// Every stake is credited back to its bettor.
    #[serde(alias = "refund")]
    RefundAll,
}

impl FromStr for NoWinnerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" | "retain_in_pool" => Ok(Self::RetainInPool),
            "refund" | "refund_all" => Ok(Self::RefundAll),
            other => Err(format!("unknown no-winner policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub bettor: Address,
    pub amount: Amount,
}

/// Outcome of settling one finalized round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub round_id: u64,
    pub outcome: Direction,
    pub winning_total: Amount,
    pub losing_total: Amount,
    /// One entry per bettor, ordered by address.
    pub credits: Vec<Credit>,
    pub refunded: bool,
}

impl Settlement {
    pub fn total_staked(&self) -> Amount {
        self.winning_total.saturating_add(self.losing_total)
    }

    pub fn paid_total(&self) -> Amount {
        self.credits.iter().map(|c| c.amount).sum()
    }

    /// Value left in the pool by this round (losing side minus shares paid, plus dust).
    pub fn retained(&self) -> Amount {
        self.total_staked().saturating_sub(self.paid_total())
    }
}

/// Compute the credits for a round that resolved to `outcome`. Pure.
///
/// Fails with `AmountOverflow` when `W + L` does not fit an `Amount`.
pub fn settle(
    round_id: u64,
    outcome: Direction,
    stakes: &[Stake],
    policy: NoWinnerPolicy,
) -> Result<Settlement, GameError> {
    let mut winning_total: Amount = 0;
    let mut losing_total: Amount = 0;
    for stake in stakes.iter().filter(|s| s.round_id == round_id) {
        let side = if stake.direction == outcome {
            &mut winning_total
        } else {
            &mut losing_total
        };
        *side = side
            .checked_add(stake.amount)
            .ok_or(GameError::AmountOverflow)?;
    }
    winning_total
        .checked_add(losing_total)
        .ok_or(GameError::AmountOverflow)?;

    let mut by_bettor: BTreeMap<Address, Amount> = BTreeMap::new();
    let refunded = winning_total == 0 && policy == NoWinnerPolicy::RefundAll;

    for stake in stakes.iter().filter(|s| s.round_id == round_id) {
        let payout = if refunded {
            stake.amount
        } else if stake.direction == outcome {
            stake.amount + pro_rata_share(stake.amount, losing_total, winning_total)
        } else {
            continue;
        };
        *by_bettor.entry(stake.bettor.clone()).or_insert(0) += payout;
    }

    Ok(Settlement {
        round_id,
        outcome,
        winning_total,
        losing_total,
        credits: by_bettor
            .into_iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(bettor, amount)| Credit { bettor, amount })
            .collect(),
        refunded,
    })
}

/// `floor(amount * losing / winning)`. Bounded by `losing` when `amount <= winning`.
fn pro_rata_share(amount: Amount, losing: Amount, winning: Amount) -> Amount {
    if winning == 0 || losing == 0 {
        return 0;
    }
    let share = BigUint::from(amount) * BigUint::from(losing) / BigUint::from(winning);
    u128::try_from(share).unwrap_or(losing)
}

pub struct SettlementAccountant {
    store: Arc<RoundStore>,
    clock: Arc<dyn Clock>,
    policy: NoWinnerPolicy,
    pool_owner: Option<Address>,
}

impl SettlementAccountant {
    pub fn new(store: Arc<RoundStore>, clock: Arc<dyn Clock>, policy: NoWinnerPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            pool_owner: None,
        }
    }

    pub fn with_pool_owner(mut self, owner: Option<Address>) -> Self {
        self.pool_owner = owner.and_then(|o| Address::parse(o.as_str()));
        self
    }

    pub fn pool_owner(&self) -> Option<&Address> {
        self.pool_owner.as_ref()
    }

    /// Credits for a round that just resolved to `outcome`, under this accountant's policy.
    pub fn settle_round(
        &self,
        round_id: u64,
        outcome: Direction,
        stakes: &[Stake],
    ) -> Result<Settlement, GameError> {
        settle(round_id, outcome, stakes, self.policy)
    }

    pub fn pending_rewards(&self, bettor: &Address) -> Amount {
        self.store.read(|state| state.pending_for(bettor))
    }

    pub fn pool(&self) -> PoolSnapshot {
        self.store.read(|state| state.pool())
    }

    pub fn pool_balance(&self) -> Amount {
        self.pool().balance
    }

    /// Pay out everything owed to `bettor`. Returns the amount transferred.
    pub fn claim(&self, bettor: &Address) -> Result<Amount, GameError> {
        let now = self.clock.now();
        let result = self.store.transact(|state| {
            let amount = state.pending_for(bettor);
            if amount == 0 {
                return Err(GameError::NoRewardsAvailable);
            }
            let available = state.pool().balance;
            if available < amount {
                return Err(GameError::InsufficientPoolBalance {
                    requested: amount,
                    available,
                });
            }
            let mutation = Mutation::Claim {
                bettor: bettor.clone(),
                amount,
                at: now,
            };
            Ok((mutation, amount))
        });

        match &result {
            Ok(amount) => info!(
                bettor = %bettor,
                amount = %format_amount(*amount),
                "Rewards claimed"
            ),
            Err(e @ GameError::InsufficientPoolBalance { .. }) => {
                error!(bettor = %bettor, error = %e, "Pool cannot cover pending rewards")
            }
            Err(_) => {}
        }
        result
    }

    pub fn deposit(&self, from: &Address, amount: Amount) -> Result<PoolSnapshot, GameError> {
        if amount == 0 {
            return Err(GameError::InvalidAmount);
        }
        let now = self.clock.now();
        let snapshot = self.store.transact(|state| {
            let mut after = state.pool();
            after
                .balance
                .checked_add(after.escrowed)
                .and_then(|held| held.checked_add(amount))
                .ok_or(GameError::InvalidAmount)?;
            after.balance += amount;
            let mutation = Mutation::Deposit {
                from: from.clone(),
                amount,
                at: now,
            };
            Ok((mutation, after))
        })?;
        info!(from = %from, amount = %format_amount(amount), "Pool deposit");
        Ok(snapshot)
    }

    /// Owner-only. Value owed as pending rewards can never be withdrawn.
    pub fn withdraw(&self, to: &Address, amount: Amount) -> Result<PoolSnapshot, GameError> {
        if self.pool_owner.as_ref() != Some(to) {
            return Err(GameError::NotPoolOwner);
        }
        if amount == 0 {
            return Err(GameError::InvalidAmount);
        }
        let now = self.clock.now();
        let snapshot = self.store.transact(|state| {
            let mut after = state.pool();
            let available = after.withdrawable();
            if amount > available {
                return Err(GameError::InsufficientPoolBalance {
                    requested: amount,
                    available,
                });
            }
            after.balance -= amount;
            let mutation = Mutation::Withdraw {
                to: to.clone(),
                amount,
                at: now,
            };
            Ok((mutation, after))
        })?;
        info!(to = %to, amount = %format_amount(amount), "Pool withdrawal");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Round;
    use uuid::Uuid;

    const COIN: Amount = 1_000_000_000_000_000_000;
    const CENT: Amount = COIN / 100;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn stake(bettor: &str, round_id: u64, amount: Amount, direction: Direction) -> Stake {
        Stake {
            id: Uuid::new_v4(),
            bettor: addr(bettor),
            round_id,
            amount,
            direction,
            placed_at: 100,
        }
    }

    fn accountant_with_pending() -> (Arc<RoundStore>, SettlementAccountant) {
        let store = Arc::new(RoundStore::in_memory());
        let clock = Arc::new(ManualClock::new(1_000));
        let round = Round::open(5, 0, 900, 6_000_000_000_000);
        store
            .transact(|_| Ok((Mutation::Genesis { round: round.clone() }, ())))
            .unwrap();
        for s in [
            stake("alice", 5, CENT, Direction::Up),
            stake("bob", 5, 2 * CENT, Direction::Down),
        ] {
            store
                .transact(|_| Ok((Mutation::PlaceBet { stake: s.clone() }, ())))
                .unwrap();
        }
        let stakes = store.read(|state| state.stakes_for(5).to_vec());
        let settlement = settle(5, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        let finalized = round.finalize(6_100_000_000_000, 910);
        let next = Round::open(6, 910, 900, 6_100_000_000_000);
        store
            .transact(|_| {
                Ok((
                    Mutation::Transition {
                        finalized: finalized.clone(),
                        settlement: settlement.clone(),
                        next: next.clone(),
                    },
                    (),
                ))
            })
            .unwrap();
        let accountant = SettlementAccountant::new(store.clone(), clock, NoWinnerPolicy::RetainInPool)
            .with_pool_owner(Some(addr("0xOwner")));
        (store, accountant)
    }

    #[test]
    fn test_example_round_credits_alice() {
        let stakes = vec![
            stake("alice", 5, CENT, Direction::Up),
            stake("bob", 5, 2 * CENT, Direction::Down),
        ];
        let s = settle(5, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        assert_eq!(s.winning_total, CENT);
        assert_eq!(s.losing_total, 2 * CENT);
        assert_eq!(
            s.credits,
            vec![Credit {
                bettor: addr("alice"),
                amount: 3 * CENT
            }]
        );
        assert_eq!(format_amount(s.credits[0].amount), "0.03");
        assert_eq!(s.retained(), 0);
    }

    #[test]
    fn test_pro_rata_floor_keeps_dust_in_pool() {
        let stakes = vec![
            stake("a", 1, 1, Direction::Up),
            stake("b", 1, 2, Direction::Up),
            stake("c", 1, 2, Direction::Down),
        ];
        let s = settle(1, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        // a: 1 + floor(2/3) = 1, b: 2 + floor(4/3) = 3
        assert_eq!(s.paid_total(), 4);
        assert_eq!(s.retained(), 1);
        assert!(s.paid_total() <= s.total_staked());
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        let big = 10_000_000 * COIN;
        let stakes = vec![
            stake("a", 1, big, Direction::Down),
            stake("b", 1, big * 3, Direction::Up),
        ];
        let s = settle(1, Direction::Down, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        assert_eq!(s.paid_total(), big * 4);
    }

    #[test]
    fn test_totals_beyond_amount_range_are_rejected() {
        let half = Amount::MAX / 2 + 1;
        let winners = vec![
            stake("a", 1, half, Direction::Up),
            stake("b", 1, half, Direction::Up),
        ];
        assert_eq!(
            settle(1, Direction::Up, &winners, NoWinnerPolicy::RetainInPool),
            Err(GameError::AmountOverflow)
        );
        let split = vec![
            stake("a", 1, half, Direction::Up),
            stake("b", 1, half, Direction::Down),
        ];
        assert_eq!(
            settle(1, Direction::Down, &split, NoWinnerPolicy::RetainInPool),
            Err(GameError::AmountOverflow)
        );
    }

    #[test]
    fn test_deposit_beyond_amount_range_is_rejected() {
        let (store, accountant) = accountant_with_pending();
        let before = store.read(|state| state.clone());
        assert_eq!(
            accountant.deposit(&addr("carol"), Amount::MAX),
            Err(GameError::InvalidAmount)
        );
        assert_eq!(store.read(|state| state.clone()), before);
    }

    #[test]
    fn test_no_winner_policies() {
        let stakes = vec![
            stake("a", 1, CENT, Direction::Down),
            stake("b", 1, CENT, Direction::Down),
        ];
        let retained = settle(1, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        assert!(retained.credits.is_empty());
        assert_eq!(retained.retained(), 2 * CENT);

        let refunded = settle(1, Direction::Up, &stakes, NoWinnerPolicy::RefundAll).unwrap();
        assert!(refunded.refunded);
        assert_eq!(refunded.paid_total(), 2 * CENT);
    }

    #[test]
    fn test_same_bettor_aggregated_and_other_rounds_ignored() {
        let stakes = vec![
            stake("a", 1, CENT, Direction::Up),
            stake("a", 1, CENT, Direction::Up),
            stake("b", 1, 2 * CENT, Direction::Down),
            stake("z", 2, 50 * CENT, Direction::Down),
        ];
        let s = settle(1, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap();
        assert_eq!(s.credits.len(), 1);
        assert_eq!(s.credits[0].amount, 4 * CENT);
    }

    #[test]
    fn test_claim_is_idempotent() {
        let (store, accountant) = accountant_with_pending();
        let alice = addr("alice");
        assert_eq!(accountant.pending_rewards(&alice), 3 * CENT);
        assert_eq!(accountant.pool_balance(), 3 * CENT);

        assert_eq!(accountant.claim(&alice), Ok(3 * CENT));
        assert_eq!(accountant.pending_rewards(&alice), 0);
        assert_eq!(accountant.pool_balance(), 0);

        let before = store.read(|state| state.pool());
        assert_eq!(accountant.claim(&alice), Err(GameError::NoRewardsAvailable));
        assert_eq!(store.read(|state| state.pool()), before);
        assert_eq!(accountant.claim(&addr("bob")), Err(GameError::NoRewardsAvailable));
    }

    #[test]
    fn test_withdraw_owner_only_and_never_touches_pending() {
        let (_store, accountant) = accountant_with_pending();
        let owner = addr("0xowner");
        accountant.deposit(&addr("carol"), COIN).unwrap();
        assert_eq!(accountant.pool().withdrawable(), COIN);

        assert_eq!(
            accountant.withdraw(&addr("carol"), CENT),
            Err(GameError::NotPoolOwner)
        );
        assert_eq!(
            accountant.withdraw(&owner, COIN + 1),
            Err(GameError::InsufficientPoolBalance {
                requested: COIN + 1,
                available: COIN
            })
        );
        let after = accountant.withdraw(&owner, COIN).unwrap();
        assert_eq!(after.balance, 3 * CENT);
        assert_eq!(after.pending_total, 3 * CENT);
        assert_eq!(accountant.claim(&addr("alice")), Ok(3 * CENT));
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let (_store, accountant) = accountant_with_pending();
        assert_eq!(accountant.deposit(&addr("x"), 0), Err(GameError::InvalidAmount));
        assert_eq!(
            accountant.withdraw(&addr("0xowner"), 0),
            Err(GameError::InvalidAmount)
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("refund".parse::<NoWinnerPolicy>(), Ok(NoWinnerPolicy::RefundAll));
        assert_eq!(
            "retain_in_pool".parse::<NoWinnerPolicy>(),
            Ok(NoWinnerPolicy::RetainInPool)
        );
        assert!("burn".parse::<NoWinnerPolicy>().is_err());
    }
}
