//! Round Store
//!
//! The single serializing store behind the game: one current round, an append-only log of
//! finalized rounds, stakes, pending rewards and the payout pool.
//!
//! Every state change goes through [`RoundStore::transact`]. The planner closure inspects the
//! state under the store lock and returns a [`Mutation`]; the mutation is persisted (one SQLite
//! transaction when a database is attached) and only then applied in memory. A planner error
//! or a failed commit leaves the state untouched.

pub mod db;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

use crate::error::GameError;
use crate::models::{Address, PoolSnapshot, Round, Stake};
use crate::settlement::Settlement;
use crate::units::Amount;

pub use db::{ActivityRecord, LedgerDb};

/// A state change, fully planned and validated before it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Open the very first round.
    Genesis { round: Round },
    PlaceBet { stake: Stake },
    /// Close the current round, credit its winners and open the next one, as one unit.
    Transition {
        finalized: Round,
        settlement: Settlement,
        next: Round,
    },
    Claim {
        bettor: Address,
        amount: Amount,
        at: i64,
    },
    Deposit {
        from: Address,
        amount: Amount,
        at: i64,
    },
    Withdraw {
        to: Address,
        amount: Amount,
        at: i64,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Genesis { .. } => "genesis",
            Mutation::PlaceBet { .. } => "bet",
            Mutation::Transition { .. } => "finalize",
            Mutation::Claim { .. } => "claim",
            Mutation::Deposit { .. } => "deposit",
            Mutation::Withdraw { .. } => "withdraw",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    current: Option<Round>,
    finalized: BTreeMap<u64, Round>,
    stakes: HashMap<u64, Vec<Stake>>,
    pending: HashMap<Address, Amount>,
    pool_balance: Amount,
    escrowed: Amount,
}

impl LedgerState {
    /// Rebuild state from persisted rows.
    pub(crate) fn restore(
        rounds: Vec<Round>,
        stakes: Vec<Stake>,
        pending: HashMap<Address, Amount>,
        pool_balance: Amount,
    ) -> Result<Self> {
        let mut state = Self {
            pending,
            pool_balance,
            ..Self::default()
        };
        for round in rounds {
            if round.finalized {
                state.finalized.insert(round.id, round);
            } else if let Some(other) = &state.current {
                anyhow::bail!("rounds {} and {} are both open", other.id, round.id);
            } else {
                state.current = Some(round);
            }
        }
        for stake in stakes {
            state.stakes.entry(stake.round_id).or_default().push(stake);
        }
        for list in state.stakes.values_mut() {
            list.sort_by_key(|s| s.placed_at);
        }
        state.escrowed = match &state.current {
            Some(round) => state
                .stakes_for(round.id)
                .iter()
                .try_fold(0 as Amount, |total, s| total.checked_add(s.amount))
                .with_context(|| format!("stakes on round {} overflow the amount range", round.id))?,
            None => 0,
        };
        Ok(state)
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.current.as_ref()
    }

    /// Current or finalized round by id.
    pub fn round(&self, id: u64) -> Option<&Round> {
        match &self.current {
            Some(r) if r.id == id => Some(r),
            _ => self.finalized.get(&id),
        }
    }

    /// Finalized rounds, newest first.
    pub fn recent_finalized(&self, limit: usize) -> Vec<Round> {
        self.finalized.values().rev().take(limit).cloned().collect()
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.len()
    }

    pub fn stakes_for(&self, round_id: u64) -> &[Stake] {
        self.stakes.get(&round_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_stakes(&self, round_id: u64, bettor: &Address) -> Vec<Stake> {
        self.stakes_for(round_id)
            .iter()
            .filter(|s| &s.bettor == bettor)
            .cloned()
            .collect()
    }

    pub fn pending_for(&self, bettor: &Address) -> Amount {
        self.pending.get(bettor).copied().unwrap_or(0)
    }

    pub fn pool(&self) -> PoolSnapshot {
        PoolSnapshot {
            balance: self.pool_balance,
            escrowed: self.escrowed,
            pending_total: self
                .pending
                .values()
                .fold(0, |total: Amount, v| total.saturating_add(*v)),
        }
    }

    /// Structural invariants of the ledger. Returns the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut previous: Option<&Round> = None;
        for round in self.finalized.values().chain(self.current.iter()) {
            if !round.is_consistent() {
                return Err(format!("round {} has inconsistent finalization fields", round.id));
            }
            if let Some(prev) = previous {
                if round.id != prev.id + 1 {
                    return Err(format!("round {} follows round {}", round.id, prev.id));
                }
                if Some(round.start_price) != prev.end_price {
                    return Err(format!("round {} start price breaks continuity", round.id));
                }
                if round.start_time < prev.end_time {
                    return Err(format!("round {} starts before round {} ends", round.id, prev.id));
                }
            }
            previous = Some(round);
        }
        if self.current.as_ref().map_or(false, |r| r.finalized) {
            return Err("current round is finalized".to_string());
        }
        let pool = self.pool();
        if pool.pending_total > pool.balance {
            return Err(format!(
                "pending rewards {} exceed pool balance {}",
                pool.pending_total, pool.balance
            ));
        }
        Ok(())
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Genesis { round } => {
                self.current = Some(round.clone());
            }
            Mutation::PlaceBet { stake } => {
                self.escrowed = self.escrowed.saturating_add(stake.amount);
                self.stakes.entry(stake.round_id).or_default().push(stake.clone());
            }
            Mutation::Transition {
                finalized,
                settlement,
                next,
            } => {
                let staked = settlement.total_staked();
                self.escrowed = self.escrowed.saturating_sub(staked);
                self.pool_balance = self.pool_balance.saturating_add(staked);
                for credit in &settlement.credits {
                    let owed = self.pending.entry(credit.bettor.clone()).or_insert(0);
                    *owed = owed.saturating_add(credit.amount);
                }
                self.finalized.insert(finalized.id, finalized.clone());
                self.current = Some(next.clone());
            }
            Mutation::Claim { bettor, amount, .. } => {
                self.pending.remove(bettor);
                self.pool_balance = self.pool_balance.saturating_sub(*amount);
            }
            Mutation::Deposit { amount, .. } => {
                self.pool_balance = self.pool_balance.saturating_add(*amount);
            }
            Mutation::Withdraw { amount, .. } => {
                self.pool_balance = self.pool_balance.saturating_sub(*amount);
            }
        }
    }
}

struct Inner {
    state: LedgerState,
    db: Option<LedgerDb>,
}

impl Inner {
    fn commit(&mut self, mutation: &Mutation) -> std::result::Result<(), GameError> {
        if let Some(db) = self.db.as_mut() {
            db.commit(mutation)
                .map_err(|e| GameError::Storage(format!("{:#}", e)))?;
        }
        self.state.apply(mutation);
        Ok(())
    }
}

pub struct RoundStore {
    inner: Mutex<Inner>,
}

impl RoundStore {
    /// Volatile store, nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LedgerState::default(),
                db: None,
            }),
        }
    }

    /// SQLite-backed store. Loads any existing ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = LedgerDb::open(path)?;
        let state = db
            .load()
            .with_context(|| format!("failed to load ledger from {}", path.display()))?;
        state
            .check_invariants()
            .map_err(|e| anyhow::anyhow!("ledger at {} is inconsistent: {}", path.display(), e))?;

        info!(
            path = %path.display(),
            current_round = state.current_round().map(|r| r.id),
            finalized_rounds = state.finalized_count(),
            "Ledger loaded"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                db: Some(db),
            }),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.lock().db.is_some()
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> T {
        f(&self.inner.lock().state)
    }

    /// Plan, persist and apply one mutation under the store lock.
    pub fn transact<T>(
        &self,
        plan: impl FnOnce(&LedgerState) -> std::result::Result<(Mutation, T), GameError>,
    ) -> std::result::Result<T, GameError> {
        let mut inner = self.inner.lock();
        let (mutation, out) = plan(&inner.state)?;
        inner.commit(&mutation)?;
        Ok(out)
    }

    /// Open `round` as the first round unless one already exists. Returns the current round.
    pub fn open_genesis(&self, round: Round) -> std::result::Result<Round, GameError> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.state.current_round() {
            return Ok(current.clone());
        }
        inner.commit(&Mutation::Genesis {
            round: round.clone(),
        })?;
        Ok(round)
    }

    /// Most recent activity rows, newest first. Empty for a volatile store.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>> {
        match self.inner.lock().db.as_ref() {
            Some(db) => db.recent_activity(limit),
            None => Ok(Vec::new()),
        }
    }
}
