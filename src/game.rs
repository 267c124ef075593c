//! Prediction game façade: the operations a client (keeper, HTTP API, tests) calls.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{AppConfig, GameConfig};
use crate::error::GameError;
use crate::ledger::{ActivityRecord, RoundStore};
use crate::models::{Address, Direction, PoolSnapshot, Round, RoundStatus, Stake};
use crate::price::{DisplayPrice, PriceSource};
use crate::round::{RoundController, TransitionOutcome};
use crate::settlement::SettlementAccountant;
use crate::units::{Amount, PriceE8};

pub struct PredictionGame {
    store: Arc<RoundStore>,
    controller: RoundController,
    accountant: Arc<SettlementAccountant>,
}

impl PredictionGame {
    pub fn new(
        store: Arc<RoundStore>,
        prices: Arc<PriceSource>,
        clock: Arc<dyn Clock>,
        config: &GameConfig,
    ) -> Self {
        let accountant = Arc::new(
            SettlementAccountant::new(store.clone(), clock.clone(), config.no_winner_policy)
                .with_pool_owner(config.pool_owner.clone()),
        );
        let controller = RoundController::new(
            store.clone(),
            prices,
            accountant.clone(),
            clock,
            config.round_duration_secs,
        );
        Self {
            store,
            controller,
            accountant,
        }
    }

    /// Open the SQLite ledger and wire the configured oracle feeds.
    pub fn from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(
            RoundStore::open(&config.storage.db_path).context("failed to open round ledger")?,
        );
        let prices = Arc::new(
            PriceSource::from_config(&config.oracle, clock.clone(), config.game.max_price_age_secs)
                .context("failed to build price source")?,
        );
        Ok(Self::new(store, prices, clock, &config.game))
    }

    pub fn bootstrap(&self) -> Result<Round, GameError> {
        self.controller.bootstrap()
    }

    pub fn check_status(&self) -> Result<RoundStatus, GameError> {
        self.controller.check_status()
    }

    pub fn place_bet(
        &self,
        bettor: &Address,
        direction: Direction,
        amount: Amount,
    ) -> Result<Stake, GameError> {
        self.controller.place_bet(bettor, direction, amount)
    }

    pub fn current_round(&self) -> Result<Round, GameError> {
        self.controller.current_round()
    }

    pub fn current_round_id(&self) -> Result<u64, GameError> {
        self.controller.current_round_id()
    }

    pub fn round(&self, round_id: u64) -> Result<Round, GameError> {
        self.controller.round(round_id)
    }

    pub fn rounds(&self, limit: usize) -> Vec<Round> {
        self.controller.rounds(limit)
    }

    pub fn user_bets(&self, round_id: u64, bettor: &Address) -> Vec<Stake> {
        self.controller.user_bets(round_id, bettor)
    }

    pub fn start_new_round(&self) -> Result<Round, GameError> {
        self.controller.start_new_round()
    }

    pub fn trigger_transition(&self) -> Result<TransitionOutcome, GameError> {
        self.controller.trigger_transition()
    }

    pub fn trigger_transition_for(&self, round_id: u64) -> Result<TransitionOutcome, GameError> {
        self.controller.trigger_transition_for(round_id)
    }

    pub fn latest_price(&self) -> Result<PriceE8, GameError> {
        self.controller.latest_price()
    }

    pub fn display_price(&self) -> DisplayPrice {
        self.controller.display_price()
    }

    pub fn pending_rewards(&self, bettor: &Address) -> Amount {
        self.accountant.pending_rewards(bettor)
    }

    pub fn claim_rewards(&self, bettor: &Address) -> Result<Amount, GameError> {
        self.accountant.claim(bettor)
    }

    pub fn pool_balance(&self) -> Amount {
        self.accountant.pool_balance()
    }

    pub fn pool(&self) -> PoolSnapshot {
        self.accountant.pool()
    }

    pub fn deposit_to_pool(&self, from: &Address, amount: Amount) -> Result<PoolSnapshot, GameError> {
        self.accountant.deposit(from, amount)
    }

    /// Configured pool owner, if withdrawals are enabled at all.
    pub fn pool_owner(&self) -> Option<&Address> {
        self.accountant.pool_owner()
    }

    pub fn withdraw_from_pool(&self, to: &Address, amount: Amount) -> Result<PoolSnapshot, GameError> {
        self.accountant.withdraw(to, amount)
    }

    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>> {
        self.store.recent_activity(limit)
    }
}
