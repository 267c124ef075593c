//! Round Keeper
//!
//! Scheduled shell around the controller. Every tick it checks the round status (throttled to a
//! minimum gap), publishes a [`RoundView`], and when the round has expired waits a short delay
//! so the oracle can update, then attempts the transition. Stale-price failures are retried per
//! the caller-owned [`RetryPolicy`]; idempotency signals mean another caller already did the
//! work. Status-poll failures push the next tick out (consecutive-failure backoff).

pub mod view;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::KeeperConfig;
use crate::error::GameError;
use crate::game::PredictionGame;

pub use view::RoundView;

/// Upper bound on the status-failure backoff multiplier (2^4 poll intervals).
const MAX_FAILURE_SHIFT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" | "exp" => Ok(Backoff::Exponential),
            other => Err(format!("unknown backoff: {}", other)),
        }
    }
}

/// Bounded retry of a transition blocked by a stale or unavailable price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub delay_secs: u64,
    /// Total attempts per expired round, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay_secs: 120,
            max_attempts: 3,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `failed_attempts`-th failure, or `None` once attempts are exhausted.
    pub fn delay_after(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts >= self.max_attempts {
            return None;
        }
        let secs = match self.backoff {
            Backoff::Fixed => self.delay_secs,
            Backoff::Exponential => {
                let shift = (failed_attempts - 1).min(16);
                self.delay_secs.saturating_mul(1u64 << shift)
            }
        };
        Some(Duration::from_secs(secs))
    }
}

/// What one keeper check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Skipped, the previous check was too recent.
    Throttled,
    /// No round existed and the first one was opened.
    Started { round_id: u64 },
    /// Round still running (or finalized by someone else already).
    Idle { round_id: u64, time_left: i64 },
    Transitioned { finalized_id: u64, next_id: u64 },
    /// Another caller handled the transition first.
    AlreadyHandled { round_id: u64 },
    /// Price stayed stale for every allowed attempt.
    GaveUp { round_id: u64, attempts: u32 },
    Failed(GameError),
}

pub struct RoundKeeper {
    game: Arc<PredictionGame>,
    config: KeeperConfig,
    views: watch::Sender<Option<RoundView>>,
    last_check: Option<Instant>,
    consecutive_failures: u32,
}

impl RoundKeeper {
    pub fn new(game: Arc<PredictionGame>, config: KeeperConfig) -> Self {
        let (views, _) = watch::channel(None);
        Self {
            game,
            config,
            views,
            last_check: None,
            consecutive_failures: 0,
        }
    }

    /// Receiver of every view the keeper publishes.
    pub fn subscribe(&self) -> watch::Receiver<Option<RoundView>> {
        self.views.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Poll forever on the configured schedule.
    pub async fn run(mut self) {
        let period = Duration::from_secs(self.config.poll_interval_secs);
        let start = Instant::now() + Duration::from_secs(self.config.initial_delay_secs);
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            initial_delay_secs = self.config.initial_delay_secs,
            max_attempts = self.config.retry.max_attempts,
            "Round keeper started"
        );

        loop {
            ticker.tick().await;

            match self.run_once().await {
                CheckOutcome::Failed(e) => {
                    let backoff = self.failure_backoff();
                    error!(
                        error = %e,
                        failures = self.consecutive_failures,
                        backoff_secs = backoff.as_secs(),
                        "Round keeper check failed"
                    );
                    sleep(backoff).await;
                }
                CheckOutcome::Transitioned {
                    finalized_id,
                    next_id,
                } => info!(finalized_id, next_id, "Round keeper transitioned round"),
                outcome => debug!(?outcome, "Round keeper check"),
            }
        }
    }

    /// One throttled check, with a transition attempt when the round has expired.
    pub async fn run_once(&mut self) -> CheckOutcome {
        let min_gap = Duration::from_secs(self.config.min_poll_gap_secs);
        if let Some(last) = self.last_check {
            if last.elapsed() < min_gap {
                return CheckOutcome::Throttled;
            }
        }
        self.last_check = Some(Instant::now());

        let status = match self.blocking(|game| game.check_status()).await {
            Ok(status) => status,
            Err(GameError::NoActiveRound) => return self.start_first_round().await,
            Err(e) => return self.record_failure(e),
        };
        self.consecutive_failures = 0;
        self.publish_view().await;

        if !status.needs_transition {
            return CheckOutcome::Idle {
                round_id: status.round.id,
                time_left: status.time_left,
            };
        }

        let round_id = status.round.id;
        info!(
            round_id,
            delay_secs = self.config.transition_delay_secs,
            "Round expired, transitioning after delay"
        );
        sleep(Duration::from_secs(self.config.transition_delay_secs)).await;

        let outcome = self.transition_with_retry(round_id).await;
        self.publish_view().await;
        outcome
    }

    async fn transition_with_retry(&mut self, round_id: u64) -> CheckOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .blocking(move |game| game.trigger_transition_for(round_id))
                .await
            {
                Ok(outcome) => {
                    return CheckOutcome::Transitioned {
                        finalized_id: outcome.finalized.id,
                        next_id: outcome.next.id,
                    }
                }
                Err(e) if e.is_idempotency_signal() => {
                    debug!(round_id, error = %e, "Transition already handled");
                    return CheckOutcome::AlreadyHandled { round_id };
                }
                Err(e) if e.is_retryable() => match self.config.retry.delay_after(attempts) {
                    Some(delay) => {
                        warn!(
                            round_id,
                            attempt = attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Transition blocked by price feed, will retry"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        warn!(round_id, attempts, error = %e, "Transition retries exhausted");
                        return CheckOutcome::GaveUp { round_id, attempts };
                    }
                },
                Err(e) => return self.record_failure(e),
            }
        }
    }

    async fn start_first_round(&mut self) -> CheckOutcome {
        match self.blocking(|game| game.bootstrap()).await {
            Ok(round) => {
                self.consecutive_failures = 0;
                self.publish_view().await;
                CheckOutcome::Started { round_id: round.id }
            }
            Err(e) => self.record_failure(e),
        }
    }

    async fn publish_view(&self) {
        match self.blocking(|game| RoundView::snapshot(game)).await {
            Ok(view) => {
                self.views.send_replace(Some(view));
            }
            Err(e) => debug!(error = %e, "Could not build round view"),
        }
    }

    fn record_failure(&mut self, e: GameError) -> CheckOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        CheckOutcome::Failed(e)
    }

    /// Extra wait after a failed check: one poll interval, doubling per consecutive failure.
    fn failure_backoff(&self) -> Duration {
        let shift = self.consecutive_failures.saturating_sub(1).min(MAX_FAILURE_SHIFT);
        Duration::from_secs(self.config.poll_interval_secs.saturating_mul(1u64 << shift))
    }

    /// Run a synchronous game call off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, GameError>
    where
        T: Send + 'static,
        F: FnOnce(&PredictionGame) -> Result<T, GameError> + Send + 'static,
    {
        let game = self.game.clone();
        tokio::task::spawn_blocking(move || f(&game))
            .await
            .map_err(|e| GameError::Storage(format!("worker task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::GameConfig;
    use crate::ledger::RoundStore;
    use crate::price::{ManualFeed, PriceSource};

    const P60K: u128 = 6_000_000_000_000;
    const P61K: u128 = 6_100_000_000_000;

    fn setup(retry: RetryPolicy) -> (Arc<ManualClock>, Arc<ManualFeed>, RoundKeeper) {
        let clock = Arc::new(ManualClock::new(1_000));
        let feed = Arc::new(ManualFeed::with_price("oracle", P60K, 1_000));
        let prices = Arc::new(PriceSource::new(feed.clone(), clock.clone(), 1800));
        let game = Arc::new(PredictionGame::new(
            Arc::new(RoundStore::in_memory()),
            prices,
            clock.clone(),
            &GameConfig::default(),
        ));
        let config = KeeperConfig {
            enabled: true,
            poll_interval_secs: 60,
            min_poll_gap_secs: 0,
            initial_delay_secs: 0,
            transition_delay_secs: 0,
            retry,
        };
        (clock, feed, RoundKeeper::new(game, config))
    }

    fn no_wait_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            delay_secs: 0,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_after(0), None);
        assert_eq!(fixed.delay_after(1), Some(Duration::from_secs(120)));
        assert_eq!(fixed.delay_after(2), Some(Duration::from_secs(120)));
        assert_eq!(fixed.delay_after(3), None);

        let exp = RetryPolicy {
            delay_secs: 10,
            max_attempts: 5,
            backoff: Backoff::Exponential,
        };
        assert_eq!(exp.delay_after(1), Some(Duration::from_secs(10)));
        assert_eq!(exp.delay_after(3), Some(Duration::from_secs(40)));
        assert_eq!(exp.delay_after(5), None);
    }

    #[tokio::test]
    async fn test_keeper_starts_then_idles_then_transitions() {
        let (clock, feed, mut keeper) = setup(no_wait_retry(3));
        let views = keeper.subscribe();

        assert_eq!(keeper.run_once().await, CheckOutcome::Started { round_id: 1 });
        assert_eq!(views.borrow().as_ref().map(|v| v.round_id), Some(1));

        clock.advance(300);
        assert_eq!(
            keeper.run_once().await,
            CheckOutcome::Idle {
                round_id: 1,
                time_left: 600
            }
        );

        clock.advance(600);
        feed.set(P61K, clock.now());
        assert_eq!(
            keeper.run_once().await,
            CheckOutcome::Transitioned {
                finalized_id: 1,
                next_id: 2
            }
        );
        let view = views.borrow().clone().unwrap();
        assert_eq!(view.round_id, 2);
        assert_eq!(view.start_price, P61K);
        assert_eq!(view.time_left, "15:00");
    }

    #[tokio::test]
    async fn test_keeper_gives_up_on_stale_price() {
        let (clock, feed, mut keeper) = setup(no_wait_retry(2));
        keeper.run_once().await;

        clock.advance(5_000);
        feed.set(P61K, 1_000);
        let calls_before = feed.calls();
        assert_eq!(
            keeper.run_once().await,
            CheckOutcome::GaveUp {
                round_id: 1,
                attempts: 2
            }
        );
        // two strict reads for the attempts, plus display reads for the views
        assert!(feed.calls() >= calls_before + 2);
        assert_eq!(keeper.consecutive_failures(), 0);

        // the feed catches up and the next check succeeds
        feed.set(P61K, clock.now());
        assert!(matches!(
            keeper.run_once().await,
            CheckOutcome::Transitioned { .. }
        ));
    }

    #[tokio::test]
    async fn test_keeper_counts_failures_and_throttles() {
        let (_clock, feed, mut keeper) = setup(no_wait_retry(1));
        feed.fail("rpc down");
        assert!(matches!(
            keeper.run_once().await,
            CheckOutcome::Failed(GameError::OracleUnavailable(_))
        ));
        assert_eq!(keeper.consecutive_failures(), 1);
        assert_eq!(keeper.failure_backoff(), Duration::from_secs(60));

        keeper.run_once().await;
        assert_eq!(keeper.consecutive_failures(), 2);
        assert_eq!(keeper.failure_backoff(), Duration::from_secs(120));

        keeper.config.min_poll_gap_secs = 3600;
        assert_eq!(keeper.run_once().await, CheckOutcome::Throttled);
    }
}
