//! End-to-end round lifecycle tests.
//!
//! Drives a `PredictionGame` with a manual clock and a manual oracle feed through
//! betting, expiry, transition, settlement and claims, checking ledger invariants as it goes.

use std::sync::{Arc, Barrier};
use std::thread;

use roundbet_backend::clock::ManualClock;
use roundbet_backend::config::GameConfig;
use roundbet_backend::ledger::RoundStore;
use roundbet_backend::models::{Address, Direction, RoundPhase};
use roundbet_backend::price::{ManualFeed, PriceSource};
use roundbet_backend::settlement::NoWinnerPolicy;
use roundbet_backend::units::{parse_amount, Amount, PriceE8};
use roundbet_backend::{GameError, PredictionGame};

const CENT: Amount = 10_000_000_000_000_000;
const P60K: PriceE8 = 6_000_000_000_000;
const P61K: PriceE8 = 6_100_000_000_000;
const P59K: PriceE8 = 5_900_000_000_000;

struct Harness {
    clock: Arc<ManualClock>,
    feed: Arc<ManualFeed>,
    store: Arc<RoundStore>,
    game: Arc<PredictionGame>,
}

impl Harness {
    fn new(store: RoundStore, policy: NoWinnerPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let feed = Arc::new(ManualFeed::with_price("oracle", P60K, 0));
        Self::with_parts(Arc::new(store), clock, feed, policy)
    }

    fn with_parts(
        store: Arc<RoundStore>,
        clock: Arc<ManualClock>,
        feed: Arc<ManualFeed>,
        policy: NoWinnerPolicy,
    ) -> Self {
        let prices = Arc::new(PriceSource::new(feed.clone(), clock.clone(), 1800));
        let config = GameConfig {
            no_winner_policy: policy,
            pool_owner: Some(addr("0xowner")),
            ..GameConfig::default()
        };
        let game = Arc::new(PredictionGame::new(
            store.clone(),
            prices,
            clock.clone(),
            &config,
        ));
        game.bootstrap().unwrap();
        Self {
            clock,
            feed,
            store,
            game,
        }
    }

    /// Expire the current round and close it at `price`.
    fn close_at(&self, price: PriceE8) -> roundbet_backend::round::TransitionOutcome {
        let end = self.game.current_round().unwrap().end_time;
        self.clock.set(end);
        self.feed.set(price, end);
        self.game.trigger_transition().unwrap()
    }

    fn assert_invariants(&self) {
        self.store.read(|state| state.check_invariants()).unwrap();
    }
}

fn addr(raw: &str) -> Address {
    Address::parse(raw).unwrap()
}

#[test]
fn test_bets_settle_and_claim_once() {
    let h = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);
    let alice = addr("0xAlice");
    let bob = addr("0xbob");

    h.game.place_bet(&alice, Direction::Up, CENT).unwrap();
    h.game.place_bet(&bob, Direction::Down, 2 * CENT).unwrap();
    assert_eq!(h.game.pool().escrowed, 3 * CENT);

    let outcome = h.close_at(P61K);
    assert_eq!(outcome.finalized.outcome, Some(Direction::Up));
    assert_eq!(outcome.next.id, 2);
    assert_eq!(outcome.next.start_price, P61K);

    assert_eq!(h.game.pending_rewards(&alice), 3 * CENT);
    assert_eq!(h.game.pending_rewards(&bob), 0);

    let pool = h.game.pool();
    assert_eq!(pool.escrowed, 0);
    assert_eq!(pool.balance, 3 * CENT);
    assert_eq!(pool.withdrawable(), 0);
    h.assert_invariants();

    assert_eq!(h.game.claim_rewards(&alice).unwrap(), 3 * CENT);
    assert_eq!(h.game.claim_rewards(&alice), Err(GameError::NoRewardsAvailable));
    assert_eq!(h.game.claim_rewards(&bob), Err(GameError::NoRewardsAvailable));
    assert_eq!(h.game.pool_balance(), 0);
    h.assert_invariants();
}

#[test]
fn test_single_active_round_and_continuity() {
    let h = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);

    for price in [P61K, P59K, P59K, P60K] {
        h.close_at(price);
        let current = h.game.current_round().unwrap();
        assert!(!current.finalized);
        assert_eq!(current.start_price, price);
        h.assert_invariants();
    }

    assert_eq!(h.game.current_round_id().unwrap(), 5);
    let history = h.game.rounds(10);
    assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 3, 2, 1]);
    for pair in history.windows(2) {
        assert_eq!(pair[1].end_price, Some(pair[0].start_price));
    }

    // round 3 closed flat at 59k: ties resolve down
    assert_eq!(h.game.round(3).unwrap().outcome, Some(Direction::Down));
}

#[test]
fn test_transition_is_finalize_once() {
    let h = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);

    assert!(matches!(
        h.game.trigger_transition_for(1),
        Err(GameError::RoundNotExpired { round_id: 1, .. })
    ));

    h.close_at(P61K);
    let calls_after_first = h.feed.calls();

    assert_eq!(
        h.game.trigger_transition_for(1),
        Err(GameError::RoundAlreadyFinalized { round_id: 1 })
    );
    assert_eq!(h.game.trigger_transition_for(7), Err(GameError::RoundNotFound(7)));
    // redundant callers never reach the oracle
    assert_eq!(h.feed.calls(), calls_after_first);
    assert_eq!(h.game.round(1).unwrap().end_price, Some(P61K));
}

#[test]
fn test_concurrent_transitions_commit_exactly_once() {
    let h = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);
    h.game.place_bet(&addr("0xalice"), Direction::Up, CENT).unwrap();
    h.game.place_bet(&addr("0xbob"), Direction::Down, CENT).unwrap();
    h.clock.set(900);
    h.feed.set(P61K, 900);

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let game = h.game.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                game.trigger_transition_for(1)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_eq!(
            result.as_ref().unwrap_err(),
            &GameError::RoundAlreadyFinalized { round_id: 1 }
        );
    }

    assert_eq!(h.game.current_round_id().unwrap(), 2);
    assert_eq!(h.game.pending_rewards(&addr("0xalice")), 2 * CENT);
    assert_eq!(h.game.pool().balance, 2 * CENT);
    h.assert_invariants();
}

#[test]
fn test_stale_price_blocks_finalization() {
    let h = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);
    h.clock.set(2_000);

    let err = h.game.trigger_transition().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        err,
        GameError::PriceFeedTooOld {
            age_secs: 2_000,
            max_age_secs: 1800
        }
    );

    let status = h.game.check_status().unwrap();
    assert_eq!(status.phase, RoundPhase::Expired);
    assert!(status.needs_transition);
    assert!(!status.round.finalized);
    assert_eq!(
        h.game.place_bet(&addr("0xlate"), Direction::Up, CENT),
        Err(GameError::RoundEnded { round_id: 1 })
    );

    h.feed.fail("rpc timeout");
    assert!(matches!(
        h.game.trigger_transition(),
        Err(GameError::OracleUnavailable(_))
    ));

    h.feed.set(P59K, 1_990);
    let outcome = h.game.trigger_transition().unwrap();
    assert_eq!(outcome.finalized.finalized_at, Some(2_000));
    assert_eq!(outcome.next.start_time, 2_000);
    assert_eq!(outcome.next.end_time, 2_900);
    h.assert_invariants();
}

#[test]
fn test_no_winner_policies() {
    let retain = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RetainInPool);
    retain.game.place_bet(&addr("0xalice"), Direction::Up, 5 * CENT).unwrap();
    let outcome = retain.close_at(P59K);
    assert_eq!(outcome.settlement.retained(), 5 * CENT);
    assert_eq!(retain.game.pool().withdrawable(), 5 * CENT);

    assert_eq!(
        retain.game.withdraw_from_pool(&addr("0xalice"), CENT),
        Err(GameError::NotPoolOwner)
    );
    let pool = retain.game.withdraw_from_pool(&addr("0xowner"), 5 * CENT).unwrap();
    assert_eq!(pool.balance, 0);

    let refund = Harness::new(RoundStore::in_memory(), NoWinnerPolicy::RefundAll);
    refund.game.place_bet(&addr("0xalice"), Direction::Up, 5 * CENT).unwrap();
    let outcome = refund.close_at(P59K);
    assert!(outcome.settlement.refunded);
    assert_eq!(refund.game.pending_rewards(&addr("0xalice")), 5 * CENT);
    assert_eq!(refund.game.pool().withdrawable(), 0);
    refund.assert_invariants();
}

#[test]
fn test_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let clock = Arc::new(ManualClock::new(0));
    let feed = Arc::new(ManualFeed::with_price("oracle", P60K, 0));
    let before = {
        let store = Arc::new(RoundStore::open(&path).unwrap());
        let h = Harness::with_parts(store, clock.clone(), feed.clone(), NoWinnerPolicy::RetainInPool);
        h.game.place_bet(&addr("0xalice"), Direction::Up, CENT).unwrap();
        h.clock.advance(10);
        h.game.place_bet(&addr("0xbob"), Direction::Down, 3 * CENT).unwrap();
        h.close_at(P61K);
        h.clock.advance(10);
        h.game.place_bet(&addr("0xbob"), Direction::Up, CENT).unwrap();
        h.game.deposit_to_pool(&addr("0xowner"), 2 * CENT).unwrap();
        h.store.read(|state| state.clone())
    };

    let store = Arc::new(RoundStore::open(&path).unwrap());
    assert!(store.is_persistent());
    assert_eq!(store.read(|state| state.clone()), before);

    // bootstrap on a populated ledger keeps the current round
    let h = Harness::with_parts(store, clock, feed, NoWinnerPolicy::RetainInPool);
    assert_eq!(h.game.current_round_id().unwrap(), 2);
    assert_eq!(h.game.pending_rewards(&addr("0xalice")), 4 * CENT);
    assert_eq!(h.game.pool().escrowed, CENT);

    let activity = h.game.recent_activity(10).unwrap();
    assert!(!activity.is_empty());
}

#[test]
fn test_oversized_bets_rejected_and_ledger_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let clock = Arc::new(ManualClock::new(0));
    let feed = Arc::new(ManualFeed::with_price("oracle", P60K, 0));
    let huge = parse_amount("200000000000000000000").unwrap();

    let before = {
        let store = Arc::new(RoundStore::open(&path).unwrap());
        let h = Harness::with_parts(store, clock.clone(), feed.clone(), NoWinnerPolicy::RetainInPool);
        h.game.place_bet(&addr("0xalice"), Direction::Up, huge).unwrap();
        let before = h.store.read(|state| state.clone());

        assert_eq!(
            h.game.place_bet(&addr("0xbob"), Direction::Down, huge),
            Err(GameError::InvalidAmount)
        );
        assert_eq!(
            h.game.deposit_to_pool(&addr("0xowner"), huge),
            Err(GameError::InvalidAmount)
        );
        assert_eq!(h.store.read(|state| state.clone()), before);
        assert!(h.game.user_bets(1, &addr("0xbob")).is_empty());
        before
    };

    let store = Arc::new(RoundStore::open(&path).unwrap());
    assert_eq!(store.read(|state| state.clone()), before);

    let h = Harness::with_parts(store, clock, feed, NoWinnerPolicy::RetainInPool);
    let outcome = h.close_at(P61K);
    assert_eq!(outcome.settlement.winning_total, huge);
    assert_eq!(h.game.pending_rewards(&addr("0xalice")), huge);
    h.assert_invariants();
}
