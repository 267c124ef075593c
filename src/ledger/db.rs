//! SQLite persistence for the round store.
//!
//! Amounts and prices are `u128` and stored as decimal TEXT. Each [`Mutation`] is written in a
//! single SQL transaction together with its activity rows.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use super::{LedgerState, Mutation};
use crate::models::{Address, Direction, Round, Stake};
use crate::units::{format_amount, Amount};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub ts: i64,
    pub kind: String,
    pub round_id: Option<u64>,
    pub address: Option<String>,
    pub amount: Option<String>,
    pub detail: Option<String>,
}

pub struct LedgerDb {
    conn: Connection,
}

impl LedgerDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open ledger db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory ledger db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rounds (
                id INTEGER PRIMARY KEY,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                start_price TEXT NOT NULL,
                end_price TEXT,
                outcome TEXT,
                finalized INTEGER NOT NULL,
                finalized_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS stakes (
                id TEXT PRIMARY KEY,
                round_id INTEGER NOT NULL,
                bettor TEXT NOT NULL,
                amount TEXT NOT NULL,
                direction TEXT NOT NULL,
                placed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stakes_round ON stakes(round_id, bettor);
            CREATE TABLE IF NOT EXISTS pending_rewards (
                bettor TEXT PRIMARY KEY,
                amount TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pool_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS activity (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                round_id INTEGER,
                address TEXT,
                amount TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_activity_ts ON activity(ts DESC);",
        )
        .context("create ledger schema")?;

        Ok(Self { conn })
    }

    /// Rebuild the full in-memory state.
    pub fn load(&self) -> Result<LedgerState> {
        let mut stmt = self.conn.prepare(
            "SELECT id, start_time, end_time, start_price, end_price, outcome, finalized, finalized_at
             FROM rounds ORDER BY id ASC",
        )?;
        let rounds = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(
                |(id, start_time, end_time, start_price, end_price, outcome, finalized, finalized_at)|
                 -> Result<Round> {
                    Ok(Round {
                        id: id as u64,
                        start_time,
                        end_time,
                        start_price: parse_u128(&start_price)?,
                        end_price: end_price.as_deref().map(parse_u128).transpose()?,
                        outcome: outcome.as_deref().map(parse_direction).transpose()?,
                        finalized,
                        finalized_at,
                    })
                },
            )
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT id, round_id, bettor, amount, direction, placed_at FROM stakes ORDER BY placed_at ASC",
        )?;
        let stakes = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(id, round_id, bettor, amount, direction, placed_at)| -> Result<Stake> {
                Ok(Stake {
                    id: Uuid::parse_str(&id).context("bad stake id")?,
                    bettor: parse_address(&bettor)?,
                    round_id: round_id as u64,
                    amount: parse_u128(&amount)?,
                    direction: parse_direction(&direction)?,
                    placed_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare("SELECT bettor, amount FROM pending_rewards")?;
        let mut pending = HashMap::new();
        for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))? {
            let (bettor, amount) = row?;
            pending.insert(parse_address(&bettor)?, parse_u128(&amount)?);
        }

        let pool_balance = read_pool_balance(&self.conn)?;

        LedgerState::restore(rounds, stakes, pending, pool_balance)
    }

    /// Persist one mutation atomically.
    pub fn commit(&mut self, mutation: &Mutation) -> Result<()> {
        let tx = self.conn.transaction()?;

        match mutation {
            Mutation::Genesis { round } => {
                upsert_round(&tx, round)?;
                insert_activity(
                    &tx,
                    round.start_time,
                    mutation.kind(),
                    Some(round.id),
                    None,
                    None,
                    Some(format!("start_price={}", round.start_price)),
                )?;
            }
            Mutation::PlaceBet { stake } => {
                tx.execute(
                    "INSERT INTO stakes (id, round_id, bettor, amount, direction, placed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        stake.id.to_string(),
                        stake.round_id as i64,
                        stake.bettor.as_str(),
                        stake.amount.to_string(),
                        stake.direction.as_str(),
                        stake.placed_at,
                    ],
                )?;
                insert_activity(
                    &tx,
                    stake.placed_at,
                    mutation.kind(),
                    Some(stake.round_id),
                    Some(stake.bettor.as_str()),
                    Some(stake.amount),
                    Some(stake.direction.to_string()),
                )?;
            }
            Mutation::Transition {
                finalized,
                settlement,
                next,
            } => {
                let at = finalized.finalized_at.unwrap_or(next.start_time);
                upsert_round(&tx, finalized)?;
                upsert_round(&tx, next)?;
                adjust_pool(&tx, settlement.total_staked(), 0, at)?;
                for credit in &settlement.credits {
                    let current = read_pending(&tx, credit.bettor.as_str())?;
                    let owed = current.checked_add(credit.amount).ok_or_else(|| {
                        anyhow::anyhow!("pending rewards for {} overflow", credit.bettor)
                    })?;
                    tx.execute(
                        "INSERT INTO pending_rewards (bettor, amount, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(bettor) DO UPDATE SET
                            amount = excluded.amount,
                            updated_at = excluded.updated_at",
                        params![
                            credit.bettor.as_str(),
                            owed.to_string(),
                            at
                        ],
                    )?;
                    insert_activity(
                        &tx,
                        at,
                        "credit",
                        Some(finalized.id),
                        Some(credit.bettor.as_str()),
                        Some(credit.amount),
                        None,
                    )?;
                }
                insert_activity(
                    &tx,
                    at,
                    mutation.kind(),
                    Some(finalized.id),
                    None,
                    Some(settlement.retained()),
                    Some(format!(
                        "outcome={} end_price={} next_round={}",
                        settlement.outcome,
                        finalized.end_price.unwrap_or_default(),
                        next.id
                    )),
                )?;
            }
            Mutation::Claim { bettor, amount, at } => {
                tx.execute(
                    "DELETE FROM pending_rewards WHERE bettor = ?1",
                    [bettor.as_str()],
                )?;
                adjust_pool(&tx, 0, *amount, *at)?;
                insert_activity(&tx, *at, mutation.kind(), None, Some(bettor.as_str()), Some(*amount), None)?;
            }
            Mutation::Deposit { from, amount, at } => {
                adjust_pool(&tx, *amount, 0, *at)?;
                insert_activity(&tx, *at, mutation.kind(), None, Some(from.as_str()), Some(*amount), None)?;
            }
            Mutation::Withdraw { to, amount, at } => {
                adjust_pool(&tx, 0, *amount, *at)?;
                insert_activity(&tx, *at, mutation.kind(), None, Some(to.as_str()), Some(*amount), None)?;
            }
        }

        tx.commit().context("commit ledger transaction")?;
        Ok(())
    }

    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, ts, kind, round_id, address, amount, detail
             FROM activity ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(ActivityRecord {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    kind: row.get(2)?,
                    round_id: row.get::<_, Option<i64>>(3)?.map(|id| id as u64),
                    address: row.get(4)?,
                    amount: row.get(5)?,
                    detail: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn upsert_round(conn: &Connection, round: &Round) -> Result<()> {
    conn.execute(
        "INSERT INTO rounds (id, start_time, end_time, start_price, end_price, outcome, finalized, finalized_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            end_price = excluded.end_price,
            outcome = excluded.outcome,
            finalized = excluded.finalized,
            finalized_at = excluded.finalized_at",
        params![
            round.id as i64,
            round.start_time,
            round.end_time,
            round.start_price.to_string(),
            round.end_price.map(|p| p.to_string()),
            round.outcome.map(|d| d.as_str()),
            round.finalized,
            round.finalized_at,
        ],
    )?;
    Ok(())
}

fn read_pool_balance(conn: &Connection) -> Result<Amount> {
    let balance: Option<String> = conn
        .query_row("SELECT balance FROM pool_state WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    balance.as_deref().map(parse_u128).transpose().map(Option::unwrap_or_default)
}

fn adjust_pool(conn: &Connection, add: Amount, sub: Amount, at: i64) -> Result<()> {
    let balance = read_pool_balance(conn)?;
    let raised = balance.checked_add(add).ok_or_else(|| {
        anyhow::anyhow!("pool balance {} cannot absorb {}", format_amount(balance), format_amount(add))
    })?;
    let updated = raised
        .checked_sub(sub)
        .ok_or_else(|| anyhow::anyhow!("pool balance {} cannot cover {}", format_amount(raised), format_amount(sub)))?;
    conn.execute(
        "INSERT INTO pool_state (id, balance, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
            balance = excluded.balance,
            updated_at = excluded.updated_at",
        params![updated.to_string(), at],
    )?;
    Ok(())
}

fn read_pending(conn: &Connection, bettor: &str) -> Result<Amount> {
    let amount: Option<String> = conn
        .query_row(
            "SELECT amount FROM pending_rewards WHERE bettor = ?1",
            [bettor],
            |row| row.get(0),
        )
        .optional()?;
    amount.as_deref().map(parse_u128).transpose().map(Option::unwrap_or_default)
}

fn insert_activity(
    conn: &Connection,
    ts: i64,
    kind: &str,
    round_id: Option<u64>,
    address: Option<&str>,
    amount: Option<Amount>,
    detail: Option<String>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO activity (id, ts, kind, round_id, address, amount, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            ts,
            kind,
            round_id.map(|id| id as i64),
            address,
            amount.map(format_amount),
            detail,
        ],
    )?;
    Ok(())
}

fn parse_u128(raw: &str) -> Result<u128> {
    raw.parse()
        .with_context(|| format!("bad fixed-point value in ledger: {}", raw))
}

fn parse_direction(raw: &str) -> Result<Direction> {
    raw.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::parse(raw).ok_or_else(|| anyhow::anyhow!("bad address in ledger: {:?}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{settle, NoWinnerPolicy};
    use tempfile::NamedTempFile;

    fn stake(bettor: &str, amount: Amount, direction: Direction) -> Stake {
        Stake {
            id: Uuid::new_v4(),
            bettor: Address::parse(bettor).unwrap(),
            round_id: 1,
            amount,
            direction,
            placed_at: 50,
        }
    }

    fn run_round(db: &mut LedgerDb) -> LedgerState {
        let round = Round::open(1, 0, 900, 6_000_000_000_000);
        let stakes = vec![
            stake("alice", 10, Direction::Up),
            stake("bob", 20, Direction::Down),
        ];
        db.commit(&Mutation::Genesis { round: round.clone() }).unwrap();
        for s in &stakes {
            db.commit(&Mutation::PlaceBet { stake: s.clone() }).unwrap();
        }
        db.commit(&Mutation::Transition {
            finalized: round.finalize(6_100_000_000_000, 905),
            settlement: settle(1, Direction::Up, &stakes, NoWinnerPolicy::RetainInPool).unwrap(),
            next: Round::open(2, 905, 900, 6_100_000_000_000),
        })
        .unwrap();
        db.load().unwrap()
    }

    #[test]
    fn test_round_trip_through_file() {
        let temp = NamedTempFile::new().unwrap();
        let loaded = {
            let mut db = LedgerDb::open(temp.path()).unwrap();
            run_round(&mut db)
        };

        let reopened = LedgerDb::open(temp.path()).unwrap().load().unwrap();
        assert_eq!(reopened, loaded);
        assert_eq!(reopened.current_round().map(|r| r.id), Some(2));
        assert_eq!(
            reopened.round(1).and_then(|r| r.outcome),
            Some(Direction::Up)
        );
        assert_eq!(reopened.stakes_for(1).len(), 2);
        assert_eq!(reopened.pending_for(&Address::parse("alice").unwrap()), 30);
        assert_eq!(reopened.pool().balance, 30);
        assert_eq!(reopened.pool().escrowed, 0);
    }

    #[test]
    fn test_claim_and_pool_moves() {
        let mut db = LedgerDb::open_in_memory().unwrap();
        run_round(&mut db);
        let alice = Address::parse("alice").unwrap();
        db.commit(&Mutation::Deposit {
            from: alice.clone(),
            amount: 5,
            at: 1000,
        })
        .unwrap();
        db.commit(&Mutation::Claim {
            bettor: alice.clone(),
            amount: 30,
            at: 1001,
        })
        .unwrap();
        let state = db.load().unwrap();
        assert_eq!(state.pending_for(&alice), 0);
        assert_eq!(state.pool().balance, 5);

        // overdrawing the pool aborts the whole transaction
        let err = db.commit(&Mutation::Withdraw {
            to: alice,
            amount: 6,
            at: 1002,
        });
        assert!(err.is_err());
        assert_eq!(db.load().unwrap().pool().balance, 5);
    }

    #[test]
    fn test_activity_log() {
        let mut db = LedgerDb::open_in_memory().unwrap();
        run_round(&mut db);
        let activity = db.recent_activity(10).unwrap();
        let kinds: Vec<&str> = activity.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["finalize", "credit", "bet", "bet", "genesis"]);
        assert_eq!(activity[1].address.as_deref(), Some("alice"));
    }
}
