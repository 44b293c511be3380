use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use beerbot_core::{QuotaDecision, format_instant};

use crate::schema::{GiftBatch, MigrationReport, RankedUser, Settlement};
use crate::{LedgerError, migrate};

const UPSERT_GIFT: &str = "INSERT INTO beers (giver_id, recipient_id, ts, ts_rfc, count)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (giver_id, recipient_id, ts) DO UPDATE SET count = count + excluded.count";

/// Handle on the ledger database.
///
/// Every call opens its own connection, so clones can be used from any number
/// of blocking tasks at once; SQLite serialises the writers.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    /// Bring the schema up to date. Must run before any other call.
    pub fn migrate(&self) -> Result<MigrationReport, LedgerError> {
        let mut conn = self.open()?;
        migrate::run(&mut conn)
    }

    // ── Dedup gate ─────────────────────────────────────────────────────────

    /// Record `key` as processed. Exactly one caller per key ever sees `true`.
    pub fn try_claim(&self, key: &str, seen_at: DateTime<Utc>) -> Result<bool, LedgerError> {
        let conn = self.open()?;
        claim(&conn, key, seen_at)
    }

    pub fn is_processed(&self, key: &str) -> Result<bool, LedgerError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Drop markers first seen before `cutoff`. Returns how many were removed.
    pub fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM processed_events WHERE datetime(ts) < datetime(?1)",
            params![format_instant(cutoff)],
        )?;
        Ok(removed)
    }

    // ── Writes ─────────────────────────────────────────────────────────────

    /// Add `quantity` to the gift keyed by (giver, recipient, token), creating
    /// it when absent. A zero quantity is refused.
    pub fn record_gift(
        &self,
        giver: &str,
        recipient: &str,
        token: &str,
        instant: DateTime<Utc>,
        quantity: u32,
    ) -> Result<(), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::ZeroQuantity {
                giver: giver.to_string(),
                recipient: recipient.to_string(),
            });
        }
        let conn = self.open()?;
        conn.execute(
            UPSERT_GIFT,
            params![giver, recipient, token, format_instant(instant), quantity],
        )?;
        Ok(())
    }

    /// Claim the batch's event key, check the giver's allowance for `today`
    /// and write every gift, all in one transaction.
    ///
    /// A quota rejection still commits the claim. Any error rolls back the
    /// claim too, so the event can be applied on redelivery.
    pub fn settle(
        &self,
        batch: &GiftBatch,
        today: NaiveDate,
        max_per_day: u64,
    ) -> Result<Settlement, LedgerError> {
        self.settle_batch(batch, today, max_per_day, true)
    }

    /// Like [`settle`](Self::settle), but an admitted batch only commits the
    /// claim and leaves the gift table untouched.
    pub fn settle_read_only(
        &self,
        batch: &GiftBatch,
        today: NaiveDate,
        max_per_day: u64,
    ) -> Result<Settlement, LedgerError> {
        self.settle_batch(batch, today, max_per_day, false)
    }

    fn settle_batch(
        &self,
        batch: &GiftBatch,
        today: NaiveDate,
        max_per_day: u64,
        write: bool,
    ) -> Result<Settlement, LedgerError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !claim(&tx, &batch.event_key, batch.seen_at)? {
            return Ok(Settlement::Duplicate);
        }

        let given_today = given_on_date(&tx, &batch.giver, today)?;
        let units = batch.total_units();
        let decision = QuotaDecision::decide(given_today, units, max_per_day);
        if !decision.is_admitted() {
            tx.commit()?;
            return Ok(Settlement::Rejected(decision));
        }
        if !write {
            tx.commit()?;
            debug!(key = %batch.event_key, giver = %batch.giver, units, "batch admitted, not written");
            return Ok(Settlement::Admitted { units, given_today });
        }

        let instant = format_instant(batch.instant);
        {
            let mut upsert = tx.prepare_cached(UPSERT_GIFT)?;
            for (recipient, quantity) in &batch.gifts {
                upsert.execute(params![batch.giver, recipient, batch.token, instant, quantity])?;
            }
        }
        tx.commit()?;
        debug!(key = %batch.event_key, giver = %batch.giver, units, "batch settled");

        Ok(Settlement::Recorded {
            units,
            given_today: given_today + units,
        })
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub fn sum_given_in_range(
        &self,
        giver: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, LedgerError> {
        let conn = self.open()?;
        sum(
            &conn,
            "SELECT COALESCE(SUM(count), 0) FROM beers
             WHERE giver_id = ?1 AND date(ts_rfc) BETWEEN ?2 AND ?3",
            giver,
            start,
            end,
        )
    }

    pub fn sum_received_in_range(
        &self,
        recipient: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, LedgerError> {
        let conn = self.open()?;
        sum(
            &conn,
            "SELECT COALESCE(SUM(count), 0) FROM beers
             WHERE recipient_id = ?1 AND date(ts_rfc) BETWEEN ?2 AND ?3",
            recipient,
            start,
            end,
        )
    }

    pub fn sum_given_on_date(&self, giver: &str, date: NaiveDate) -> Result<u64, LedgerError> {
        let conn = self.open()?;
        given_on_date(&conn, giver, date)
    }

    pub fn list_distinct_givers(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.open()?;
        distinct(&conn, "SELECT DISTINCT giver_id FROM beers ORDER BY giver_id")
    }

    pub fn list_distinct_recipients(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.open()?;
        distinct(
            &conn,
            "SELECT DISTINCT recipient_id FROM beers ORDER BY recipient_id",
        )
    }

    /// Givers ranked by quantity given in the window, ties by user id.
    pub fn top_givers(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RankedUser>, LedgerError> {
        let conn = self.open()?;
        ranked(
            &conn,
            "SELECT giver_id, SUM(count) AS total FROM beers
             WHERE date(ts_rfc) BETWEEN ?1 AND ?2
             GROUP BY giver_id
             ORDER BY total DESC, giver_id ASC
             LIMIT ?3",
            start,
            end,
            limit,
        )
    }

    /// Recipients ranked by quantity received in the window, ties by user id.
    pub fn top_receivers(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RankedUser>, LedgerError> {
        let conn = self.open()?;
        ranked(
            &conn,
            "SELECT recipient_id, SUM(count) AS total FROM beers
             WHERE date(ts_rfc) BETWEEN ?1 AND ?2
             GROUP BY recipient_id
             ORDER BY total DESC, recipient_id ASC
             LIMIT ?3",
            start,
            end,
            limit,
        )
    }
}

fn claim(conn: &Connection, key: &str, seen_at: DateTime<Utc>) -> Result<bool, LedgerError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processed_events (event_id, ts) VALUES (?1, ?2)",
        params![key, format_instant(seen_at)],
    )?;
    Ok(inserted == 1)
}

fn given_on_date(conn: &Connection, giver: &str, date: NaiveDate) -> Result<u64, LedgerError> {
    sum(
        conn,
        "SELECT COALESCE(SUM(count), 0) FROM beers
         WHERE giver_id = ?1 AND date(ts_rfc) BETWEEN ?2 AND ?3",
        giver,
        date,
        date,
    )
}

fn sum(
    conn: &Connection,
    sql: &str,
    user: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<u64, LedgerError> {
    let total: i64 = conn.query_row(
        sql,
        params![user, start.to_string(), end.to_string()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(total).unwrap_or(0))
}

fn distinct(conn: &Connection, sql: &str) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let users = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

fn ranked(
    conn: &Connection,
    sql: &str,
    start: NaiveDate,
    end: NaiveDate,
    limit: usize,
) -> Result<Vec<RankedUser>, LedgerError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(sql)?;
    let users = stmt
        .query_map(params![start.to_string(), end.to_string(), limit], |row| {
            Ok(RankedUser {
                user: row.get(0)?,
                total: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}
