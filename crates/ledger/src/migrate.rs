//! Self-migration of the ledger schema.
//!
//! Runs once at startup, before any traffic:
//! 1. create the ledger table when it does not exist;
//! 2. add missing optional columns (`ts_rfc`, `count`);
//! 3. rebuild the table when it lacks the `(giver_id, recipient_id, ts)`
//!    unique key, folding duplicate keys by summing their quantities;
//! 4. backfill missing canonical instants from the timestamp token.
//!
//! Every step is conditional, so running it against a migrated ledger
//! changes nothing.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{info, warn};

use beerbot_core::{format_instant, parse_token};

use crate::LedgerError;
use crate::schema::{
    LEDGER_INDEXES_DDL, LEDGER_TABLE, MigrationReport, PROCESSED_EVENTS_DDL, REBUILD_TABLE,
    REQUIRED_COLUMNS, UNIQUE_KEY, ledger_table_ddl,
};

pub fn run(conn: &mut Connection) -> Result<MigrationReport, LedgerError> {
    let mut report = MigrationReport::default();
    conn.execute_batch(PROCESSED_EVENTS_DDL)?;

    if !table_exists(conn, LEDGER_TABLE)? {
        conn.execute_batch(&ledger_table_ddl(LEDGER_TABLE))?;
        conn.execute_batch(LEDGER_INDEXES_DDL)?;
        info!("created ledger table");
        report.created = true;
        return Ok(report);
    }

    let columns = table_columns(conn, LEDGER_TABLE)?;
    for column in REQUIRED_COLUMNS {
        if !columns.contains(column) {
            return Err(LedgerError::MissingColumn {
                table: LEDGER_TABLE,
                column,
            });
        }
    }
    if !columns.contains("ts_rfc") {
        conn.execute_batch("ALTER TABLE beers ADD COLUMN ts_rfc TEXT;")?;
        report.added_columns.push("ts_rfc".to_string());
    }
    if !columns.contains("count") {
        conn.execute_batch("ALTER TABLE beers ADD COLUMN count INTEGER NOT NULL DEFAULT 1;")?;
        report.added_columns.push("count".to_string());
    }
    if !report.added_columns.is_empty() {
        info!(columns = ?report.added_columns, "added ledger columns");
    }

    if !has_unique_key(conn, LEDGER_TABLE)? {
        report.merged_rows = rebuild(conn)?;
        report.rebuilt = true;
    }

    let (backfilled, unparsed) = {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let counts = backfill_instants(&tx, LEDGER_TABLE)?;
        tx.commit()?;
        counts
    };
    report.backfilled = backfilled;
    report.unparsed = unparsed;
    if unparsed > 0 {
        warn!(unparsed, "ledger rows with unparseable timestamp tokens");
    }

    conn.execute_batch(LEDGER_INDEXES_DDL)?;
    Ok(report)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, LedgerError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_columns(conn: &Connection, table: &str) -> Result<BTreeSet<String>, LedgerError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
}

/// True when some unique index covers exactly the uniqueness key columns.
fn has_unique_key(conn: &Connection, table: &str) -> Result<bool, LedgerError> {
    let expected: BTreeSet<&str> = UNIQUE_KEY.into_iter().collect();

    let mut list = conn.prepare("SELECT name, \"unique\" FROM pragma_index_list(?1)")?;
    let indexes = list
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
    for (index, unique) in indexes {
        if unique == 0 {
            continue;
        }
        let columns = info
            .query_map(params![index], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        if columns.iter().map(String::as_str).eq(expected.iter().copied()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Copy the ledger into a fresh table with the full schema, one row per
/// uniqueness key, then swap it in. Returns the number of rows folded away.
fn rebuild(conn: &mut Connection) -> Result<u64, LedgerError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {REBUILD_TABLE};"))?;
    tx.execute_batch(&ledger_table_ddl(REBUILD_TABLE))?;

    let before: i64 = tx.query_row("SELECT COUNT(*) FROM beers", [], |row| row.get(0))?;
    tx.execute(
        &format!(
            "INSERT INTO {REBUILD_TABLE} (giver_id, recipient_id, ts, ts_rfc, count)
             SELECT giver_id, recipient_id, ts, MIN(ts_rfc), SUM(COALESCE(count, 1))
             FROM beers
             GROUP BY giver_id, recipient_id, ts
             ORDER BY MIN(rowid)"
        ),
        [],
    )?;
    let after: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM {REBUILD_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    backfill_instants(&tx, REBUILD_TABLE)?;

    tx.execute_batch(&format!(
        "DROP TABLE beers; ALTER TABLE {REBUILD_TABLE} RENAME TO beers;"
    ))?;
    tx.commit()?;

    let merged = u64::try_from(before - after).unwrap_or(0);
    info!(rows = after, merged, "rebuilt ledger table with unique key");
    Ok(merged)
}

/// Fill `ts_rfc` from `ts` where it is missing. Returns (filled, unparsed).
fn backfill_instants(conn: &Connection, table: &str) -> Result<(u64, u64), LedgerError> {
    let pending = {
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid, ts FROM {table} WHERE ts_rfc IS NULL OR ts_rfc = ''"
        ))?;
        stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };
    if pending.is_empty() {
        return Ok((0, 0));
    }

    let mut update = conn.prepare(&format!("UPDATE {table} SET ts_rfc = ?1 WHERE rowid = ?2"))?;
    let mut filled = 0;
    let mut unparsed = 0;
    for (rowid, token) in pending {
        match parse_token(&token) {
            Ok(instant) => {
                update.execute(params![format_instant(instant), rowid])?;
                filled += 1;
            }
            Err(err) => {
                warn!(rowid, token = %token, error = %err, "cannot backfill ledger instant");
                unparsed += 1;
            }
        }
    }
    Ok((filled, unparsed))
}
