use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beerbot_core::{GiftMap, QuotaDecision, parse_token, total_units};

use crate::LedgerError;

pub(crate) const LEDGER_TABLE: &str = "beers";
pub(crate) const REBUILD_TABLE: &str = "beers_rebuild";

/// Columns every ledger table must already carry; migration cannot invent them.
pub(crate) const REQUIRED_COLUMNS: [&str; 3] = ["giver_id", "recipient_id", "ts"];

/// Columns forming the uniqueness key, in declaration order.
pub(crate) const UNIQUE_KEY: [&str; 3] = ["giver_id", "recipient_id", "ts"];

pub(crate) const PROCESSED_EVENTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_processed_events_ts ON processed_events (ts);
"#;

pub(crate) const LEDGER_INDEXES_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_beers_giver_day ON beers (giver_id, ts_rfc);
CREATE INDEX IF NOT EXISTS idx_beers_recipient_day ON beers (recipient_id, ts_rfc);
"#;

pub(crate) fn ledger_table_ddl(table: &str) -> String {
    format!(
        r#"
CREATE TABLE {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  giver_id TEXT NOT NULL,
  recipient_id TEXT NOT NULL,
  ts TEXT NOT NULL,
  ts_rfc TEXT,
  count INTEGER NOT NULL DEFAULT 1,
  UNIQUE (giver_id, recipient_id, ts)
);
"#
    )
}

/// All gifts carried by one inbound message, ready to be settled against the
/// ledger in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftBatch {
    pub event_key: String,
    pub giver: String,
    /// Platform-native timestamp token of the message.
    pub token: String,
    pub instant: DateTime<Utc>,
    pub gifts: GiftMap,
    pub seen_at: DateTime<Utc>,
}

impl GiftBatch {
    pub fn new(
        event_key: impl Into<String>,
        giver: impl Into<String>,
        token: impl Into<String>,
        gifts: GiftMap,
        seen_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let giver = giver.into();
        if let Some((recipient, _)) = gifts.iter().find(|(_, quantity)| **quantity == 0) {
            return Err(LedgerError::ZeroQuantity {
                giver,
                recipient: recipient.clone(),
            });
        }
        let token = token.into();
        let instant = parse_token(&token).map_err(|source| LedgerError::InvalidToken {
            token: token.clone(),
            source,
        })?;
        Ok(Self {
            event_key: event_key.into(),
            giver,
            token,
            instant,
            gifts,
            seen_at,
        })
    }

    pub fn total_units(&self) -> u64 {
        total_units(&self.gifts)
    }
}

/// Result of settling a [`GiftBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The event key was already claimed; nothing was written.
    Duplicate,
    /// The key is now claimed but the quota refused the whole message.
    Rejected(QuotaDecision),
    /// Every gift in the batch was written.
    Recorded { units: u64, given_today: u64 },
    /// Within quota, but the ledger is read-only: only the claim was
    /// committed. `given_today` is the stored total before this batch.
    Admitted { units: u64, given_today: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedUser {
    pub user: String,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub created: bool,
    pub added_columns: Vec<String>,
    pub rebuilt: bool,
    /// Rows folded into an existing key during a rebuild.
    pub merged_rows: u64,
    pub backfilled: u64,
    /// Rows whose token could not be parsed; their instant stays empty.
    pub unparsed: u64,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        !self.created
            && self.added_columns.is_empty()
            && !self.rebuilt
            && self.backfilled == 0
    }
}
