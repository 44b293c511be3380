use rusqlite::ErrorCode;
use thiserror::Error;

use beerbot_core::TimestampError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table `{table}` is missing required column `{column}`")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("invalid timestamp token {token:?}: {source}")]
    InvalidToken {
        token: String,
        #[source]
        source: TimestampError,
    },

    #[error("gift from {giver} to {recipient} must carry at least one unit")]
    ZeroQuantity { giver: String, recipient: String },
}

impl LedgerError {
    /// Errors that say nothing about the data itself: contention, disk or
    /// file-system trouble. The enclosing transaction was rolled back, so the
    /// same event can be applied again on redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
                    | ErrorCode::OutOfMemory
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
