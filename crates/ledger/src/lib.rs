//! Durable gift ledger and processed-event markers backed by SQLite.

pub mod error;
pub mod migrate;
pub mod schema;
pub mod store;

pub use error::LedgerError;
pub use schema::{GiftBatch, MigrationReport, RankedUser, Settlement};
pub use store::LedgerStore;
