//! Background upkeep of the ledger database.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use beerbot_ledger::{LedgerError, LedgerStore};

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Drop dedup markers older than `retention_days` before `now`.
pub fn prune_dedup_markers(
    ledger: &LedgerStore,
    retention_days: u64,
    now: DateTime<Utc>,
) -> Result<usize, LedgerError> {
    let days = i64::try_from(retention_days).unwrap_or(i64::MAX);
    let cutoff = now
        .checked_sub_signed(chrono::Duration::days(days.min(365_000)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    ledger.prune_processed_before(cutoff)
}

/// Prune once at startup, then daily. Disabled when `retention_days` is 0.
pub fn spawn_dedup_pruner(
    ledger: LedgerStore,
    retention_days: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if retention_days == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            let store = ledger.clone();
            let pruned = tokio::task::spawn_blocking(move || {
                prune_dedup_markers(&store, retention_days, Utc::now())
            })
            .await;
            match pruned {
                Ok(Ok(removed)) if removed > 0 => {
                    info!(removed, retention_days, "pruned expired dedup markers");
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "dedup marker pruning failed"),
                Err(err) => warn!(error = %err, "dedup marker pruning task failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}
