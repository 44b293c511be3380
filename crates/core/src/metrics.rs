//! Counters injected into the processor and supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Not a gift candidate (wrong channel, subtype, thread reply, no marker).
    Ignored,
    Duplicate,
    Recorded,
    QuotaRejected,
    InvalidRecipient,
    SelfGift,
    StorageError,
}

pub trait MetricsSink: Send + Sync {
    fn record_outcome(&self, outcome: Outcome);
    fn record_reconnect(&self);
    fn set_connected(&self, connected: bool);
    fn set_degraded(&self, degraded: bool);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ignored: u64,
    pub duplicate: u64,
    pub recorded: u64,
    pub quota_rejected: u64,
    pub invalid_recipient: u64,
    pub self_gift: u64,
    pub storage_error: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub degraded: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    ignored: AtomicU64,
    duplicate: AtomicU64,
    recorded: AtomicU64,
    quota_rejected: AtomicU64,
    invalid_recipient: AtomicU64,
    self_gift: AtomicU64,
    storage_error: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
    degraded: AtomicBool,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ignored: self.ignored.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
            invalid_recipient: self.invalid_recipient.load(Ordering::Relaxed),
            self_gift: self.self_gift.load(Ordering::Relaxed),
            storage_error: self.storage_error.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Ignored => &self.ignored,
            Outcome::Duplicate => &self.duplicate,
            Outcome::Recorded => &self.recorded,
            Outcome::QuotaRejected => &self.quota_rejected,
            Outcome::InvalidRecipient => &self.invalid_recipient,
            Outcome::SelfGift => &self.self_gift,
            Outcome::StorageError => &self.storage_error,
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_outcome(&self, outcome: Outcome) {
        self.counter(outcome).fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_outcome_separately() {
        let metrics = InMemoryMetrics::new();
        metrics.record_outcome(Outcome::Recorded);
        metrics.record_outcome(Outcome::Recorded);
        metrics.record_outcome(Outcome::Duplicate);
        metrics.record_reconnect();
        metrics.set_connected(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.recorded, 2);
        assert_eq!(snap.duplicate, 1);
        assert_eq!(snap.quota_rejected, 0);
        assert_eq!(snap.reconnects, 1);
        assert!(snap.connected);
        assert!(!snap.degraded);
    }
}
