//! Connection supervisor: keeps one transport session alive, fans deliveries
//! out to the processor with bounded concurrency, and writes acknowledgements
//! back once the ledger has decided each event.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use beerbot_config::AppConfig;
use beerbot_core::{Delivery, MetricsSink, Transport, TransportSession};

use crate::commands::Health;
use crate::processor::{Disposition, EventProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    /// Consecutive reconnect attempts since the last successful connect.
    pub attempt: u32,
    pub degraded: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl HealthSnapshot {
    pub fn health(&self) -> Health {
        match (self.state, self.degraded) {
            (ConnectionState::Connected, false) => Health::Healthy,
            (ConnectionState::Connected, true) => Health::Degraded,
            _ => Health::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// `None` disables the liveness monitor.
    pub liveness_interval: Option<Duration>,
    pub probe_timeout: Duration,
    pub max_in_flight: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let supervisor = &config.supervisor;
        Self {
            backoff_base: supervisor.backoff_base(),
            backoff_cap: supervisor.backoff_cap(),
            liveness_interval: supervisor.liveness_interval(),
            probe_timeout: supervisor.probe_timeout(),
            max_in_flight: supervisor.max_in_flight,
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug)]
struct Tracked {
    state: ConnectionState,
    attempt: u32,
    degraded: bool,
    last_activity: Option<DateTime<Utc>>,
    /// Bumped on every successful connect.
    generation: u64,
}

/// Shared view of the supervisor's state, readable from the control socket.
#[derive(Clone)]
pub struct SupervisorHandle {
    tracked: Arc<Mutex<Tracked>>,
    metrics: Arc<dyn MetricsSink>,
}

impl SupervisorHandle {
    pub(crate) fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            tracked: Arc::new(Mutex::new(Tracked {
                state: ConnectionState::Disconnected,
                attempt: 0,
                degraded: false,
                last_activity: None,
                generation: 0,
            })),
            metrics,
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let tracked = self.lock();
        HealthSnapshot {
            state: tracked.state,
            attempt: tracked.attempt,
            degraded: tracked.degraded,
            last_activity: tracked.last_activity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut tracked = self.lock();
            tracked.state = state;
            if state != ConnectionState::Connected {
                tracked.degraded = false;
            }
        }
        self.metrics.set_connected(state == ConnectionState::Connected);
        if state != ConnectionState::Connected {
            self.metrics.set_degraded(false);
        }
    }

    fn mark_connected(&self) {
        {
            let mut tracked = self.lock();
            tracked.attempt = 0;
            tracked.generation = tracked.generation.wrapping_add(1);
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Generation of the current session, if one is connected.
    fn connected_generation(&self) -> Option<u64> {
        let tracked = self.lock();
        (tracked.state == ConnectionState::Connected).then_some(tracked.generation)
    }

    /// Current attempt number, advanced for the next retry.
    fn next_attempt(&self) -> u32 {
        let mut tracked = self.lock();
        let attempt = tracked.attempt;
        tracked.attempt = tracked.attempt.saturating_add(1);
        attempt
    }

    fn touch(&self) {
        self.lock().last_activity = Some(Utc::now());
    }

    /// Record a probe result for session `generation`. Ignored, returning
    /// false, when that session is no longer the connected one.
    fn set_degraded_for(&self, generation: u64, degraded: bool) -> bool {
        {
            let mut tracked = self.lock();
            if tracked.state != ConnectionState::Connected || tracked.generation != generation {
                return false;
            }
            tracked.degraded = degraded;
        }
        self.metrics.set_degraded(degraded);
        true
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

pub struct Supervisor {
    transport: Arc<dyn Transport>,
    processor: Arc<EventProcessor>,
    metrics: Arc<dyn MetricsSink>,
    settings: SupervisorSettings,
    handle: SupervisorHandle,
}

impl Supervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<EventProcessor>,
        metrics: Arc<dyn MetricsSink>,
        settings: SupervisorSettings,
    ) -> Self {
        let handle = SupervisorHandle::new(metrics.clone());
        Self {
            transport,
            processor,
            metrics,
            settings,
            handle,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Connect, pump deliveries, reconnect with backoff; until `shutdown`
    /// flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            self.handle.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(mut session) => {
                    self.handle.mark_connected();
                    info!("transport session established");
                    let end = self
                        .pump(session.as_mut(), &mut shutdown, &mut tasks, &permits)
                        .await;
                    match end {
                        SessionEnd::Shutdown => {
                            if let Err(err) = session.close().await {
                                debug!(error = %err, "session close failed");
                            }
                            break;
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(%reason, "transport session dropped; reconnecting");
                            self.metrics.record_reconnect();
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, attempt = self.handle.health().attempt, "transport connect failed");
                }
            }

            self.handle.set_state(ConnectionState::Disconnected);
            let attempt = self.handle.next_attempt();
            let delay = backoff_delay(self.settings.backoff_base, self.settings.backoff_cap, attempt);
            debug!(attempt, ?delay, "waiting before reconnect");
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = sleep(delay) => {}
            }
        }

        self.handle.set_state(ConnectionState::ShuttingDown);
        while let Some(joined) = tasks.join_next().await {
            log_task_result(joined);
        }
        info!("supervisor stopped");
    }

    async fn pump(
        &self,
        session: &mut dyn TransportSession,
        shutdown: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
    ) -> SessionEnd {
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<String>();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_task_result(joined);
            }

            tokio::select! {
                biased;
                _ = stopped(shutdown) => {
                    // Stop reading, let in-flight events settle, flush their acks.
                    while let Some(joined) = tasks.join_next().await {
                        log_task_result(joined);
                    }
                    while let Ok(envelope_id) = ack_rx.try_recv() {
                        if let Err(err) = session.acknowledge(&envelope_id).await {
                            warn!(error = %err, %envelope_id, "ack during shutdown failed");
                            break;
                        }
                    }
                    return SessionEnd::Shutdown;
                }
                Some(envelope_id) = ack_rx.recv() => {
                    if let Err(err) = session.acknowledge(&envelope_id).await {
                        return SessionEnd::Dropped(format!("ack failed: {err}"));
                    }
                }
                next = session.next_delivery() => match next {
                    Ok(Some(delivery)) => {
                        self.handle.touch();
                        self.dispatch(delivery, tasks, permits, &ack_tx).await;
                    }
                    Ok(None) => return SessionEnd::Dropped("closed by remote".to_string()),
                    Err(err) => return SessionEnd::Dropped(err.to_string()),
                },
            }
        }
    }

    async fn dispatch(
        &self,
        delivery: Delivery,
        tasks: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
        ack_tx: &mpsc::UnboundedSender<String>,
    ) {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let processor = self.processor.clone();
        let ack_tx = ack_tx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let envelope_id = delivery.envelope_id.clone();
            let decision = processor.decide(delivery).await;
            match (decision.disposition, envelope_id) {
                (Disposition::Acknowledge, Some(envelope_id)) => {
                    // The session may be gone; redelivery is deduplicated.
                    let _ = ack_tx.send(envelope_id);
                }
                (Disposition::Redeliver, Some(envelope_id)) => {
                    debug!(%envelope_id, "leaving envelope unacknowledged");
                }
                (_, None) => {}
            }
            processor.post_replies(decision.replies).await;
        });
    }

    /// Periodically confirm the platform still answers while the session
    /// looks connected.
    pub fn spawn_liveness_monitor(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let interval = self.settings.liveness_interval?;
        let probe_timeout = self.settings.probe_timeout;
        let transport = self.transport.clone();
        let handle = self.handle.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    _ = sleep(interval) => {}
                }
                let Some(generation) = handle.connected_generation() else {
                    continue;
                };
                let alive = probe(transport.as_ref(), probe_timeout).await;
                let was_degraded = handle.health().degraded;
                if !handle.set_degraded_for(generation, !alive) {
                    debug!(alive, "session changed during probe; result dropped");
                    continue;
                }
                if alive && was_degraded {
                    info!("liveness probe recovered");
                } else if !alive && !was_degraded {
                    warn!("liveness probe failed while connected; marking degraded");
                }
            }
        }))
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn probe(transport: &dyn Transport, limit: Duration) -> bool {
    match timeout(limit, transport.probe_identity()).await {
        Ok(Ok(user_id)) => {
            debug!(%user_id, "liveness probe ok");
            true
        }
        Ok(Err(err)) => {
            debug!(error = %err, "liveness probe error");
            false
        }
        Err(_) => false,
    }
}

fn log_task_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "event task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use beerbot_core::{InMemoryMetrics, InboundEvent, Outbound, TransportError};
    use beerbot_ledger::LedgerStore;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use crate::processor::tests::{Harness, harness, harness_on, message};

    struct ScriptedSession {
        deliveries: VecDeque<Delivery>,
        acks: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
            match self.deliveries.pop_front() {
                Some(delivery) => Ok(Some(delivery)),
                None => std::future::pending().await,
            }
        }

        async fn acknowledge(&mut self, envelope_id: &str) -> Result<(), TransportError> {
            self.acks.lock().unwrap().push(envelope_id.to_string());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Each connect pops the next script entry: `None` fails, `Some` opens a
    /// session with those deliveries.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Option<Vec<Delivery>>>>,
        acks: Arc<Mutex<Vec<String>>>,
        probe_ok: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Option<Vec<Delivery>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                acks: Arc::new(Mutex::new(Vec::new())),
                probe_ok: true,
            }
        }

        fn acks(&self) -> Vec<String> {
            self.acks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Outbound for ScriptedTransport {
        async fn post_message(&self, _channel: &str, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn post_ephemeral(&self, _channel: &str, _user: &str, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Some(deliveries)) => Ok(Box::new(ScriptedSession {
                    deliveries: deliveries.into(),
                    acks: self.acks.clone(),
                })),
                Some(None) => Err(TransportError::Connect("scripted failure".to_string())),
                None => std::future::pending().await,
            }
        }

        async fn probe_identity(&self) -> Result<String, TransportError> {
            if self.probe_ok {
                Ok("UBOT".to_string())
            } else {
                Err(TransportError::Api("invalid_auth".to_string()))
            }
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            liveness_interval: Some(Duration::from_millis(10)),
            probe_timeout: Duration::from_millis(100),
            max_in_flight: 4,
        }
    }

    fn delivery(envelope_id: &str, text: &str, ts: &str) -> Delivery {
        Delivery {
            envelope_id: Some(envelope_id.to_string()),
            event: InboundEvent::Message(message("G", text, ts)),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 7), cap);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[test]
    fn health_follows_state_and_probe() {
        let mut snapshot = HealthSnapshot {
            state: ConnectionState::Connected,
            attempt: 0,
            degraded: false,
            last_activity: None,
        };
        assert_eq!(snapshot.health(), Health::Healthy);
        snapshot.degraded = true;
        assert_eq!(snapshot.health(), Health::Degraded);
        snapshot.state = ConnectionState::Connecting;
        assert_eq!(snapshot.health(), Health::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_and_acks_after_processing() {
        let Harness {
            _dir,
            ledger,
            metrics,
            processor,
            ..
        } = harness();
        let transport = Arc::new(ScriptedTransport::new(vec![
            None,
            Some(vec![
                delivery("e1", "<@U1> 🍺", "1717691574.000100"),
                delivery("e1", "<@U1> 🍺", "1717691574.000100"),
            ]),
        ]));
        let supervisor = Supervisor::new(
            transport.clone(),
            Arc::new(processor),
            metrics.clone(),
            settings(),
        );
        let handle = supervisor.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(supervisor.run(shutdown_rx));

        wait_until(|| transport.acks().len() == 2).await;
        let health = handle.health();
        assert_eq!(health.state, ConnectionState::Connected);
        assert_eq!(health.attempt, 0);
        assert!(health.last_activity.is_some());
        assert!(metrics.snapshot().connected);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(transport.acks(), vec!["e1", "e1"]);
        let day = NaiveDate::from_ymd_opt(2024, 6, 6).unwrap();
        assert_eq!(ledger.sum_given_on_date("G", day).unwrap(), 1);
        assert_eq!(handle.health().state, ConnectionState::ShuttingDown);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recorded, 1);
        assert_eq!(snapshot.duplicate, 1);
        assert!(!snapshot.connected);
    }

    #[tokio::test]
    async fn storage_failure_is_not_acknowledged() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("ledger.db");
        std::fs::create_dir_all(&blocked).unwrap();
        let Harness {
            _dir,
            metrics,
            processor,
            ..
        } = harness_on(dir, LedgerStore::new(blocked));

        let transport = Arc::new(ScriptedTransport::new(vec![Some(vec![delivery(
            "e1",
            "<@U1> 🍺",
            "1717691574.000100",
        )])]));
        let supervisor = Supervisor::new(
            transport.clone(),
            Arc::new(processor),
            metrics.clone(),
            settings(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(supervisor.run(shutdown_rx));

        wait_until(|| metrics.snapshot().storage_error == 1).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
        assert!(transport.acks().is_empty());
    }

    #[tokio::test]
    async fn failed_probe_marks_connected_session_degraded() {
        let Harness {
            _dir,
            metrics,
            processor,
            ..
        } = harness();
        let mut transport = ScriptedTransport::new(vec![Some(Vec::new())]);
        transport.probe_ok = false;
        let transport = Arc::new(transport);
        let supervisor = Supervisor::new(
            transport,
            Arc::new(processor),
            metrics.clone(),
            settings(),
        );
        let handle = supervisor.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = supervisor
            .spawn_liveness_monitor(shutdown_rx.clone())
            .expect("monitor enabled");
        let running = tokio::spawn(supervisor.run(shutdown_rx));

        wait_until(|| handle.health().health() == Health::Degraded).await;
        assert!(metrics.snapshot().degraded);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
        monitor.await.unwrap();
        assert!(!metrics.snapshot().degraded);
    }

    #[tokio::test]
    async fn acknowledges_before_replies_are_posted() {
        let Harness {
            _dir,
            ledger,
            outbound,
            metrics,
            processor,
        } = harness();
        let gate = Arc::new(Semaphore::new(0));
        *outbound.gate.lock().unwrap() = Some(gate.clone());

        let transport = Arc::new(ScriptedTransport::new(vec![Some(vec![delivery(
            "e1",
            "<@U1> 🍺",
            "1717691574.000100",
        )])]));
        let supervisor = Supervisor::new(transport.clone(), Arc::new(processor), metrics, settings());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(supervisor.run(shutdown_rx));

        wait_until(|| transport.acks().len() == 1).await;
        assert!(outbound.posted().is_empty());
        let day = NaiveDate::from_ymd_opt(2024, 6, 6).unwrap();
        assert_eq!(ledger.sum_given_on_date("G", day).unwrap(), 1);

        gate.add_permits(1);
        wait_until(|| outbound.posted().len() == 1).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }

    #[test]
    fn stale_probe_result_is_dropped_after_reconnect() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handle = SupervisorHandle::new(metrics.clone());
        assert_eq!(handle.connected_generation(), None);

        handle.mark_connected();
        let first = handle.connected_generation().unwrap();
        handle.set_state(ConnectionState::Disconnected);
        assert!(!handle.set_degraded_for(first, true));

        handle.mark_connected();
        assert!(!handle.set_degraded_for(first, true));
        assert!(!handle.health().degraded);
        assert!(!metrics.snapshot().degraded);

        let second = handle.connected_generation().unwrap();
        assert_ne!(first, second);
        assert!(handle.set_degraded_for(second, true));
        assert_eq!(handle.health().health(), Health::Degraded);
    }

    #[test]
    fn zero_interval_disables_monitor_setting() {
        let mut config = AppConfig::default();
        config.supervisor.liveness_interval_secs = 0;
        assert!(SupervisorSettings::from_config(&config).liveness_interval.is_none());
    }
}
