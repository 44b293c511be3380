//! Bot daemon: wires the ledger, processor and supervisor together and serves
//! read-side queries over a Unix socket.

mod connection;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use beerbot_config::AppConfig;
use beerbot_core::{InMemoryMetrics, Outbound, Transport, UserDirectory};
use beerbot_ledger::LedgerStore;

use crate::maintenance::spawn_dedup_pruner;
use crate::processor::{EventProcessor, ProcessorSettings};
use crate::supervisor::{Supervisor, SupervisorHandle, SupervisorSettings};
use crate::DaemonStatus;

pub(crate) struct DaemonState {
    ledger: LedgerStore,
    directory: Arc<dyn UserDirectory>,
    supervisor: SupervisorHandle,
    metrics: Arc<InMemoryMetrics>,
    channel: String,
    started_at: Instant,
}

impl DaemonState {
    fn status(&self) -> DaemonStatus {
        let snapshot = self.supervisor.health();
        DaemonStatus {
            health: snapshot.health(),
            connection: snapshot.state,
            degraded: snapshot.degraded,
            attempt: snapshot.attempt,
            last_activity: snapshot.last_activity,
            channel: self.channel.clone(),
            ledger_path: self.ledger.path().display().to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Open the ledger store described by `config`.
pub fn open_ledger(config: &AppConfig) -> LedgerStore {
    LedgerStore::new(&config.ledger.path)
        .with_busy_timeout(Duration::from_millis(config.ledger.busy_timeout_ms))
}

/// Run the bot until interrupted or asked to shut down over the socket.
///
/// `platform` carries the event connection, outbound replies and the user
/// directory.
pub async fn run_daemon<P>(config: AppConfig, platform: Arc<P>) -> Result<()>
where
    P: Transport + UserDirectory,
{
    let transport: Arc<dyn Transport> = platform.clone();
    let outbound: Arc<dyn Outbound> = platform.clone();
    let directory: Arc<dyn UserDirectory> = platform;

    let ledger = open_ledger(&config);
    let migrator = ledger.clone();
    let report = tokio::task::spawn_blocking(move || migrator.migrate())
        .await?
        .with_context(|| format!("migrating ledger at {}", ledger.path().display()))?;
    if report.is_noop() {
        info!(path = %ledger.path().display(), "ledger schema up to date");
    } else {
        info!(path = %ledger.path().display(), ?report, "ledger schema migrated");
    }

    let metrics = Arc::new(InMemoryMetrics::new());
    let processor = Arc::new(EventProcessor::new(
        ledger.clone(),
        config.associator()?,
        outbound,
        metrics.clone(),
        ProcessorSettings::from_config(&config),
    ));
    let supervisor = Supervisor::new(
        transport,
        processor,
        metrics.clone(),
        SupervisorSettings::from_config(&config),
    );

    let state = Arc::new(DaemonState {
        ledger: ledger.clone(),
        directory,
        supervisor: supervisor.handle(),
        metrics,
        channel: config.slack.channel.clone(),
        started_at: Instant::now(),
    });

    let socket_path = Path::new(&config.daemon.socket_path).to_path_buf();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    info!(
        path = %socket_path.display(),
        channel = %config.slack.channel,
        "beerbot daemon listening"
    );

    let monitor = supervisor.spawn_liveness_monitor(shutdown_rx.clone());
    let pruner = spawn_dedup_pruner(
        ledger,
        config.ledger.dedup_retention_days,
        shutdown_rx.clone(),
    );
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    {
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            termination_signal().await;
            info!("termination signal received");
            let _ = signal_tx.send(true);
        });
    }

    let mut connections = serve(listener, state, shutdown_tx.clone()).await;

    info!("daemon shutting down gracefully");
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.daemon.shutdown_grace_secs);

    if tokio::time::timeout(grace, &mut supervisor_task).await.is_err() {
        warn!(?grace, "in-flight events did not settle in time; aborting");
        supervisor_task.abort();
    }
    if tokio::time::timeout(grace, drain(&mut connections)).await.is_err() {
        warn!(?grace, "query connections still open; aborting");
        connections.abort_all();
    }
    for task in [monitor, pruner].into_iter().flatten() {
        stop_task(task, grace).await;
    }

    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped");
    Ok(())
}

/// Accept control connections until shutdown is requested. Returns the
/// connections still being served.
async fn serve(
    listener: UnixListener,
    state: Arc<DaemonState>,
    shutdown_tx: watch::Sender<bool>,
) -> JoinSet<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut connections = JoinSet::new();

    loop {
        while let Some(joined) = connections.try_join_next() {
            if let Err(err) = joined {
                error!(?err, "connection task failed");
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let stream = match accept {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(?err, "control socket accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                connections.spawn(async move {
                    if let Err(err) = connection::handle_connection(stream, state, shutdown_tx).await {
                        error!(?err, "daemon connection handler failed");
                    }
                });
            }
        }
    }

    connections
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

async fn stop_task(mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        task.abort();
    }
}

async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(?err, "SIGTERM handler unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use beerbot_core::{TransportError, UserProfile, parse_token};

    use crate::{DaemonClient, Health};
    use crate::supervisor::ConnectionState;

    struct FixedDirectory;

    #[async_trait]
    impl UserDirectory for FixedDirectory {
        async fn user_info(&self, user: &str) -> Result<UserProfile, TransportError> {
            match user {
                "B" => Ok(UserProfile {
                    id: "B".to_string(),
                    real_name: "Bea".to_string(),
                    profile_image: "https://img/b.png".to_string(),
                }),
                _ => Err(TransportError::Api("users.info: user_not_found".to_string())),
            }
        }
    }

    fn seeded_state(dir: &TempDir) -> Arc<DaemonState> {
        let ledger = LedgerStore::new(dir.path().join("beers.db"));
        ledger.migrate().unwrap();
        let at = parse_token("1717691574.000100").unwrap();
        ledger.record_gift("A", "B", "1717691574.000100", at, 2).unwrap();
        ledger.record_gift("A", "C", "1717691574.000100", at, 1).unwrap();
        ledger.record_gift("C", "B", "1717691575.000100", at, 4).unwrap();

        let metrics = Arc::new(InMemoryMetrics::new());
        Arc::new(DaemonState {
            ledger,
            directory: Arc::new(FixedDirectory),
            supervisor: SupervisorHandle::new(metrics.clone()),
            metrics,
            channel: "C1".to_string(),
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn client_queries_round_trip_over_socket() {
        let dir = TempDir::new().unwrap();
        let state = seeded_state(&dir);
        let socket = dir.path().join("beerbot.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (shutdown_tx, _rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, state, shutdown_tx));

        let client = DaemonClient::new(&socket);
        let day = NaiveDate::from_ymd_opt(2024, 6, 6).unwrap();

        assert_eq!(client.given_in_range("A", day, day).await.unwrap(), 3);
        assert_eq!(client.received_in_range("B", day, day).await.unwrap(), 6);
        assert_eq!(client.list_givers().await.unwrap(), vec!["A", "C"]);
        assert_eq!(client.list_recipients().await.unwrap(), vec!["B", "C"]);

        let top = client.top_receivers(day, day, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].user, "B");
        assert_eq!(top[0].total, 6);

        let status = client.get_status().await.unwrap();
        assert_eq!(status.health, Health::Disconnected);
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert_eq!(status.channel, "C1");

        let profile = client.user_info("B").await.unwrap();
        assert_eq!(profile.real_name, "Bea");
        assert_eq!(profile.profile_image, "https://img/b.png");
        let err = client.user_info("nobody").await.unwrap_err();
        assert!(err.to_string().contains("user_not_found"));

        client.ping().await.unwrap();
        client.graceful_shutdown().await.unwrap();
        let mut leftover = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        drain(&mut leftover).await;
    }

    #[tokio::test]
    async fn inverted_range_is_reported_as_error() {
        let dir = TempDir::new().unwrap();
        let state = seeded_state(&dir);
        let socket = dir.path().join("beerbot.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (shutdown_tx, _rx) = watch::channel(false);
        let _server = tokio::spawn(serve(listener, state, shutdown_tx));

        let client = DaemonClient::new(&socket);
        let start = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let err = client.given_in_range("A", start, end).await.unwrap_err();
        assert!(err.to_string().contains("after"));
    }
}
