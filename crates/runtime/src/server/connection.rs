//! Unix domain socket connection handling and command dispatch.

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use beerbot_core::UserDirectory;
use beerbot_ledger::{LedgerError, LedgerStore};

use crate::{ClientCommand, ServerEvent};

use super::DaemonState;

pub(super) async fn handle_connection(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ClientCommand = match serde_json::from_str(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            warn!(?err, "unreadable control command");
            let event = ServerEvent::Error(format!("unreadable command: {err}"));
            return send_event(&mut write_half, event).await;
        }
    };
    debug!(?command, "control command");

    let event = match command {
        ClientCommand::Shutdown => {
            let _ = shutdown_tx.send(true);
            ServerEvent::Ack("shutdown requested".to_string())
        }
        ClientCommand::Ping => ServerEvent::Ack("pong".to_string()),
        ClientCommand::GetStatus => ServerEvent::Status(state.status()),
        ClientCommand::UserInfo { user } => look_up_user(state.directory.as_ref(), &user).await,
        query => answer_query(&state.ledger, query).await,
    };
    send_event(&mut write_half, event).await
}

async fn look_up_user(directory: &dyn UserDirectory, user: &str) -> ServerEvent {
    match directory.user_info(user).await {
        Ok(profile) => ServerEvent::User(profile),
        Err(err) => {
            warn!(error = %err, %user, "user lookup failed");
            ServerEvent::Error(format!("user lookup failed: {err}"))
        }
    }
}

async fn answer_query(ledger: &LedgerStore, command: ClientCommand) -> ServerEvent {
    let ledger = ledger.clone();
    match tokio::task::spawn_blocking(move || run_query(&ledger, command)).await {
        Ok(Ok(event)) => event,
        Ok(Err(err)) => {
            warn!(error = %err, "ledger query failed");
            ServerEvent::Error(err.to_string())
        }
        Err(err) => ServerEvent::Error(format!("query task failed: {err}")),
    }
}

fn run_query(ledger: &LedgerStore, command: ClientCommand) -> Result<ServerEvent, LedgerError> {
    let event = match command {
        ClientCommand::GivenInRange { user, start, end } => match range_error(start, end) {
            Some(event) => event,
            None => ServerEvent::Total(ledger.sum_given_in_range(&user, start, end)?),
        },
        ClientCommand::ReceivedInRange { user, start, end } => match range_error(start, end) {
            Some(event) => event,
            None => ServerEvent::Total(ledger.sum_received_in_range(&user, start, end)?),
        },
        ClientCommand::ListGivers => ServerEvent::Users(ledger.list_distinct_givers()?),
        ClientCommand::ListRecipients => ServerEvent::Users(ledger.list_distinct_recipients()?),
        ClientCommand::TopGivers { start, end, limit } => match range_error(start, end) {
            Some(event) => event,
            None => ServerEvent::Ranking(ledger.top_givers(start, end, limit)?),
        },
        ClientCommand::TopReceivers { start, end, limit } => match range_error(start, end) {
            Some(event) => event,
            None => ServerEvent::Ranking(ledger.top_receivers(start, end, limit)?),
        },
        ClientCommand::UserInfo { .. }
        | ClientCommand::GetStatus
        | ClientCommand::Ping
        | ClientCommand::Shutdown => ServerEvent::Error("not a ledger query".to_string()),
    };
    Ok(event)
}

fn range_error(start: NaiveDate, end: NaiveDate) -> Option<ServerEvent> {
    (start > end).then(|| ServerEvent::Error(format!("start date {start} is after end date {end}")))
}

async fn send_event(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    event: ServerEvent,
) -> Result<()> {
    let encoded = serde_json::to_string(&event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
