use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use beerbot_core::UserProfile;
use beerbot_ledger::RankedUser;

use crate::{ClientCommand, DaemonStatus, ServerEvent};

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub async fn given_in_range(&self, user: &str, start: NaiveDate, end: NaiveDate) -> Result<u64> {
        self.total(ClientCommand::GivenInRange {
            user: user.to_string(),
            start,
            end,
        })
        .await
    }

    pub async fn received_in_range(&self, user: &str, start: NaiveDate, end: NaiveDate) -> Result<u64> {
        self.total(ClientCommand::ReceivedInRange {
            user: user.to_string(),
            start,
            end,
        })
        .await
    }

    pub async fn list_givers(&self) -> Result<Vec<String>> {
        self.users(ClientCommand::ListGivers).await
    }

    pub async fn list_recipients(&self) -> Result<Vec<String>> {
        self.users(ClientCommand::ListRecipients).await
    }

    pub async fn top_givers(&self, start: NaiveDate, end: NaiveDate, limit: usize) -> Result<Vec<RankedUser>> {
        self.ranking(ClientCommand::TopGivers { start, end, limit })
            .await
    }

    pub async fn top_receivers(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RankedUser>> {
        self.ranking(ClientCommand::TopReceivers { start, end, limit })
            .await
    }

    pub async fn user_info(&self, user: &str) -> Result<UserProfile> {
        let command = ClientCommand::UserInfo {
            user: user.to_string(),
        };
        match self.request(command).await? {
            ServerEvent::User(profile) => Ok(profile),
            other => unexpected("user profile", other),
        }
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        match self.request(ClientCommand::GetStatus).await? {
            ServerEvent::Status(status) => Ok(status),
            other => unexpected("status", other),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(ClientCommand::Ping).await? {
            ServerEvent::Ack(_) => Ok(()),
            other => unexpected("ping", other),
        }
    }

    pub async fn graceful_shutdown(&self) -> Result<()> {
        match self.request(ClientCommand::Shutdown).await? {
            ServerEvent::Ack(_) => Ok(()),
            other => unexpected("shutdown", other),
        }
    }

    async fn total(&self, command: ClientCommand) -> Result<u64> {
        match self.request(command).await? {
            ServerEvent::Total(total) => Ok(total),
            other => unexpected("total", other),
        }
    }

    async fn users(&self, command: ClientCommand) -> Result<Vec<String>> {
        match self.request(command).await? {
            ServerEvent::Users(users) => Ok(users),
            other => unexpected("user list", other),
        }
    }

    async fn ranking(&self, command: ClientCommand) -> Result<Vec<RankedUser>> {
        match self.request(command).await? {
            ServerEvent::Ranking(ranking) => Ok(ranking),
            other => unexpected("ranking", other),
        }
    }

    /// Send one command and read its single reply line.
    async fn request(&self, command: ClientCommand) -> Result<ServerEvent> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&command)?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                bail!("daemon closed the connection without replying; check daemon logs");
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}

fn unexpected<T>(expected: &str, event: ServerEvent) -> Result<T> {
    match event {
        ServerEvent::Error(message) => bail!("daemon error: {message}"),
        other => bail!("daemon {expected} response missing (got {other:?})"),
    }
}
