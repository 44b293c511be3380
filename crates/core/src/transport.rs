//! Messaging transport capabilities consumed by the runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Delivery;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("platform api error: {0}")]
    Api(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

/// Outbound notifications posted on behalf of the bot.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Plain reply visible to the whole channel.
    async fn post_message(&self, channel: &str, text: &str) -> Result<(), TransportError>;

    /// Notice visible only to `user`.
    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) -> Result<(), TransportError>;
}

/// Public profile of a workspace member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub real_name: String,
    /// URL of the profile picture, empty when the user has none.
    pub profile_image: String,
}

/// Lookup of workspace members by id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_info(&self, user: &str) -> Result<UserProfile, TransportError>;
}

/// A connectable transport.
#[async_trait]
pub trait Transport: Outbound + 'static {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Lightweight identity check used by the liveness monitor. Returns the
    /// bot's own user id.
    async fn probe_identity(&self) -> Result<String, TransportError>;
}

/// One live connection.
#[async_trait]
pub trait TransportSession: Send {
    /// Next delivery, `Ok(None)` when the remote side closed the session.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError>;

    async fn acknowledge(&mut self, envelope_id: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
