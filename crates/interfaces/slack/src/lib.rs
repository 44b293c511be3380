//! Slack Socket Mode transport.
//!
//! Web API calls (`apps.connections.open`, `chat.postMessage`,
//! `chat.postEphemeral`, `auth.test`, `users.info`) go through reqwest; events
//! arrive over the websocket returned by `apps.connections.open`.

mod envelope;
mod session;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

use beerbot_config::AppConfig;
use beerbot_core::{
    Outbound, Transport, TransportError, TransportSession, UserDirectory, UserProfile,
};

pub use envelope::{Frame, parse_frame};
pub use session::SlackSession;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SlackTransport {
    http: Client,
    api_base: String,
    bot_token: String,
    app_token: String,
    connect_timeout: Duration,
    trace_events: bool,
}

impl SlackTransport {
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self {
            http,
            api_base: config.slack.api_base_url.trim_end_matches('/').to_string(),
            bot_token: config.slack.bot_token.clone(),
            app_token: config.slack.app_token.clone(),
            connect_timeout: config.supervisor.connect_timeout(),
            trace_events: config.telemetry.trace_events,
        })
    }

    async fn call<B, T>(&self, method: &str, token: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let request = self.http.post(self.method_url(method)).json(body);
        self.send(method, token, request).await
    }

    /// Read methods such as `users.info` take form arguments, not JSON.
    async fn call_get<T>(&self, method: &str, token: &str, args: &[(&str, &str)]) -> Result<T, TransportError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = self.http.get(self.method_url(method)).query(args);
        self.send(method, token, request).await
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    async fn send<T>(&self, method: &str, token: &str, request: RequestBuilder) -> Result<T, TransportError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| TransportError::Http(format!("{method}: {err}")))?
            .error_for_status()
            .map_err(|err| TransportError::Http(format!("{method}: {err}")))?;

        let payload: SlackResponse<T> = response
            .json()
            .await
            .map_err(|err| TransportError::Protocol(format!("{method}: {err}")))?;
        if !payload.ok {
            let error = payload
                .error
                .unwrap_or_else(|| format!("{method} failed"));
            return Err(TransportError::Api(format!("{method}: {error}")));
        }
        payload
            .body
            .ok_or_else(|| TransportError::Protocol(format!("{method}: empty response")))
    }

    async fn open_socket_url(&self) -> Result<Url, TransportError> {
        let opened: ConnectionsOpen = self
            .call("apps.connections.open", &self.app_token, &serde_json::json!({}))
            .await?;
        let url = Url::parse(&opened.url).map_err(|err| TransportError::Protocol(err.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(TransportError::Protocol(format!(
                "socket url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        Ok(url)
    }
}

#[async_trait]
impl Outbound for SlackTransport {
    async fn post_message(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let body = PostMessage {
            channel,
            text,
            user: None,
        };
        let _: serde_json::Value = self.call("chat.postMessage", &self.bot_token, &body).await?;
        Ok(())
    }

    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) -> Result<(), TransportError> {
        let body = PostMessage {
            channel,
            text,
            user: Some(user),
        };
        let _: serde_json::Value = self
            .call("chat.postEphemeral", &self.bot_token, &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SlackTransport {
    async fn connect(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        let url = self.open_socket_url().await?;
        debug!(host = ?url.host_str(), "opening socket mode connection");

        let (stream, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "websocket connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        info!("socket mode connection established");
        Ok(Box::new(SlackSession::new(stream, self.trace_events)))
    }

    async fn probe_identity(&self) -> Result<String, TransportError> {
        let auth: AuthTest = self
            .call("auth.test", &self.bot_token, &serde_json::json!({}))
            .await?;
        Ok(auth.user_id)
    }
}

#[async_trait]
impl UserDirectory for SlackTransport {
    async fn user_info(&self, user: &str) -> Result<UserProfile, TransportError> {
        let info: UsersInfo = self
            .call_get("users.info", &self.bot_token, &[("user", user)])
            .await?;
        Ok(info.user.into())
    }
}

#[derive(Debug, Deserialize)]
struct SlackResponse<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpen {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct UsersInfo {
    user: SlackUser,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: SlackUserProfile,
}

#[derive(Debug, Default, Deserialize)]
struct SlackUserProfile {
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    image_192: Option<String>,
}

impl From<SlackUser> for UserProfile {
    fn from(user: SlackUser) -> Self {
        Self {
            real_name: user
                .real_name
                .or(user.profile.real_name)
                .unwrap_or_default(),
            profile_image: user.profile.image_192.unwrap_or_default(),
            id: user.id,
        }
    }
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}
