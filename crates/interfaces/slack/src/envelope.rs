//! Socket Mode frames.

use serde::Deserialize;
use serde_json::Value;

use beerbot_core::{Delivery, InboundEvent, InboundMessage, SlashCommand, TransportError};

/// One text frame received over the Socket Mode websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello,
    /// Slack asks the client to reconnect (e.g. `refresh_requested`).
    Disconnect(String),
    Delivery(Delivery),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsApiPayload {
    event: RawEvent,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSlashCommand {
    command: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    user_id: String,
}

pub fn parse_frame(text: &str) -> Result<Frame, TransportError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|err| TransportError::Protocol(err.to_string()))?;

    let event = match raw.kind.as_str() {
        "hello" => return Ok(Frame::Hello),
        "disconnect" => {
            return Ok(Frame::Disconnect(
                raw.reason.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        "events_api" => events_api_event(raw.payload)?,
        "slash_commands" => {
            let cmd: RawSlashCommand = serde_json::from_value(raw.payload)
                .map_err(|err| TransportError::Protocol(format!("slash command: {err}")))?;
            InboundEvent::SlashCommand(SlashCommand {
                command: cmd.command,
                text: cmd.text,
                channel: cmd.channel_id,
                user: cmd.user_id,
            })
        }
        other => InboundEvent::Other(other.to_string()),
    };

    Ok(Frame::Delivery(Delivery {
        envelope_id: raw.envelope_id.filter(|id| !id.is_empty()),
        event,
    }))
}

fn events_api_event(payload: Value) -> Result<InboundEvent, TransportError> {
    let payload: EventsApiPayload = serde_json::from_value(payload)
        .map_err(|err| TransportError::Protocol(format!("events_api payload: {err}")))?;
    let event = payload.event;
    if event.kind != "message" {
        return Ok(InboundEvent::Other(event.kind));
    }
    Ok(InboundEvent::Message(InboundMessage {
        channel: event.channel,
        sender: event.user,
        text: event.text,
        ts: event.ts,
        subtype: event.subtype,
        thread_ts: event.thread_ts,
        bot_id: event.bot_id,
    }))
}
