use serde::{Deserialize, Serialize};

/// A channel message as delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender: String,
    pub text: String,
    /// Platform-native timestamp token, e.g. `"1717691574.123456"`.
    pub ts: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

impl InboundMessage {
    /// Thread replies carry a thread root that differs from their own ts.
    pub fn is_thread_reply(&self) -> bool {
        self.thread_ts
            .as_deref()
            .is_some_and(|root| !root.is_empty() && root != self.ts)
    }

    /// Identity used when the transport provides no delivery id. Stable
    /// across redeliveries of the same message.
    pub fn synthetic_key(&self) -> String {
        format!("msg|{}|{}|{}", self.channel, self.sender, self.ts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub channel: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundEvent {
    Message(InboundMessage),
    SlashCommand(SlashCommand),
    /// Anything else the transport forwards; ignored by the processor.
    Other(String),
}

/// One delivery attempt of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub envelope_id: Option<String>,
    pub event: InboundEvent,
}
