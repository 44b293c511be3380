use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use beerbot_core::{Delivery, TransportError, TransportSession};

use crate::envelope::{Frame, parse_frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live Socket Mode websocket.
pub struct SlackSession {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
    trace_events: bool,
}

impl SlackSession {
    pub(crate) fn new(stream: WsStream, trace_events: bool) -> Self {
        let (writer, reader) = stream.split();
        Self {
            writer,
            reader,
            trace_events,
        }
    }
}

#[async_trait]
impl TransportSession for SlackSession {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        while let Some(frame) = self.reader.next().await {
            let message = frame.map_err(|err| TransportError::Closed(err.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    self.writer
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|err| TransportError::Closed(err.to_string()))?;
                    continue;
                }
                Message::Close(reason) => {
                    info!(?reason, "socket mode connection closed by remote");
                    return Ok(None);
                }
                Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
            };

            if self.trace_events {
                debug!(raw = %text, "socket mode frame");
            }

            match parse_frame(&text) {
                Ok(Frame::Hello) => debug!("socket mode hello"),
                Ok(Frame::Disconnect(reason)) => {
                    info!(%reason, "socket mode disconnect requested");
                    return Ok(None);
                }
                Ok(Frame::Delivery(delivery)) => return Ok(Some(delivery)),
                Err(err) => warn!(error = %err, "dropping unreadable socket mode frame"),
            }
        }
        Ok(None)
    }

    async fn acknowledge(&mut self, envelope_id: &str) -> Result<(), TransportError> {
        let ack = serde_json::json!({ "envelope_id": envelope_id }).to_string();
        self.writer
            .send(Message::Text(ack))
            .await
            .map_err(|err| TransportError::Closed(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer
            .send(Message::Close(None))
            .await
            .map_err(|err| TransportError::Closed(err.to_string()))
    }
}
