//! # Telemetry WSS Transport
//!
//! Thin adapter from a `tokio-tungstenite` stream to the session's `Transport`.
//! Binary messages become `Frame::Binary`, text messages `Frame::Text`;
//! control frames are skipped and a close frame ends the stream.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use crate::core::session::{Transport, TransportError};
use crate::telemetry::decoder::Frame;

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        log::info!("Connecting to telemetry socket: {}", url);
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("Connected to telemetry socket.");
        Ok(Self { stream, closed: false })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Frame(Frame),
    Skip,
    Closed,
}

fn classify_message(message: Message) -> Inbound {
    match message {
        Message::Binary(data) => Inbound::Frame(Frame::Binary(data.to_vec())),
        Message::Text(text) => Inbound::Frame(Frame::Text(text.as_str().to_string())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Closed,
    }
}

impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        log::debug!("Sending upstream: {}", text);
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => match classify_message(message) {
                    Inbound::Frame(frame) => return Some(Ok(frame)),
                    Inbound::Skip => continue,
                    Inbound::Closed => {
                        log::info!("Telemetry socket closed by remote host.");
                        self.closed = true;
                        return None;
                    }
                },
                Some(Err(e)) => return Some(Err(TransportError::Receive(e.to_string()))),
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
