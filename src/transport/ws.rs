//! WebSocket link via `tokio-tungstenite`.
//!
//! Chunks are written as binary messages.  Text messages from the endpoint
//! (acknowledgements like `Processed 8820 bytes`) are surfaced as
//! [`Inbound::Text`]; binary messages from the endpoint are not part of the
//! protocol and are skipped.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{ConnectionError, Connector, FrameSink, FrameSource, Inbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] for `ws://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError> {
        let (stream, response) = connect_async(url).await?;
        log::debug!("connection: handshake with {url} -> {}", response.status());

        let (tx, rx) = stream.split();
        Ok((Box::new(WsSink { tx }), Box::new(WsSource { rx })))
    }
}

struct WsSink {
    tx: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.tx.send(Message::Binary(payload.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.tx.close().await {
            log::debug!("connection: close handshake failed: {e}");
        }
    }
}

struct WsSource {
    rx: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>> {
        loop {
            let message = match self.rx.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(Inbound::Text(text.to_string()))),
                Message::Close(frame) => {
                    let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                    return Some(Ok(Inbound::Close(reason)));
                }
                Message::Binary(data) => {
                    log::debug!("connection: ignoring {} byte binary frame", data.len());
                }
                // Ping/Pong are answered by tungstenite.
                _ => {}
            }
        }
    }
}
