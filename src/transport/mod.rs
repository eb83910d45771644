//! Duplex link to the streaming endpoint.
//!
//! ```text
//! ConnectionManager ──connect()──▶ link task ──Connector::connect──▶ (FrameSink, FrameSource)
//!        ▲                             │
//!        │   Event::Connection(Opened | Failed | Closed | Message)
//!        └─────────────────────────────┘          (via the coordinator queue)
//!
//! send(chunk) ──Connected + room?──▶ bounded outbound mpsc ──▶ link task ──▶ FrameSink::send
//!              └─otherwise──────────▶ dropped + counted
//! ```
//!
//! [`Connector`] is the seam between the lifecycle logic and the wire:
//! [`WsConnector`] speaks WebSocket via `tokio-tungstenite`, tests use
//! [`MockConnector`].

pub mod connection;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, LinkStats, ReconnectPolicy,
    LINK_QUEUE_CAPACITY, WRITE_TIMEOUT,
};
pub use ws::WsConnector;

// ---------------------------------------------------------------------------
// ConnectionError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("link lost: {0}")]
    Lost(String),
}

// ---------------------------------------------------------------------------
// Link traits
// ---------------------------------------------------------------------------

/// Frames the endpoint sends back.  Binary and control frames are handled
/// inside the implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Close frame, with `"<code> <reason>"` when the peer supplied one.
    Close(Option<String>),
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError>;
}

/// Write half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one opaque binary frame.
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError>;

    /// Close the link gracefully.  Errors are ignored.
    async fn close(&mut self);
}

/// Read half of an open link.  Must be cancel-safe: the link task polls it
/// inside `tokio::select!`.
#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>>;
}

// ---------------------------------------------------------------------------
// MockConnector  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::MockConnector;

#[cfg(test)]
mod mock {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ConnectionError, Connector, FrameSink, FrameSource, Inbound};

    /// In-memory endpoint.  Clones share state: the manager owns one, the
    /// test keeps another to play the server.
    #[derive(Debug, Clone, Default)]
    pub struct MockConnector {
        state: Arc<Mutex<MockState>>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        failing: bool,
        hanging: bool,
        stalled_writes: bool,
        attempts: usize,
        closes: usize,
        sent: Vec<Vec<u8>>,
        server: Option<mpsc::UnboundedSender<Inbound>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse every connection until cleared.
        pub fn set_failing(&self, failing: bool) {
            self.state.lock().unwrap().failing = failing;
        }

        /// Never complete connection attempts (a stuck handshake).
        pub fn set_hanging(&self, hanging: bool) {
            self.state.lock().unwrap().hanging = hanging;
        }

        /// Make every frame write hang (a peer that stopped reading).
        pub fn set_stalled_writes(&self, stalled: bool) {
            self.state.lock().unwrap().stalled_writes = stalled;
        }

        pub fn attempts(&self) -> usize {
            self.state.lock().unwrap().attempts
        }

        /// Graceful closes initiated by the client.
        pub fn closes(&self) -> usize {
            self.state.lock().unwrap().closes
        }

        /// Every binary payload written so far, in write order.
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().sent.clone()
        }

        /// Push a text frame to the most recent link.
        pub fn server_text(&self, text: &str) {
            if let Some(tx) = self.state.lock().unwrap().server.as_ref() {
                let _ = tx.send(Inbound::Text(text.into()));
            }
        }

        /// Close the most recent link from the server side.
        pub fn server_close(&self) {
            if let Some(tx) = self.state.lock().unwrap().server.take() {
                let _ = tx.send(Inbound::Close(Some("1001 going away".into())));
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError> {
            let hanging = {
                let mut state = self.state.lock().unwrap();
                state.attempts += 1;
                if state.failing {
                    return Err(ConnectionError::Connect("connection refused".into()));
                }
                state.hanging
            };
            if hanging {
                std::future::pending::<()>().await;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.state.lock().unwrap().server = Some(tx);
            Ok((
                Box::new(MockSink {
                    state: Arc::clone(&self.state),
                }),
                Box::new(MockSource { rx }),
            ))
        }
    }

    struct MockSink {
        state: Arc<Mutex<MockState>>,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
            let stalled = self.state.lock().unwrap().stalled_writes;
            if stalled {
                std::future::pending::<()>().await;
            }
            self.state.lock().unwrap().sent.push(payload);
            Ok(())
        }

        async fn close(&mut self) {
            self.state.lock().unwrap().closes += 1;
        }
    }

    struct MockSource {
        rx: mpsc::UnboundedReceiver<Inbound>,
    }

    #[async_trait]
    impl FrameSource for MockSource {
        async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>> {
            self.rx.recv().await.map(Ok)
        }
    }
}
