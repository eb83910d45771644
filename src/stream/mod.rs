//! Streaming control core.
//!
//! # Architecture
//!
//! ```text
//!  link tasks ─┐   acquisition / encoder tasks ─┐   VadMonitor ─┐   hotkeys, Ctrl-C ─┐
//!              ▼                                ▼               ▼                    ▼
//!            ═══════════════════ Event queue (tokio mpsc, unbounded) ═══════════════════
//!                                              │
//!                                              ▼
//!                                  Coordinator::run()   (one event at a time)
//!                                   │            │
//!                     start/stop/release      send(chunk)
//!                                   ▼            ▼
//!                          CaptureSession   ConnectionManager ──▶ WebSocket
//!
//! Status (mpsc) + SharedState (Arc<Mutex<StreamSnapshot>>) ──▶ presentation layers
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_stream::audio::CpalSource;
//! use voice_stream::config::AppConfig;
//! use voice_stream::stream::{event_channel, new_shared_state, Coordinator};
//! use voice_stream::transport::WsConnector;
//!
//! # async fn example() {
//! let config = AppConfig::default();
//! let (events, rx) = event_channel();
//! let mut coordinator = Coordinator::new(
//!     &config,
//!     Arc::new(WsConnector::new()),
//!     Arc::new(CpalSource::new()),
//!     events.clone(),
//!     new_shared_state(),
//! );
//! coordinator.connect();
//! let stats = coordinator.run(rx).await;
//! println!("{} chunks sent", stats.chunks_sent);
//! # }
//! ```

pub mod coordinator;
pub mod event;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use crate::audio::CaptureState;
pub use crate::transport::ConnectionState;
pub use coordinator::Coordinator;
pub use event::{event_channel, Event, EventReceiver, EventSender};
pub use state::{
    derive_status, new_shared_state, resolve_intent, ErrorKind, SharedState, Status,
    StreamIntent, StreamSnapshot,
};
