//! Streaming intent, status surface and the shared snapshot.
//!
//! [`resolve_intent`] decides *whether* audio should flow; [`derive_status`]
//! summarises the three owned states into the single [`Status`] presentation
//! layers display.  [`SharedState`] is the snapshot they can poll instead of
//! subscribing to the status channel.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::audio::CaptureState;
use crate::transport::{ConnectionState, LinkStats};

// ---------------------------------------------------------------------------
// StreamIntent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamIntent {
    #[default]
    Off,
    On,
}

impl StreamIntent {
    pub fn is_on(self) -> bool {
        self == StreamIntent::On
    }
}

/// Combine the two intent sources.
///
/// | `vad_active` | `manual_on` | intent |
/// |--------------|-------------|--------|
/// | false        | false       | Off    |
/// | true         | false       | On     |
/// | false        | true        | On     |
/// | true         | true        | On     |
///
/// ```
/// use voice_stream::stream::{resolve_intent, StreamIntent};
///
/// assert_eq!(resolve_intent(false, false), StreamIntent::Off);
/// assert_eq!(resolve_intent(true, false), StreamIntent::On);
/// ```
pub fn resolve_intent(vad_active: bool, manual_on: bool) -> StreamIntent {
    if vad_active || manual_on {
        StreamIntent::On
    } else {
        StreamIntent::Off
    }
}

// ---------------------------------------------------------------------------
// ErrorKind / Status
// ---------------------------------------------------------------------------

/// Failure classes visible on the status surface.  None of them is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Link failed or was lost; a reconnect is scheduled.
    Connection,
    /// Microphone could not be acquired.  The intent stays recorded.
    DeviceUnavailable,
    /// Speech detection is gone; manual toggling still works.
    VadUnavailable,
    /// Capture failed mid-interval; the session was torn down.
    Encoder,
}

/// What the controller is doing, as one value.
///
/// Serialises as `{"status":"listening"}` or
/// `{"status":"error","kind":"device_unavailable"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum Status {
    Disconnected,
    Connected,
    /// Connected, idle, VAD armed and waiting for speech.
    Listening,
    /// Connected and transmitting chunks.
    Streaming,
    Error(ErrorKind),
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Disconnected => "Disconnected",
            Status::Connected => "Connected",
            Status::Listening => "Listening",
            Status::Streaming => "Streaming",
            Status::Error(_) => "Error",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Disconnected
    }
}

/// Steady-state status.  The link dominates: capture without a link drops
/// every chunk, so it is reported as `Disconnected`.
pub fn derive_status(connected: bool, capturing: bool, vad_listening: bool) -> Status {
    match (connected, capturing, vad_listening) {
        (false, _, _) => Status::Disconnected,
        (true, true, _) => Status::Streaming,
        (true, false, true) => Status::Listening,
        (true, false, false) => Status::Connected,
    }
}

// ---------------------------------------------------------------------------
// StreamSnapshot / SharedState
// ---------------------------------------------------------------------------

/// Everything a presentation layer needs, refreshed after every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSnapshot {
    pub status: Status,
    pub connection: ConnectionState,
    pub capture: CaptureState,
    pub intent: StreamIntent,
    pub vad_armed: bool,
    pub vad_available: bool,
    /// Message of the most recent error, cleared on the next success.
    pub last_error: Option<String>,
    pub link: LinkStats,
}

/// Thread-safe handle to [`StreamSnapshot`].  Do not hold the lock across
/// `.await` points.
pub type SharedState = Arc<Mutex<StreamSnapshot>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(StreamSnapshot::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
