//! Streaming Coordinator: reconciles VAD, manual intent, the capture
//! device and the link into one "is audio being transmitted" state.
//!
//! # Edge logic
//!
//! ```text
//! intent = resolve_intent(vad_active, manual_on)
//!
//! Off → On   capture.start()
//! On  → Off  capture.stop(release_device = !vad_armed)
//! On  → On   no-op, except a raising signal (speech start, manual on)
//!            while the session is Idle after a device failure → retry start()
//! ```
//!
//! Every chunk goes to `ConnectionManager::send`, which drops it unless the
//! link is up.  Handlers never await; `run` is the only suspension point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::event::{Event, EventReceiver, EventSender};
use super::state::{derive_status, resolve_intent, ErrorKind, SharedState, Status, StreamIntent};
use crate::audio::{AudioSource, CaptureEvent, CaptureSession, Chunk, VadError, VadEvent, VoiceActivity};
use crate::config::AppConfig;
use crate::transport::{ConnectionManager, Connector, LinkStats};

/// How long `run` waits for the link's close handshake at shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    connection: ConnectionManager,
    capture: CaptureSession,
    vad: Option<Box<dyn VoiceActivity>>,
    /// Set once VAD initialisation or the running monitor has failed.
    vad_failed: bool,

    vad_active: bool,
    manual_on: bool,
    vad_armed: bool,

    shared: SharedState,
    status_tx: Option<mpsc::UnboundedSender<Status>>,
    last_status: Option<Status>,
    last_error: Option<String>,
}

impl Coordinator {
    /// Build the coordinator and its two components.  `events` is the
    /// sending half of the queue later passed to [`run`](Self::run).
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn AudioSource>,
        events: EventSender,
        shared: SharedState,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(connector, &config.connection, events.clone()),
            capture: CaptureSession::new(source, &config.capture, events),
            vad: None,
            vad_failed: false,
            vad_active: false,
            manual_on: false,
            vad_armed: config.vad.enabled,
            shared,
            status_tx: None,
            last_status: None,
            last_error: None,
        }
    }

    /// Emit every status transition on `tx`.
    pub fn with_status_channel(mut self, tx: mpsc::UnboundedSender<Status>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn intent(&self) -> StreamIntent {
        resolve_intent(self.vad_active, self.manual_on)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn capture(&self) -> &CaptureSession {
        &self.capture
    }

    pub fn vad_active(&self) -> bool {
        self.vad_active
    }

    pub fn manual_on(&self) -> bool {
        self.manual_on
    }

    pub fn vad_armed(&self) -> bool {
        self.vad_armed
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Handle events until [`Event::Shutdown`] (or until every sender is
    /// gone), then tear down.  Returns the final link statistics.
    pub async fn run(mut self, mut events: EventReceiver) -> LinkStats {
        self.publish();
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }

        self.teardown();
        self.connection.wait_closed(CLOSE_GRACE).await;
        self.connection.stats()
    }

    /// Dispatch one event.  Returns `false` on shutdown.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Connection(event) => {
                match self.connection.on_event(event) {
                    Ok(()) => {
                        if self.connection.is_connected() {
                            self.last_error = None;
                        }
                    }
                    Err(e) => self.report(ErrorKind::Connection, &e),
                }
                self.publish();
            }

            Event::Capture(CaptureEvent::Acquired(result)) => {
                if let Err(e) = self.capture.on_acquired(result) {
                    self.report(ErrorKind::DeviceUnavailable, &e);
                }
                self.publish();
            }
            Event::Capture(CaptureEvent::Chunk { chunk, .. }) => self.on_chunk(chunk),
            Event::Capture(CaptureEvent::Failed { interval, error }) => {
                if self.capture.on_stream_failed(interval) {
                    self.report(error.kind(), &error);
                } else {
                    log::debug!("coordinator: ignoring failure of ended interval {interval}: {error}");
                }
                self.publish();
            }

            Event::Vad(VadEvent::SpeechStart) => self.on_vad_speech_start(),
            Event::Vad(VadEvent::SpeechEnd { segment }) => self.on_vad_speech_end(segment),
            Event::Vad(VadEvent::Failed(e)) => self.on_vad_failed(e),
            Event::VadReady(result) => self.on_vad_ready(result),

            Event::ManualToggle => self.on_manual_toggle(),
            Event::ToggleVad => self.set_vad_armed(!self.vad_armed),

            Event::Shutdown => {
                log::info!("coordinator: shutdown requested");
                return false;
            }
        }
        true
    }

    /// Start the link.  Idempotent.
    pub fn connect(&mut self) {
        self.connection.connect();
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Intent handlers
    // -----------------------------------------------------------------------

    pub fn on_vad_speech_start(&mut self) {
        if !self.vad_armed {
            log::debug!("coordinator: speech start ignored, VAD disarmed");
            return;
        }
        let before = self.intent();
        self.vad_active = true;
        self.apply_intent(before, true);
    }

    /// `segment` is the finished utterance; only its length is used here.
    pub fn on_vad_speech_end(&mut self, segment: Vec<f32>) {
        if !self.vad_armed {
            log::debug!("coordinator: speech end ignored, VAD disarmed");
            return;
        }
        log::debug!("coordinator: speech segment of {} samples", segment.len());
        let before = self.intent();
        self.vad_active = false;
        self.apply_intent(before, false);
    }

    pub fn on_manual_toggle(&mut self) {
        let before = self.intent();
        self.manual_on = !self.manual_on;
        log::info!(
            "coordinator: manual streaming {}",
            if self.manual_on { "on" } else { "off" }
        );
        self.apply_intent(before, self.manual_on);
    }

    /// Forward unconditionally; the manager enforces the connection gate.
    pub fn on_chunk(&mut self, chunk: Chunk) {
        self.connection.send(chunk);
        if let Ok(mut snapshot) = self.shared.lock() {
            snapshot.link = self.connection.stats();
        }
    }

    // -----------------------------------------------------------------------
    // VAD lifecycle
    // -----------------------------------------------------------------------

    pub fn on_vad_ready(&mut self, result: Result<Box<dyn VoiceActivity>, VadError>) {
        match result {
            Ok(mut vad) => {
                if self.vad_armed {
                    if let Err(e) = vad.start() {
                        self.on_vad_failed(e);
                        return;
                    }
                }
                log::info!("coordinator: VAD ready ({})", if self.vad_armed { "armed" } else { "disarmed" });
                self.vad = Some(vad);
            }
            Err(e) => {
                self.on_vad_failed(e);
                return;
            }
        }
        self.publish();
    }

    /// Arm or disarm speech detection.  Disarming clears any active speech
    /// and releases a device retained for it.
    pub fn set_vad_armed(&mut self, armed: bool) {
        if armed == self.vad_armed {
            return;
        }

        if armed {
            if self.vad_failed {
                self.report(ErrorKind::VadUnavailable, &"VAD is not available, manual mode only");
                self.publish();
                return;
            }
            if let Some(vad) = self.vad.as_mut() {
                if let Err(e) = vad.start() {
                    self.on_vad_failed(e);
                    return;
                }
            }
            self.vad_armed = true;
            log::info!("coordinator: VAD armed");
        } else {
            self.disarm_vad();
            log::info!("coordinator: VAD disarmed");
        }
        self.publish();
    }

    fn on_vad_failed(&mut self, error: VadError) {
        log::warn!("coordinator: continuing in manual-only mode");
        self.report(ErrorKind::VadUnavailable, &error);
        self.vad_failed = true;
        self.disarm_vad();
        self.vad = None;
        self.publish();
    }

    fn disarm_vad(&mut self) {
        if let Some(vad) = self.vad.as_mut() {
            vad.pause();
        }
        self.vad_armed = false;
        if self.vad_active {
            let before = self.intent();
            self.vad_active = false;
            self.apply_intent(before, false);
        }
        self.capture.release_device();
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop everything: VAD paused, device released, link closed.
    pub fn teardown(&mut self) {
        if let Some(mut vad) = self.vad.take() {
            vad.pause();
        }
        self.vad_active = false;
        self.manual_on = false;
        self.capture.stop(true);
        self.capture.release_device();
        self.connection.close();
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn apply_intent(&mut self, before: StreamIntent, raising: bool) {
        let after = self.intent();
        match (before, after) {
            (StreamIntent::Off, StreamIntent::On) => self.start_capture(),
            (StreamIntent::On, StreamIntent::Off) => self.capture.stop(!self.vad_armed),
            (StreamIntent::On, StreamIntent::On) if raising && !self.capture.is_capturing() => {
                log::info!("coordinator: retrying capture start");
                self.start_capture();
            }
            _ => {}
        }
        self.publish();
    }

    fn start_capture(&mut self) {
        if !self.connection.is_connected() {
            log::warn!("coordinator: streaming while disconnected, chunks are dropped until the link is back");
        }
        if let Err(e) = self.capture.start() {
            self.report(ErrorKind::DeviceUnavailable, &e);
        }
    }

    fn report(&mut self, kind: ErrorKind, error: &dyn fmt::Display) {
        let message = error.to_string();
        match kind {
            ErrorKind::Connection => log::warn!("coordinator: {message}"),
            _ => log::error!("coordinator: {message}"),
        }
        self.last_error = Some(message);
        // Errors are always emitted, even when repeated.
        self.emit(Status::Error(kind));
    }

    fn publish(&mut self) {
        let status = derive_status(
            self.connection.is_connected(),
            self.capture.is_capturing(),
            self.vad_armed && self.vad.is_some(),
        );

        if let Ok(mut snapshot) = self.shared.lock() {
            snapshot.status = status;
            snapshot.connection = self.connection.state();
            snapshot.capture = self.capture.state();
            snapshot.intent = self.intent();
            snapshot.vad_armed = self.vad_armed;
            snapshot.vad_available = self.vad.is_some();
            snapshot.last_error = self.last_error.clone();
            snapshot.link = self.connection.stats();
        }

        if self.last_status != Some(status) {
            log::info!("coordinator: status {}", status.label());
            self.emit(status);
        }
    }

    fn emit(&mut self, status: Status) {
        self.last_status = Some(status);
        if let Some(tx) = self.status_tx.as_ref() {
            let _ = tx.send(status);
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("intent", &self.intent())
            .field("vad_active", &self.vad_active)
            .field("manual_on", &self.manual_on)
            .field("vad_armed", &self.vad_armed)
            .field("connection", &self.connection)
            .field("capture", &self.capture)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
