//! Capture Session: owns the microphone handle and the chunk encoder.
//!
//! ```text
//!            start()                      on_acquired(Ok)
//! Idle ───────────────▶ Capturing ──(acquiring)──────────▶ Capturing (device running)
//!  ▲                        │
//!  └── stop(release) ───────┘   pause (retain) or drop (release) the handle
//! ```
//!
//! The session never blocks.  Acquisition runs on a spawned task and posts
//! [`CaptureEvent::Acquired`]; every capture interval gets its own encoder
//! task that posts [`CaptureEvent::Chunk`]s in production order and flushes
//! the partial tail when the device is paused.
//!
//! A handle acquired while capturing is *retained* across
//! `Capturing → Idle → Capturing` when the caller asks for it, so flapping
//! speech detection does not re-open the device every time.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::capture::{AudioChunk, AudioSource, CaptureConstraints, CaptureError, InputDevice};
use super::encoder::{Chunk, ChunkEncoder};
use crate::config::CaptureConfig;
use crate::stream::{Event, EventSender};

// ---------------------------------------------------------------------------
// CaptureState / CaptureEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    /// A device is running, or being acquired for this interval.
    Capturing,
}

/// Continuations posted back to the coordinator by session tasks.
#[derive(Debug)]
pub enum CaptureEvent {
    Acquired(Result<Box<dyn InputDevice>, CaptureError>),
    Chunk { interval: u64, chunk: Chunk },
    Failed { interval: u64, error: CaptureError },
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

pub struct CaptureSession {
    source: Arc<dyn AudioSource>,
    constraints: CaptureConstraints,
    chunk_interval_ms: u64,
    events: EventSender,

    state: CaptureState,
    device: Option<Box<dyn InputDevice>>,
    acquiring: bool,
    /// What to do with a device that arrives after a `stop()`.
    release_on_arrival: bool,
    /// Incremented on every `Idle → Capturing`.
    interval: u64,
    acquisitions: u64,
}

impl CaptureSession {
    pub fn new(source: Arc<dyn AudioSource>, config: &CaptureConfig, events: EventSender) -> Self {
        Self {
            source,
            constraints: CaptureConstraints::from(config),
            chunk_interval_ms: config.chunk_interval_ms,
            events,
            state: CaptureState::Idle,
            device: None,
            acquiring: false,
            release_on_arrival: false,
            interval: 0,
            acquisitions: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// `true` while a device handle is open, running or paused.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Number of acquisitions requested over the session's lifetime.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Enter `Capturing`.  Resumes a retained handle when it is still alive,
    /// otherwise requests one (never more than one request in flight).
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.is_capturing() {
            return Ok(());
        }
        self.state = CaptureState::Capturing;
        self.interval += 1;
        self.release_on_arrival = false;

        if let Some(device) = self.device.take() {
            if device.is_alive() {
                self.device = Some(device);
                log::info!("capture: resuming retained device (interval {})", self.interval);
                return self.begin_interval();
            }
            log::warn!("capture: retained device is gone, acquiring a new one");
        }

        if !self.acquiring {
            self.spawn_acquisition();
        }
        Ok(())
    }

    /// Result of the acquisition started by [`start`](Self::start).  A
    /// failure only counts while the session still wants the device.
    pub fn on_acquired(
        &mut self,
        result: Result<Box<dyn InputDevice>, CaptureError>,
    ) -> Result<(), CaptureError> {
        self.acquiring = false;
        let device = match result {
            Ok(device) => device,
            Err(e) if self.is_capturing() => {
                self.state = CaptureState::Idle;
                return Err(e);
            }
            Err(e) => {
                log::debug!("capture: acquisition failed after stop, ignoring: {e}");
                return Ok(());
            }
        };

        if self.is_capturing() {
            self.device = Some(device);
            self.begin_interval()
        } else if self.release_on_arrival {
            log::debug!("capture: stopped during acquisition, releasing device");
            drop(device);
            Ok(())
        } else {
            log::debug!("capture: stopped during acquisition, retaining device");
            self.device = Some(device);
            Ok(())
        }
    }

    /// Leave `Capturing`.  `release` drops the handle, otherwise it is
    /// paused and kept for the next `start()`.  No-op when idle.
    pub fn stop(&mut self, release: bool) {
        if !self.is_capturing() {
            return;
        }
        self.state = CaptureState::Idle;

        if let Some(device) = self.device.as_mut() {
            device.pause();
        }
        if release {
            self.device = None;
        }
        if self.acquiring {
            self.release_on_arrival = release;
        }
        log::info!(
            "capture: stopped interval {} ({})",
            self.interval,
            if release { "released" } else { "retained" }
        );
    }

    /// Drop a retained handle.  Ignored while capturing.
    pub fn release_device(&mut self) {
        if self.is_capturing() {
            return;
        }
        if self.device.take().is_some() {
            log::info!("capture: device released");
        }
        if self.acquiring {
            self.release_on_arrival = true;
        }
    }

    /// Tear the session down after a stream failure in `interval`.  Returns
    /// `false` for failures of an interval that already ended.
    pub fn on_stream_failed(&mut self, interval: u64) -> bool {
        if interval != self.interval || !self.is_capturing() {
            return false;
        }
        self.state = CaptureState::Idle;
        self.device = None;
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn spawn_acquisition(&mut self) {
        self.acquiring = true;
        self.acquisitions += 1;
        log::info!("capture: acquiring input device");

        let source = Arc::clone(&self.source);
        let constraints = self.constraints.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = source.acquire(&constraints).await;
            let _ = events.send(Event::Capture(CaptureEvent::Acquired(result)));
        });
    }

    fn begin_interval(&mut self) -> Result<(), CaptureError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = device.resume(tx) {
            self.device = None;
            self.state = CaptureState::Idle;
            return Err(e);
        }

        let encoder = ChunkEncoder::new(self.constraints.sample_rate, self.chunk_interval_ms);
        tokio::spawn(encode_interval(self.interval, rx, encoder, self.events.clone()));
        Ok(())
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("interval", &self.interval)
            .field("acquiring", &self.acquiring)
            .field("has_device", &self.device.is_some())
            .finish()
    }
}

/// Encode one capture interval until the device stops feeding it.
async fn encode_interval(
    interval: u64,
    mut audio_rx: mpsc::UnboundedReceiver<Result<AudioChunk, CaptureError>>,
    mut encoder: ChunkEncoder,
    events: EventSender,
) {
    while let Some(item) = audio_rx.recv().await {
        match item {
            Ok(audio) => match encoder.push(&audio) {
                Ok(chunks) => {
                    if !post_chunks(interval, chunks, &events) {
                        return;
                    }
                }
                Err(error) => {
                    let _ = events.send(Event::Capture(CaptureEvent::Failed { interval, error }));
                    return;
                }
            },
            Err(error) => {
                let _ = events.send(Event::Capture(CaptureEvent::Failed { interval, error }));
                return;
            }
        }
    }

    match encoder.flush() {
        Ok(chunks) => {
            post_chunks(interval, chunks, &events);
        }
        Err(e) => log::warn!("capture: dropping tail of interval {interval}: {e}"),
    }
}

/// Returns `false` once the coordinator queue is gone.
fn post_chunks(interval: u64, chunks: Vec<Chunk>, events: &EventSender) -> bool {
    chunks.into_iter().all(|chunk| {
        events
            .send(Event::Capture(CaptureEvent::Chunk { interval, chunk }))
            .is_ok()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
