//! The coordinator's single event queue.
//!
//! Every asynchronous source (link tasks, reconnect timer, acquisition,
//! encoder tasks, the VAD monitor, hotkeys, Ctrl-C) posts an [`Event`] here;
//! [`Coordinator::run`](super::Coordinator::run) handles them one at a time.

use tokio::sync::mpsc;

use crate::audio::{CaptureEvent, VadError, VadEvent, VoiceActivity};
use crate::hotkey::HotkeyEvent;
use crate::transport::ConnectionEvent;

#[derive(Debug)]
pub enum Event {
    Connection(ConnectionEvent),
    Capture(CaptureEvent),
    Vad(VadEvent),
    /// Outcome of VAD initialisation, delivered once at startup.
    VadReady(Result<Box<dyn VoiceActivity>, VadError>),
    ManualToggle,
    ToggleVad,
    Shutdown,
}

impl From<HotkeyEvent> for Event {
    fn from(event: HotkeyEvent) -> Self {
        match event {
            HotkeyEvent::ToggleStreaming => Event::ManualToggle,
            HotkeyEvent::ToggleVad => Event::ToggleVad,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
