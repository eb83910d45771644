//! Dedicated OS-thread hotkey listener using `rdev::listen`.
//!
//! `rdev::listen` has no graceful shutdown API.  Dropping the
//! [`HotkeyListener`] sets a stop flag so the callback forwards nothing
//! further; the thread itself stays parked in the rdev loop until the process
//! exits.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use tokio::sync::mpsc;

use super::{HotkeyBindings, HotkeyEvent};

// ---------------------------------------------------------------------------
// KeyGate
// ---------------------------------------------------------------------------

/// Turns raw press/release events into one toggle per physical press.
///
/// OS auto-repeat delivers `KeyPress` over and over while a key is held; only
/// the first press after a release counts.
#[derive(Debug)]
pub struct KeyGate {
    bindings: HotkeyBindings,
    /// Bound keys currently held down.
    held: Vec<rdev::Key>,
}

impl KeyGate {
    pub fn new(bindings: HotkeyBindings) -> Self {
        Self {
            bindings,
            held: Vec::new(),
        }
    }

    pub fn on_event(&mut self, event: &rdev::EventType) -> Option<HotkeyEvent> {
        match *event {
            rdev::EventType::KeyPress(key) => {
                let toggle = self.bindings.event_for(key)?;
                if self.held.contains(&key) {
                    return None;
                }
                self.held.push(key);
                Some(toggle)
            }
            rdev::EventType::KeyRelease(key) => {
                self.held.retain(|k| *k != key);
                None
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyListener
// ---------------------------------------------------------------------------

/// Handle to the running listener thread.  Drop it to stop forwarding.
pub struct HotkeyListener {
    stop: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl HotkeyListener {
    /// Spawn the `hotkey-listener` thread.  Toggles are delivered on `tx`
    /// with `blocking_send`, which is fine from a non-async thread.
    pub fn start(bindings: HotkeyBindings, tx: mpsc::Sender<HotkeyEvent>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("hotkey-listener".into())
            .spawn(move || {
                let mut gate = KeyGate::new(bindings);
                let result = rdev::listen(move |event| {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(toggle) = gate.on_event(&event.event_type) {
                        log::debug!("hotkey: {toggle:?}");
                        let _ = tx.blocking_send(toggle);
                    }
                });

                if let Err(e) = result {
                    log::error!("hotkey: rdev::listen exited with error: {e:?}");
                }
            })?;

        log::info!(
            "hotkey: {:?} toggles streaming, {:?} toggles VAD",
            bindings.toggle_stream,
            bindings.toggle_vad
        );
        Ok(Self {
            stop,
            _thread: thread,
        })
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
