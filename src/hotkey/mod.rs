//! Global hotkeys, backed by `rdev`.
//!
//! Two bindings, both toggles:
//!
//! | config key          | default | event                            |
//! |---------------------|---------|----------------------------------|
//! | `toggle_stream_key` | F9      | [`HotkeyEvent::ToggleStreaming`] |
//! | `toggle_vad_key`    | F10     | [`HotkeyEvent::ToggleVad`]       |
//!
//! `rdev::listen()` blocks forever, so it runs on a dedicated OS thread (see
//! [`HotkeyListener`]).  Holding a key down produces one toggle, not a
//! stream of auto-repeat toggles.
//!
//! # Usage
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use voice_stream::hotkey::{HotkeyBindings, HotkeyListener};
//! use voice_stream::config::HotkeyConfig;
//!
//! let bindings = HotkeyBindings::from_config(&HotkeyConfig::default()).expect("bad key");
//! let (tx, mut rx) = mpsc::channel(16);
//! let _listener = HotkeyListener::start(bindings, tx);
//! ```

pub mod listener;

use anyhow::{anyhow, Result};

pub use listener::{HotkeyListener, KeyGate};

use crate::config::HotkeyConfig;

// ---------------------------------------------------------------------------
// HotkeyEvent / HotkeyBindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    /// Flip manual streaming on/off.
    ToggleStreaming,
    /// Arm or disarm voice-activity detection.
    ToggleVad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HotkeyBindings {
    pub toggle_stream: rdev::Key,
    pub toggle_vad: rdev::Key,
}

impl HotkeyBindings {
    pub fn from_config(config: &HotkeyConfig) -> Result<Self> {
        let lookup = |name: &str| parse_key(name).ok_or_else(|| anyhow!("unknown hotkey \"{name}\""));
        let bindings = Self {
            toggle_stream: lookup(&config.toggle_stream_key)?,
            toggle_vad: lookup(&config.toggle_vad_key)?,
        };
        if bindings.toggle_stream == bindings.toggle_vad {
            return Err(anyhow!(
                "toggle_stream_key and toggle_vad_key are both \"{}\"",
                config.toggle_stream_key
            ));
        }
        Ok(bindings)
    }

    /// Which toggle, if any, a key is bound to.
    pub fn event_for(&self, key: rdev::Key) -> Option<HotkeyEvent> {
        if key == self.toggle_stream {
            Some(HotkeyEvent::ToggleStreaming)
        } else if key == self.toggle_vad {
            Some(HotkeyEvent::ToggleVad)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// parse_key
// ---------------------------------------------------------------------------

const FUNCTION_KEYS: [rdev::Key; 12] = [
    rdev::Key::F1,
    rdev::Key::F2,
    rdev::Key::F3,
    rdev::Key::F4,
    rdev::Key::F5,
    rdev::Key::F6,
    rdev::Key::F7,
    rdev::Key::F8,
    rdev::Key::F9,
    rdev::Key::F10,
    rdev::Key::F11,
    rdev::Key::F12,
];

const LETTER_KEYS: [rdev::Key; 26] = [
    rdev::Key::KeyA,
    rdev::Key::KeyB,
    rdev::Key::KeyC,
    rdev::Key::KeyD,
    rdev::Key::KeyE,
    rdev::Key::KeyF,
    rdev::Key::KeyG,
    rdev::Key::KeyH,
    rdev::Key::KeyI,
    rdev::Key::KeyJ,
    rdev::Key::KeyK,
    rdev::Key::KeyL,
    rdev::Key::KeyM,
    rdev::Key::KeyN,
    rdev::Key::KeyO,
    rdev::Key::KeyP,
    rdev::Key::KeyQ,
    rdev::Key::KeyR,
    rdev::Key::KeyS,
    rdev::Key::KeyT,
    rdev::Key::KeyU,
    rdev::Key::KeyV,
    rdev::Key::KeyW,
    rdev::Key::KeyX,
    rdev::Key::KeyY,
    rdev::Key::KeyZ,
];

/// Parse a key name from the config file.  Case-insensitive; supports
/// F1–F12, single letters and a handful of named keys.
///
/// ```
/// use voice_stream::hotkey::parse_key;
///
/// assert_eq!(parse_key("F10"), Some(rdev::Key::F10));
/// assert_eq!(parse_key("pause"), Some(rdev::Key::Pause));
/// assert_eq!(parse_key("q"), Some(rdev::Key::KeyQ));
/// assert_eq!(parse_key("Ctrl+V"), None);
/// ```
pub fn parse_key(name: &str) -> Option<rdev::Key> {
    let lower = name.trim().to_ascii_lowercase();

    if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<usize>().ok()) {
        return n.checked_sub(1).and_then(|i| FUNCTION_KEYS.get(i)).copied();
    }
    if let [c @ b'a'..=b'z'] = lower.as_bytes() {
        return Some(LETTER_KEYS[(c - b'a') as usize]);
    }

    let key = match lower.as_str() {
        "escape" | "esc" => rdev::Key::Escape,
        "space" => rdev::Key::Space,
        "return" | "enter" => rdev::Key::Return,
        "tab" => rdev::Key::Tab,
        "home" => rdev::Key::Home,
        "end" => rdev::Key::End,
        "pageup" => rdev::Key::PageUp,
        "pagedown" => rdev::Key::PageDown,
        "insert" => rdev::Key::Insert,
        "capslock" => rdev::Key::CapsLock,
        "scrolllock" => rdev::Key::ScrollLock,
        "printscreen" => rdev::Key::PrintScreen,
        "pause" => rdev::Key::Pause,
        _ => return None,
    };
    Some(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_function_keys() {
        assert_eq!(parse_key("F1"), Some(rdev::Key::F1));
        assert_eq!(parse_key("f9"), Some(rdev::Key::F9));
        assert_eq!(parse_key("F12"), Some(rdev::Key::F12));
        assert_eq!(parse_key("F0"), None);
        assert_eq!(parse_key("F13"), None);
    }

    #[test]
    fn parse_letters_and_named_keys() {
        assert_eq!(parse_key("A"), Some(rdev::Key::KeyA));
        assert_eq!(parse_key("z"), Some(rdev::Key::KeyZ));
        assert_eq!(parse_key("Esc"), Some(rdev::Key::Escape));
        assert_eq!(parse_key("ScrollLock"), Some(rdev::Key::ScrollLock));
    }

    #[test]
    fn parse_unknown_returns_none() {
        assert_eq!(parse_key(""), None);
        assert_eq!(parse_key("xyz"), None);
        assert_eq!(parse_key("Ctrl+V"), None);
    }

    #[test]
    fn default_bindings() {
        let bindings = HotkeyBindings::from_config(&HotkeyConfig::default()).unwrap();
        assert_eq!(bindings.event_for(rdev::Key::F9), Some(HotkeyEvent::ToggleStreaming));
        assert_eq!(bindings.event_for(rdev::Key::F10), Some(HotkeyEvent::ToggleVad));
        assert_eq!(bindings.event_for(rdev::Key::F11), None);
    }

    #[test]
    fn bindings_reject_unknown_and_duplicate_keys() {
        let config = HotkeyConfig {
            toggle_stream_key: "Hyper".into(),
            ..HotkeyConfig::default()
        };
        assert!(HotkeyBindings::from_config(&config).is_err());

        let config = HotkeyConfig {
            toggle_stream_key: "F10".into(),
            toggle_vad_key: "f10".into(),
        };
        assert!(HotkeyBindings::from_config(&config).is_err());
    }
}
