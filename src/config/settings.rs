//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and handed to the tasks
//! that need them.  Every section is `#[serde(default)]`, so a partial
//! `settings.toml` only overrides the keys it names.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// BackoffMode
// ---------------------------------------------------------------------------

/// How the reconnect delay evolves across consecutive failed attempts.
///
/// | Variant     | Delay after the n-th consecutive failure               |
/// |-------------|--------------------------------------------------------|
/// | Fixed       | `reconnect_delay_ms`                                    |
/// | Exponential | `reconnect_delay_ms * 2^(n-1)`, capped at the maximum   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

impl Default for BackoffMode {
    fn default() -> Self {
        Self::Fixed
    }
}

// ---------------------------------------------------------------------------
// ConnectionConfig
// ---------------------------------------------------------------------------

/// Settings for the duplex channel to the streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint that receives the binary audio chunks.
    pub url: String,
    /// Delay before a reconnect attempt after the channel is lost.
    pub reconnect_delay_ms: u64,
    /// Reconnect delay policy.
    pub backoff: BackoffMode,
    /// Upper bound for the delay when `backoff = "exponential"`.
    pub max_reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".into(),
            reconnect_delay_ms: 3_000,
            backoff: BackoffMode::default(),
            max_reconnect_delay_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Settings for the microphone capture session and its chunk encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Audio input device name; `None` means the system default.
    pub device: Option<String>,
    /// Requested capture rate in Hz; chunks are always encoded at this rate.
    pub sample_rate: u32,
    /// Ask the platform for echo cancellation where it offers one.
    pub echo_cancellation: bool,
    /// Ask the platform for noise suppression where it offers one.
    pub noise_suppression: bool,
    /// Audio duration covered by one transmitted chunk.
    pub chunk_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 44_100,
            echo_cancellation: true,
            noise_suppression: true,
            chunk_interval_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// VadConfig
// ---------------------------------------------------------------------------

/// Settings for the energy-based voice-activity monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Arm VAD at startup.  When `false` the client starts manual-only and
    /// the VAD hotkey arms it later.
    pub enabled: bool,
    /// RMS amplitude above which a frame counts as speech (0.0 – 1.0).
    pub rms_threshold: f32,
    /// Analysis frame length.
    pub frame_ms: u32,
    /// Consecutive speech frames required before `SpeechStart` fires.
    pub min_speech_frames: usize,
    /// Consecutive silent frames required before `SpeechEnd` fires.
    pub redemption_frames: usize,
    /// Audio kept from before the speech start and prepended to the segment.
    pub pre_roll_ms: u32,
    /// Majority-vote window applied to per-frame decisions.
    pub smoothing_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rms_threshold: 0.015,
            frame_ms: 30,
            min_speech_frames: 3,
            redemption_frames: 8,
            pre_roll_ms: 300,
            smoothing_frames: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyConfig
// ---------------------------------------------------------------------------

/// Global hotkey bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    /// Key that flips manual streaming on/off (e.g. `"F9"`).
    pub toggle_stream_key: String,
    /// Key that arms/disarms voice-activity detection (e.g. `"F10"`).
    pub toggle_vad_key: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            toggle_stream_key: "F9".into(),
            toggle_vad_key: "F10".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_stream::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Streaming endpoint and reconnect policy.
    pub connection: ConnectionConfig,
    /// Microphone capture / encoder settings.
    pub capture: CaptureConfig,
    /// Voice-activity detection settings.
    pub vad: VadConfig,
    /// Global hotkey bindings.
    pub hotkey: HotkeyConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.connection.url, loaded.connection.url);
        assert_eq!(
            original.connection.reconnect_delay_ms,
            loaded.connection.reconnect_delay_ms
        );
        assert_eq!(original.connection.backoff, loaded.connection.backoff);
        assert_eq!(original.capture.device, loaded.capture.device);
        assert_eq!(original.capture.sample_rate, loaded.capture.sample_rate);
        assert_eq!(
            original.capture.chunk_interval_ms,
            loaded.capture.chunk_interval_ms
        );
        assert_eq!(original.vad.enabled, loaded.vad.enabled);
        assert_eq!(original.vad.rms_threshold, loaded.vad.rms_threshold);
        assert_eq!(
            original.hotkey.toggle_stream_key,
            loaded.hotkey.toggle_stream_key
        );
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        let default = AppConfig::default();

        assert_eq!(config.connection.url, default.connection.url);
        assert_eq!(config.capture.sample_rate, default.capture.sample_rate);
        assert_eq!(config.vad.frame_ms, default.vad.frame_ms);
    }

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.connection.url, "ws://localhost:8000/ws");
        assert_eq!(cfg.connection.reconnect_delay_ms, 3_000);
        assert_eq!(cfg.connection.backoff, BackoffMode::Fixed);
        assert_eq!(cfg.capture.sample_rate, 44_100);
        assert!(cfg.capture.echo_cancellation);
        assert!(cfg.capture.noise_suppression);
        assert_eq!(cfg.capture.chunk_interval_ms, 100);
        assert!(cfg.vad.enabled);
        assert_eq!(cfg.hotkey.toggle_stream_key, "F9");
        assert_eq!(cfg.hotkey.toggle_vad_key, "F10");
    }

    /// A file naming only a few keys keeps defaults for everything else.
    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[connection]\nurl = \"ws://10.0.0.2:9000/audio\"\nbackoff = \"exponential\"\n\n[vad]\nenabled = false\n",
        )
        .expect("write");

        let cfg = AppConfig::load_from(&path).expect("load");

        assert_eq!(cfg.connection.url, "ws://10.0.0.2:9000/audio");
        assert_eq!(cfg.connection.backoff, BackoffMode::Exponential);
        assert_eq!(cfg.connection.reconnect_delay_ms, 3_000);
        assert!(!cfg.vad.enabled);
        assert_eq!(cfg.vad.frame_ms, 30);
        assert_eq!(cfg.capture.sample_rate, 44_100);
        assert_eq!(cfg.hotkey.toggle_stream_key, "F9");
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.connection.url = "wss://stream.example.org/ws".into();
        cfg.connection.reconnect_delay_ms = 1_500;
        cfg.capture.device = Some("USB Microphone".into());
        cfg.capture.chunk_interval_ms = 250;
        cfg.vad.rms_threshold = 0.04;
        cfg.hotkey.toggle_vad_key = "F12".into();

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.connection.url, "wss://stream.example.org/ws");
        assert_eq!(loaded.connection.reconnect_delay_ms, 1_500);
        assert_eq!(loaded.capture.device.as_deref(), Some("USB Microphone"));
        assert_eq!(loaded.capture.chunk_interval_ms, 250);
        assert!((loaded.vad.rms_threshold - 0.04).abs() < f32::EPSILON);
        assert_eq!(loaded.hotkey.toggle_vad_key, "F12");
    }
}
