//! Microphone acquisition via `cpal`.
//!
//! [`AudioSource`] acquires an input device asynchronously and hands back an
//! [`InputDevice`]: an open handle that can be resumed into a [`RawSink`],
//! paused (handle kept open) or dropped (handle released).
//!
//! [`CpalSource`] is the production implementation.  `cpal::Stream` is not
//! `Send`, so every stream lives on its own `audio-input` OS thread; the
//! [`CpalDevice`] handle talks to that thread over a command channel and is
//! itself `Send`, which lets acquisition results travel through the
//! coordinator's event queue.  Dropping the handle closes the command
//! channel, the thread exits and the stream is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::resample::ResamplerError;
use crate::config::CaptureConfig;
use crate::stream::ErrorKind;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A single buffer of raw audio as delivered by the device callback.
///
/// Samples are interleaved `f32` in the range `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of this chunk in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

/// Where an input device delivers its audio while resumed.  A stream error
/// is delivered in-band as `Err` and ends the interval.
pub type RawSink = mpsc::UnboundedSender<Result<AudioChunk, CaptureError>>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while acquiring or running an input device.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate input devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query supported input configs: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("input device was lost")]
    DeviceLost,

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error(transparent)]
    Resample(#[from] ResamplerError),

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    /// Classify for the status surface: failures while the stream was
    /// running are encoder errors, everything else means the device could
    /// not be acquired.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::Stream(_) | CaptureError::DeviceLost | CaptureError::Resample(_) => {
                ErrorKind::Encoder
            }
            _ => ErrorKind::DeviceUnavailable,
        }
    }
}

/// Reject capture settings that cannot produce a usable chunk stream.
pub fn validate_config(config: &CaptureConfig) -> Result<(), CaptureError> {
    if !(8_000..=192_000).contains(&config.sample_rate) {
        return Err(CaptureError::InvalidConfig(format!(
            "sample_rate must be between 8000 and 192000 Hz, got {}",
            config.sample_rate
        )));
    }
    if !(10..=1_000).contains(&config.chunk_interval_ms) {
        return Err(CaptureError::InvalidConfig(format!(
            "chunk_interval_ms must be between 10 and 1000, got {}",
            config.chunk_interval_ms
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Constraints / format
// ---------------------------------------------------------------------------

/// What the session asks of the platform when acquiring a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl From<&CaptureConfig> for CaptureConstraints {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            device: config.device.clone(),
            sample_rate: config.sample_rate,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
        }
    }
}

/// Format the device actually delivers, which may differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Acquires input devices.  Acquisition may wait on the OS (permission
/// prompts, busy devices) and therefore is async.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn InputDevice>, CaptureError>;
}

/// An open input device.  Dropping it releases the device.
pub trait InputDevice: Send + fmt::Debug {
    /// Start delivering audio into `sink`, replacing any previous sink.
    fn resume(&mut self, sink: RawSink) -> Result<(), CaptureError>;

    /// Stop delivering audio and drop the current sink; the device stays open.
    fn pause(&mut self);

    /// `false` once the underlying stream has failed or been torn down.
    fn is_alive(&self) -> bool;

    fn format(&self) -> StreamFormat;
}

// ---------------------------------------------------------------------------
// CpalSource
// ---------------------------------------------------------------------------

/// [`AudioSource`] backed by the default `cpal` host.
#[derive(Debug, Clone, Default)]
pub struct CpalSource;

impl CpalSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn InputDevice>, CaptureError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            // cpal exposes no switch for these; the OS input chain applies
            // them where the platform provides one.
            log::debug!(
                "capture: requesting echo_cancellation={} noise_suppression={}",
                constraints.echo_cancellation,
                constraints.noise_suppression
            );
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = std_mpsc::channel();
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        {
            let constraints = constraints.clone();
            let sink = Arc::clone(&sink);
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name("audio-input".into())
                .spawn(move || run_device_thread(constraints, sink, alive, ready_tx, command_rx))
                .map_err(|e| CaptureError::Unavailable(format!("cannot spawn input thread: {e}")))?;
        }

        let (format, name) = ready_rx.await.map_err(|_| {
            CaptureError::Unavailable("input thread exited during setup".into())
        })??;

        log::info!(
            "capture: acquired \"{name}\" ({} Hz, {} ch)",
            format.sample_rate,
            format.channels
        );

        Ok(Box::new(CpalDevice {
            commands: command_tx,
            sink,
            alive,
            format,
        }))
    }
}

// ---------------------------------------------------------------------------
// CpalDevice
// ---------------------------------------------------------------------------

type SharedSink = Arc<Mutex<Option<RawSink>>>;

#[derive(Debug)]
enum DeviceCommand {
    Play,
    Pause,
}

/// Handle to a `cpal` input stream owned by an `audio-input` thread.
#[derive(Debug)]
pub struct CpalDevice {
    commands: std_mpsc::Sender<DeviceCommand>,
    sink: SharedSink,
    alive: Arc<AtomicBool>,
    format: StreamFormat,
}

impl InputDevice for CpalDevice {
    fn resume(&mut self, sink: RawSink) -> Result<(), CaptureError> {
        if !self.is_alive() {
            return Err(CaptureError::DeviceLost);
        }
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
        self.commands.send(DeviceCommand::Play).map_err(|_| {
            self.alive.store(false, Ordering::SeqCst);
            CaptureError::DeviceLost
        })
    }

    fn pause(&mut self) {
        if let Ok(mut slot) = self.sink.lock() {
            slot.take();
        }
        let _ = self.commands.send(DeviceCommand::Pause);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn format(&self) -> StreamFormat {
        self.format
    }
}

/// Body of the `audio-input` thread: open the stream, report readiness,
/// then obey play/pause commands until the handle is dropped.
fn run_device_thread(
    constraints: CaptureConstraints,
    sink: SharedSink,
    alive: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(StreamFormat, String), CaptureError>>,
    commands: std_mpsc::Receiver<DeviceCommand>,
) {
    let opened = open_stream(&constraints, Arc::clone(&sink), Arc::clone(&alive));
    let (stream, format, name) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Some backends start capturing as soon as the stream is built.
    if let Err(e) = stream.pause() {
        log::debug!("capture: initial pause not supported: {e}");
    }

    if ready.send(Ok((format, name))).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        let result = match command {
            DeviceCommand::Play => stream.play().map_err(CaptureError::from),
            DeviceCommand::Pause => stream
                .pause()
                .map_err(|e| CaptureError::Stream(e.to_string())),
        };
        if let Err(e) = result {
            log::error!("capture: {command:?} failed: {e}");
            alive.store(false, Ordering::SeqCst);
            forward(&sink, Err(e));
        }
    }

    alive.store(false, Ordering::SeqCst);
    log::debug!("capture: input stream released");
}

fn open_stream(
    constraints: &CaptureConstraints,
    sink: SharedSink,
    alive: Arc<AtomicBool>,
) -> Result<(cpal::Stream, StreamFormat, String), CaptureError> {
    let host = cpal::default_host();
    let device = match constraints.device.as_deref() {
        None => host.default_input_device().ok_or(CaptureError::NoDevice)?,
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(wanted.to_string()))?,
    };
    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let supported = select_config(&device, constraints.sample_rate)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let format = StreamFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, sink, alive)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, sink, alive)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, sink, alive)?,
        other => return Err(CaptureError::UnsupportedFormat(format!("{other:?}"))),
    };

    Ok((stream, format, name))
}

/// Prefer a configuration that supports the requested rate (f32 first, then
/// fewer channels); fall back to the device default.
fn select_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> Result<cpal::SupportedStreamConfig, CaptureError> {
    let wanted = cpal::SampleRate(sample_rate);
    let best = device
        .supported_input_configs()?
        .filter(|range| range.min_sample_rate() <= wanted && wanted <= range.max_sample_rate())
        .max_by_key(|range| {
            (
                range.sample_format() == cpal::SampleFormat::F32,
                std::cmp::Reverse(range.channels()),
            )
        });

    match best {
        Some(range) => Ok(range.with_sample_rate(wanted)),
        None => {
            log::info!("capture: {sample_rate} Hz not supported, using device default (resampled)");
            Ok(device.default_input_config()?)
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: SharedSink,
    alive: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let data_sink = Arc::clone(&sink);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk = AudioChunk {
                samples: data.iter().map(|s| s.to_sample::<f32>()).collect(),
                sample_rate,
                channels,
            };
            forward(&data_sink, Ok(chunk));
        },
        move |err: cpal::StreamError| {
            log::error!("capture: cpal stream error: {err}");
            alive.store(false, Ordering::SeqCst);
            forward(&sink, Err(CaptureError::Stream(err.to_string())));
        },
        None,
    )?;

    Ok(stream)
}

/// Deliver to the current sink, if any.  Send errors (receiver gone) are
/// ignored so the audio thread never panics.
fn forward(sink: &SharedSink, item: Result<AudioChunk, CaptureError>) {
    if let Ok(slot) = sink.lock() {
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(item);
        }
    }
}

// ---------------------------------------------------------------------------
// MockAudioSource  (test-only)
// ---------------------------------------------------------------------------

/// Test double for [`AudioSource`].  Clones share state, so a test keeps one
/// clone to feed audio and inspect counters while the session owns another.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockAudioSource {
    state: Arc<Mutex<MockSourceState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockSourceState {
    fail_next: bool,
    acquisitions: usize,
    resumes: usize,
    pauses: usize,
    releases: usize,
    live_sink: Option<RawSink>,
}

#[cfg(test)]
impl MockAudioSource {
    pub const SAMPLE_RATE: u32 = 44_100;

    pub fn new() -> Self {
        Self::default()
    }

    /// Make acquisitions fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().fail_next = failing;
    }

    pub fn acquisitions(&self) -> usize {
        self.state.lock().unwrap().acquisitions
    }

    pub fn resumes(&self) -> usize {
        self.state.lock().unwrap().resumes
    }

    pub fn pauses(&self) -> usize {
        self.state.lock().unwrap().pauses
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    /// `true` while a device is resumed into a sink.
    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().live_sink.is_some()
    }

    /// Push mono audio at [`Self::SAMPLE_RATE`] into the live sink.
    pub fn feed(&self, samples: Vec<f32>) -> bool {
        self.feed_at(samples, Self::SAMPLE_RATE)
    }

    /// Push mono audio at an arbitrary device rate.
    pub fn feed_at(&self, samples: Vec<f32>, sample_rate: u32) -> bool {
        let state = self.state.lock().unwrap();
        match state.live_sink.as_ref() {
            Some(tx) => tx
                .send(Ok(AudioChunk {
                    samples,
                    sample_rate,
                    channels: 1,
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Simulate a mid-stream device failure.
    pub fn fail_stream(&self, message: &str) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.live_sink.as_ref() {
            let _ = tx.send(Err(CaptureError::Stream(message.into())));
        }
    }
}

#[cfg(test)]
#[async_trait]
impl AudioSource for MockAudioSource {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn InputDevice>, CaptureError> {
        let mut state = self.state.lock().unwrap();
        state.acquisitions += 1;
        if state.fail_next {
            return Err(CaptureError::Unavailable("permission denied".into()));
        }
        Ok(Box::new(MockDevice {
            state: Arc::clone(&self.state),
            alive: true,
        }))
    }
}

#[cfg(test)]
#[derive(Debug)]
pub struct MockDevice {
    state: Arc<Mutex<MockSourceState>>,
    alive: bool,
}

#[cfg(test)]
impl InputDevice for MockDevice {
    fn resume(&mut self, sink: RawSink) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        state.resumes += 1;
        state.live_sink = Some(sink);
        Ok(())
    }

    fn pause(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.pauses += 1;
        state.live_sink = None;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: MockAudioSource::SAMPLE_RATE,
            channels: 1,
        }
    }
}

#[cfg(test)]
impl Drop for MockDevice {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.releases += 1;
            state.live_sink = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunk_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AudioChunk>();
        assert_send::<CpalDevice>();
    }

    #[test]
    fn constraints_follow_capture_config() {
        let constraints = CaptureConstraints::from(&CaptureConfig::default());
        assert_eq!(constraints.sample_rate, 44_100);
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
        assert!(constraints.device.is_none());
    }

    #[test]
    fn stream_failures_classify_as_encoder_errors() {
        assert_eq!(CaptureError::Stream("x".into()).kind(), ErrorKind::Encoder);
        assert_eq!(CaptureError::DeviceLost.kind(), ErrorKind::Encoder);
        assert_eq!(CaptureError::NoDevice.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(
            CaptureError::Unavailable("busy".into()).kind(),
            ErrorKind::DeviceUnavailable
        );
    }

    #[test]
    fn default_capture_config_is_valid() {
        assert!(validate_config(&CaptureConfig::default()).is_ok());
    }

    #[test]
    fn zero_rate_and_zero_interval_are_rejected() {
        let config = CaptureConfig {
            sample_rate: 0,
            ..CaptureConfig::default()
        };
        assert!(matches!(validate_config(&config), Err(CaptureError::InvalidConfig(_))));

        let config = CaptureConfig {
            chunk_interval_ms: 0,
            ..CaptureConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("chunk_interval_ms"));
    }

    #[tokio::test]
    async fn mock_device_counts_lifecycle() {
        let source = MockAudioSource::new();
        let constraints = CaptureConstraints::from(&CaptureConfig::default());

        let mut device = source.acquire(&constraints).await.expect("acquire");
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.resume(tx).unwrap();
        assert!(source.feed(vec![0.5; 10]));
        assert_eq!(rx.recv().await.unwrap().unwrap().samples.len(), 10);

        device.pause();
        assert!(!source.is_streaming());
        drop(device);

        assert_eq!(source.acquisitions(), 1);
        assert_eq!(source.resumes(), 1);
        assert_eq!(source.pauses(), 1);
        assert_eq!(source.releases(), 1);
    }
}
