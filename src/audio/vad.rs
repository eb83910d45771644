//! Energy-based Voice Activity Detection (VAD).
//!
//! Three layers:
//!
//! * [`VadDetector`]: classifies a single frame as voice/silence by RMS and
//!   trims leading/trailing silence from a finished segment.
//! * [`SpeechDetector`]: streaming state machine on top of it: smooths the
//!   per-frame decisions, requires `min_speech_frames` to declare speech and
//!   `redemption_frames` of silence to end it, and reports each segment
//!   (with pre-roll) as [`VadEvent::SpeechEnd`].
//! * [`VadMonitor`]: the collaborator the coordinator talks to through the
//!   [`VoiceActivity`] trait.  While started it holds its own input device
//!   and posts [`VadEvent`]s into the coordinator's queue.
//!
//! ```text
//! Silent ──min_speech_frames speech──▶ Speaking   (SpeechStart)
//! Speaking ──redemption_frames silence──▶ Silent  (SpeechEnd { segment })
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::buffer::RingBuffer;
use super::capture::{AudioSource, CaptureConstraints, CaptureError};
use super::resample::stereo_to_mono;
use crate::config::VadConfig;
use crate::stream::{Event, EventSender};

// ---------------------------------------------------------------------------
// VadError / VadEvent
// ---------------------------------------------------------------------------

/// Why the VAD subsystem is not (or no longer) available.
#[derive(Debug, Error)]
pub enum VadError {
    #[error("VAD input unavailable: {0}")]
    Device(#[from] CaptureError),

    #[error("invalid VAD configuration: {0}")]
    InvalidConfig(String),
}

/// Events the VAD collaborator posts to the coordinator.
#[derive(Debug)]
pub enum VadEvent {
    SpeechStart,
    /// End of a speech segment.  `segment` is mono audio at the monitor's
    /// input rate, pre-roll included, leading/trailing silence trimmed.
    SpeechEnd { segment: Vec<f32> },
    /// The monitor's input failed while running.
    Failed(VadError),
}

/// Reject configurations the detector cannot run with.
pub fn validate_config(config: &VadConfig) -> Result<(), VadError> {
    if !(config.rms_threshold > 0.0 && config.rms_threshold <= 1.0) {
        return Err(VadError::InvalidConfig(format!(
            "rms_threshold must be in (0, 1], got {}",
            config.rms_threshold
        )));
    }
    if !(10..=100).contains(&config.frame_ms) {
        return Err(VadError::InvalidConfig(format!(
            "frame_ms must be between 10 and 100, got {}",
            config.frame_ms
        )));
    }
    if config.min_speech_frames == 0 || config.redemption_frames == 0 {
        return Err(VadError::InvalidConfig(
            "min_speech_frames and redemption_frames must be at least 1".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// VadDetector
// ---------------------------------------------------------------------------

/// Energy-based frame classifier and silence trimmer.
///
/// # Example
///
/// ```rust
/// use voice_stream::audio::VadDetector;
///
/// let vad = VadDetector::new(0.01, 480);
///
/// let mut audio = vec![0.0_f32; 480];
/// audio.extend(vec![0.5_f32; 480]);
/// audio.extend(vec![0.0_f32; 480]);
///
/// assert_eq!(vad.trim_silence(&audio).len(), 480);
/// ```
#[derive(Debug, Clone)]
pub struct VadDetector {
    rms_threshold: f32,
    frame_size: usize,
}

impl VadDetector {
    /// # Panics
    ///
    /// Panics if `frame_size == 0`.
    pub fn new(rms_threshold: f32, frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame_size must be > 0");
        Self {
            rms_threshold,
            frame_size,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.rms_threshold
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Returns `true` when the frame's RMS exceeds the threshold.
    pub fn is_voice(&self, frame: &[f32]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let mean_sq: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        mean_sq.sqrt() > self.rms_threshold
    }

    /// Trim leading and trailing silent frames.  Returns a sub-slice; an
    /// all-silent input yields an empty slice.
    pub fn trim_silence<'a>(&self, audio: &'a [f32]) -> &'a [f32] {
        let frame = |i: usize| {
            let s = i * self.frame_size;
            let e = ((i + 1) * self.frame_size).min(audio.len());
            &audio[s..e]
        };
        let total_frames = audio.len().div_ceil(self.frame_size);

        let Some(first) = (0..total_frames).find(|&i| self.is_voice(frame(i))) else {
            return &audio[0..0];
        };
        let last = (0..total_frames)
            .rfind(|&i| self.is_voice(frame(i)))
            .unwrap_or(first);

        let start = first * self.frame_size;
        let end = ((last + 1) * self.frame_size).min(audio.len());
        &audio[start..end]
    }
}

// ---------------------------------------------------------------------------
// SpeechDetector
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DetectorState {
    Silent { speech_run: usize, onset: Vec<f32> },
    Speaking { silence_run: usize, segment: Vec<f32> },
}

/// Streaming speech/silence state machine over mono audio.
#[derive(Debug)]
pub struct SpeechDetector {
    classifier: VadDetector,
    min_speech_frames: usize,
    redemption_frames: usize,
    smoothing: usize,
    window: VecDeque<bool>,
    pre_roll: RingBuffer<f32>,
    partial: Vec<f32>,
    state: DetectorState,
}

impl SpeechDetector {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        let frame_size = (sample_rate as usize * config.frame_ms as usize / 1_000).max(1);
        Self {
            classifier: VadDetector::new(config.rms_threshold, frame_size),
            min_speech_frames: config.min_speech_frames.max(1),
            redemption_frames: config.redemption_frames.max(1),
            smoothing: config.smoothing_frames.max(1),
            window: VecDeque::new(),
            pre_roll: RingBuffer::with_duration(config.pre_roll_ms, sample_rate),
            partial: Vec::new(),
            state: DetectorState::Silent {
                speech_run: 0,
                onset: Vec::new(),
            },
        }
    }

    pub fn frame_size(&self) -> usize {
        self.classifier.frame_size()
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, DetectorState::Speaking { .. })
    }

    /// Feed mono samples; returns the boundary events they produced.
    pub fn push(&mut self, samples: &[f32]) -> Vec<VadEvent> {
        self.partial.extend_from_slice(samples);
        let frame_size = self.frame_size();

        let mut events = Vec::new();
        let mut consumed = 0;
        while self.partial.len() - consumed >= frame_size {
            let frame = self.partial[consumed..consumed + frame_size].to_vec();
            consumed += frame_size;
            if let Some(event) = self.process_frame(&frame) {
                events.push(event);
            }
        }
        self.partial.drain(..consumed);
        events
    }

    /// Close an open segment, e.g. when the monitor is paused mid-speech.
    pub fn finish(&mut self) -> Option<VadEvent> {
        self.partial.clear();
        self.window.clear();
        let previous = std::mem::replace(
            &mut self.state,
            DetectorState::Silent {
                speech_run: 0,
                onset: Vec::new(),
            },
        );
        match previous {
            DetectorState::Speaking { segment, .. } => Some(self.end_segment(segment)),
            DetectorState::Silent { .. } => None,
        }
    }

    fn process_frame(&mut self, frame: &[f32]) -> Option<VadEvent> {
        let speech = self.smooth(self.classifier.is_voice(frame));

        match &mut self.state {
            DetectorState::Silent { speech_run, onset } => {
                if speech {
                    *speech_run += 1;
                    onset.extend_from_slice(frame);
                    if *speech_run >= self.min_speech_frames {
                        let mut segment = self.pre_roll.drain();
                        segment.append(onset);
                        self.state = DetectorState::Speaking {
                            silence_run: 0,
                            segment,
                        };
                        return Some(VadEvent::SpeechStart);
                    }
                } else {
                    *speech_run = 0;
                    self.pre_roll.push_slice(onset);
                    onset.clear();
                    self.pre_roll.push_slice(frame);
                }
                None
            }
            DetectorState::Speaking {
                silence_run,
                segment,
            } => {
                segment.extend_from_slice(frame);
                if speech {
                    *silence_run = 0;
                    return None;
                }
                *silence_run += 1;
                if *silence_run < self.redemption_frames {
                    return None;
                }
                let segment = std::mem::take(segment);
                self.state = DetectorState::Silent {
                    speech_run: 0,
                    onset: Vec::new(),
                };
                Some(self.end_segment(segment))
            }
        }
    }

    fn end_segment(&self, segment: Vec<f32>) -> VadEvent {
        VadEvent::SpeechEnd {
            segment: self.classifier.trim_silence(&segment).to_vec(),
        }
    }

    /// Majority vote over the last `smoothing` raw decisions; ties count as
    /// silence.
    fn smooth(&mut self, speech: bool) -> bool {
        if self.smoothing <= 1 {
            return speech;
        }
        self.window.push_back(speech);
        if self.window.len() > self.smoothing {
            self.window.pop_front();
        }
        let votes = self.window.iter().filter(|&&s| s).count();
        votes * 2 > self.window.len()
    }
}

// ---------------------------------------------------------------------------
// VoiceActivity / VadMonitor
// ---------------------------------------------------------------------------

/// Lifecycle of the VAD collaborator as seen by the coordinator.  Speech
/// boundaries arrive as [`Event::Vad`] on the coordinator's queue.
pub trait VoiceActivity: Send + fmt::Debug {
    /// Begin (or resume) monitoring.  Idempotent.
    fn start(&mut self) -> Result<(), VadError>;

    /// Stop monitoring; an open segment is closed with a final `SpeechEnd`.
    fn pause(&mut self);
}

/// Energy VAD running on its own input stream.
///
/// The input device is acquired when monitoring starts and released when it
/// pauses, so a disarmed monitor holds no microphone.
pub struct VadMonitor {
    source: Arc<dyn AudioSource>,
    constraints: CaptureConstraints,
    config: VadConfig,
    events: EventSender,
    /// Dropping or firing this ends the running monitor task.
    stop: Option<oneshot::Sender<()>>,
}

impl VadMonitor {
    /// Validate the configuration.  No device is opened until [`start`].
    ///
    /// [`start`]: VoiceActivity::start
    pub fn new(
        source: Arc<dyn AudioSource>,
        constraints: CaptureConstraints,
        config: VadConfig,
        events: EventSender,
    ) -> Result<Self, VadError> {
        validate_config(&config)?;
        log::info!(
            "vad: monitor ready (threshold {:.3}, {} ms frames)",
            config.rms_threshold,
            config.frame_ms
        );
        Ok(Self {
            source,
            constraints,
            config,
            events,
            stop: None,
        })
    }

    fn is_running(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| !stop.is_closed())
    }
}

impl fmt::Debug for VadMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VadMonitor")
            .field("constraints", &self.constraints)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl VoiceActivity for VadMonitor {
    fn start(&mut self) -> Result<(), VadError> {
        if self.is_running() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(monitor(
            Arc::clone(&self.source),
            self.constraints.clone(),
            self.config.clone(),
            self.events.clone(),
            stop_rx,
        ));
        self.stop = Some(stop_tx);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Acquire the input, run the detector until stopped, then release the input
/// and close any open segment.
async fn monitor(
    source: Arc<dyn AudioSource>,
    constraints: CaptureConstraints,
    config: VadConfig,
    events: EventSender,
    mut stop: oneshot::Receiver<()>,
) {
    let fail = |e: CaptureError| {
        let _ = events.send(Event::Vad(VadEvent::Failed(VadError::Device(e))));
    };

    let mut device = tokio::select! {
        acquired = source.acquire(&constraints) => match acquired {
            Ok(device) => device,
            Err(e) => return fail(e),
        },
        _ = &mut stop => return,
    };

    let (tx, mut audio_rx) = mpsc::unbounded_channel();
    if let Err(e) = device.resume(tx) {
        return fail(e);
    }
    let mut detector = SpeechDetector::new(&config, device.format().sample_rate);
    log::debug!("vad: monitoring");

    loop {
        tokio::select! {
            item = audio_rx.recv() => match item {
                Some(Ok(audio)) => {
                    let mono = stereo_to_mono(&audio.samples, audio.channels);
                    for event in detector.push(&mono) {
                        if events.send(Event::Vad(event)).is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => return fail(e),
                None => break,
            },
            _ = &mut stop => break,
        }
    }

    device.pause();
    drop(device);
    log::debug!("vad: paused, input released");

    if let Some(event) = detector.finish() {
        let _ = events.send(Event::Vad(event));
    }
}

// ---------------------------------------------------------------------------
// MockVad  (test-only)
// ---------------------------------------------------------------------------

/// Test double for [`VoiceActivity`]; clones share counters.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockVad {
    state: std::sync::Arc<std::sync::Mutex<MockVadState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockVadState {
    starts: usize,
    pauses: usize,
    running: bool,
}

#[cfg(test)]
impl MockVad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn pauses(&self) -> usize {
        self.state.lock().unwrap().pauses
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

#[cfg(test)]
impl VoiceActivity for MockVad {
    fn start(&mut self) -> Result<(), VadError> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        state.running = true;
        Ok(())
    }

    fn pause(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.pauses += 1;
        state.running = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::MockAudioSource;

    const RATE: u32 = 1_000; // 30 ms frames = 30 samples

    fn config() -> VadConfig {
        VadConfig {
            enabled: true,
            rms_threshold: 0.05,
            frame_ms: 30,
            min_speech_frames: 2,
            redemption_frames: 3,
            pre_roll_ms: 60,
            smoothing_frames: 1,
        }
    }

    fn frames(value: f32, count: usize) -> Vec<f32> {
        vec![value; 30 * count]
    }

    // ---- VadDetector -------------------------------------------------------

    #[test]
    fn trims_leading_and_trailing_silence() {
        let mut audio = vec![0.0_f32; 480];
        audio.extend(vec![0.5_f32; 480]);
        audio.extend(vec![0.0_f32; 480]);
        let vad = VadDetector::new(0.01, 480);
        assert_eq!(vad.trim_silence(&audio).len(), 480);
    }

    #[test]
    fn all_silence_trims_to_empty() {
        let vad = VadDetector::new(0.01, 480);
        assert!(vad.trim_silence(&[0.0_f32; 1_440]).is_empty());
        assert!(vad.trim_silence(&[]).is_empty());
    }

    #[test]
    #[should_panic(expected = "frame_size must be > 0")]
    fn zero_frame_size_panics() {
        VadDetector::new(0.01, 0);
    }

    // ---- SpeechDetector ----------------------------------------------------

    #[test]
    fn speech_start_needs_min_speech_frames() {
        let mut det = SpeechDetector::new(&config(), RATE);
        assert_eq!(det.frame_size(), 30);

        assert!(det.push(&frames(0.5, 1)).is_empty());
        let events = det.push(&frames(0.5, 1));
        assert!(matches!(events.as_slice(), [VadEvent::SpeechStart]));
        assert!(det.is_speaking());
    }

    #[test]
    fn short_blip_does_not_start_speech() {
        let mut det = SpeechDetector::new(&config(), RATE);
        let mut audio = frames(0.5, 1);
        audio.extend(frames(0.0, 4));
        audio.extend(frames(0.5, 1));
        assert!(det.push(&audio).is_empty());
        assert!(!det.is_speaking());
    }

    #[test]
    fn speech_end_after_redemption_frames_with_trimmed_segment() {
        let mut det = SpeechDetector::new(&config(), RATE);
        let mut audio = frames(0.0, 3); // becomes pre-roll
        audio.extend(frames(0.5, 4));
        audio.extend(frames(0.0, 3));

        let events = det.push(&audio);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], VadEvent::SpeechStart));
        match &events[1] {
            VadEvent::SpeechEnd { segment } => assert_eq!(segment.len(), 4 * 30),
            other => panic!("expected SpeechEnd, got {other:?}"),
        }
        assert!(!det.is_speaking());
    }

    #[test]
    fn brief_pause_inside_speech_is_bridged() {
        let mut det = SpeechDetector::new(&config(), RATE);
        let mut audio = frames(0.5, 3);
        audio.extend(frames(0.0, 2)); // shorter than redemption
        audio.extend(frames(0.5, 2));

        let events = det.push(&audio);
        assert_eq!(events.len(), 1);
        assert!(det.is_speaking());
    }

    #[test]
    fn partial_frames_carry_over_between_pushes() {
        let mut det = SpeechDetector::new(&config(), RATE);
        assert!(det.push(&vec![0.5; 45]).is_empty());
        let events = det.push(&vec![0.5; 15]);
        assert!(matches!(events.as_slice(), [VadEvent::SpeechStart]));
    }

    #[test]
    fn smoothing_ignores_single_frame_spikes() {
        let mut cfg = config();
        cfg.smoothing_frames = 3;
        cfg.min_speech_frames = 1;
        let mut det = SpeechDetector::new(&cfg, RATE);

        let mut audio = frames(0.0, 2);
        audio.extend(frames(0.5, 1));
        audio.extend(frames(0.0, 2));
        assert!(det.push(&audio).is_empty());
    }

    #[test]
    fn finish_closes_open_segment() {
        let mut det = SpeechDetector::new(&config(), RATE);
        let _ = det.push(&frames(0.5, 3));
        assert!(matches!(det.finish(), Some(VadEvent::SpeechEnd { .. })));
        assert!(det.finish().is_none());
    }

    // ---- Config validation -------------------------------------------------

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = config();
        cfg.rms_threshold = 0.0;
        assert!(matches!(validate_config(&cfg), Err(VadError::InvalidConfig(_))));

        let mut cfg = config();
        cfg.frame_ms = 5;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = config();
        cfg.redemption_frames = 0;
        assert!(validate_config(&cfg).is_err());

        assert!(validate_config(&VadConfig::default()).is_ok());
    }

    // ---- VadMonitor --------------------------------------------------------

    fn monitor_for(source: &MockAudioSource, cfg: VadConfig) -> (VadMonitor, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let constraints = CaptureConstraints::from(&crate::config::CaptureConfig::default());
        let monitor = VadMonitor::new(Arc::new(source.clone()), constraints, cfg, events).expect("valid config");
        (monitor, rx)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn monitor_rejects_invalid_config() {
        let (events, _rx) = mpsc::unbounded_channel();
        let constraints = CaptureConstraints::from(&crate::config::CaptureConfig::default());
        let mut cfg = VadConfig::default();
        cfg.frame_ms = 0;
        let result = VadMonitor::new(Arc::new(MockAudioSource::new()), constraints, cfg, events);
        assert!(matches!(result, Err(VadError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn disarmed_monitor_holds_no_device() {
        let source = MockAudioSource::new();
        let (mut monitor, _rx) = monitor_for(&source, VadConfig::default());
        settle().await;
        assert_eq!(source.acquisitions(), 0);

        monitor.start().expect("start");
        settle().await;
        assert_eq!(source.acquisitions(), 1);
        assert!(source.is_streaming());

        monitor.pause();
        settle().await;
        assert_eq!(source.releases(), 1);
        assert!(!source.is_streaming());

        monitor.start().expect("restart");
        settle().await;
        assert_eq!(source.acquisitions(), 2);
    }

    #[tokio::test]
    async fn monitor_reports_missing_device_on_start() {
        let source = MockAudioSource::new();
        source.set_failing(true);
        let (mut monitor, mut rx) = monitor_for(&source, VadConfig::default());

        monitor.start().expect("start");
        match rx.recv().await {
            Some(Event::Vad(VadEvent::Failed(VadError::Device(_)))) => {}
            other => panic!("expected a device failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn monitor_posts_speech_events() {
        let source = MockAudioSource::new();
        let mut cfg = VadConfig::default();
        cfg.smoothing_frames = 1;
        let (mut monitor, mut rx) = monitor_for(&source, cfg);

        monitor.start().expect("start");
        monitor.start().expect("second start is a no-op");
        settle().await;
        assert_eq!(source.acquisitions(), 1);
        assert_eq!(source.resumes(), 1);

        // 200 ms of loud audio at 44.1 kHz
        assert!(source.feed(vec![0.5; 8_820]));
        match rx.recv().await {
            Some(Event::Vad(VadEvent::SpeechStart)) => {}
            other => panic!("expected SpeechStart, got {other:?}"),
        }

        // Pausing mid-speech closes the segment.
        monitor.pause();
        match rx.recv().await {
            Some(Event::Vad(VadEvent::SpeechEnd { segment })) => assert!(!segment.is_empty()),
            other => panic!("expected SpeechEnd, got {other:?}"),
        }
    }
}
