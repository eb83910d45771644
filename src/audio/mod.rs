//! Audio side: microphone capture → chunk encoding, plus speech detection.
//!
//! # Pipeline
//!
//! ```text
//! CaptureSession ─acquire─▶ AudioSource (cpal, own thread per stream)
//!      │                         │
//!      │                  AudioChunk (mpsc)
//!      │                         ▼
//!      └──────────────▶ ChunkEncoder: stereo_to_mono → StreamResampler → i16 LE
//!                                │
//!                        Event::Capture(Chunk)  ──▶ coordinator queue
//!
//! VadMonitor ─own device─▶ SpeechDetector (RMS + smoothing + pre-roll)
//!                                │
//!                        Event::Vad(SpeechStart | SpeechEnd) ──▶ coordinator queue
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use voice_stream::audio::{AudioChunk, ChunkEncoder};
//!
//! let mut encoder = ChunkEncoder::new(44_100, 100);
//! let audio = AudioChunk { samples: vec![0.0; 4_410], sample_rate: 44_100, channels: 1 };
//! let chunks = encoder.push(&audio).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].len(), 8_820);
//! ```

pub mod buffer;
pub mod capture;
pub mod encoder;
pub mod resample;
pub mod session;
pub mod vad;

pub use buffer::RingBuffer;
pub use capture::{
    AudioChunk, AudioSource, CaptureConstraints, CaptureError, CpalSource, InputDevice, RawSink,
    StreamFormat,
};
pub use encoder::{Chunk, ChunkEncoder};
pub use resample::{stereo_to_mono, ResamplerError, StreamResampler};
pub use session::{CaptureEvent, CaptureSession, CaptureState};
pub use vad::{SpeechDetector, VadDetector, VadError, VadEvent, VadMonitor, VoiceActivity};
