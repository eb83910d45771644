//! Audio resampling and channel mixing utilities.
//!
//! Chunks are encoded as mono audio at the configured capture rate
//! (44.1 kHz by default), whatever the device actually delivers.  This module
//! provides the two conversion steps:
//!
//! 1. [`stereo_to_mono`]: downmix any number of interleaved channels to mono.
//! 2. [`StreamResampler`]: convert a continuous stream from the device rate to
//!    the target rate with `rubato`.
//!
//! The resampler keeps its state across device callbacks: input is buffered
//! until a full FFT block is available, the filter delay is trimmed from the
//! front, and [`StreamResampler::finish`] pads the last block so the total
//! output is exactly `input_len * target_rate / source_rate` samples.

use std::fmt;

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

/// Input frames per FFT block requested from `rubato` (rounded up by the
/// resampler to a size that suits the rate ratio).
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

// ---------------------------------------------------------------------------
// stereo_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// The output length is `samples.len() / channels`.
///
/// * If `channels == 1` the input slice is returned as an owned `Vec`.
/// * If `channels == 0` an empty vector is returned.
///
/// # Example
///
/// ```rust
/// use voice_stream::audio::stereo_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, -0.2]; // L R L R
/// let mono = stereo_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// ```
pub fn stereo_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// StreamResampler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ResamplerError {
    #[error("sample rates must be non-zero (got {source_rate} -> {target_rate} Hz)")]
    ZeroRate { source_rate: u32, target_rate: u32 },

    #[error("failed to create resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// Stateful mono resampler for one continuous stream.
///
/// ```rust
/// use voice_stream::audio::StreamResampler;
///
/// let mut resampler = StreamResampler::new(48_000, 44_100).unwrap();
/// let mut out = Vec::new();
/// for _ in 0..10 {
///     resampler.push(&[0.0_f32; 480], &mut out).unwrap(); // 10 ms callbacks
/// }
/// resampler.finish(&mut out).unwrap();
/// assert_eq!(out.len(), 4_410);
/// ```
pub struct StreamResampler {
    /// `None` when both rates are equal; samples then pass straight through.
    inner: Option<FftFixedIn<f32>>,
    source_rate: u32,
    target_rate: u32,
    in_buf: Vec<f32>,
    /// Output frames still to discard for the filter delay.
    skip: usize,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, ResamplerError> {
        if source_rate == 0 || target_rate == 0 {
            return Err(ResamplerError::ZeroRate {
                source_rate,
                target_rate,
            });
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(FftFixedIn::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                RESAMPLER_CHUNK_FRAMES,
                1,
                1,
            )?)
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());
        let capacity = inner.as_ref().map_or(0, |r| r.input_frames_max());

        Ok(Self {
            inner,
            source_rate,
            target_rate,
            in_buf: Vec::with_capacity(capacity),
            skip,
            consumed: 0,
            produced: 0,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Feed mono samples; whatever output is ready is appended to `out`.
    pub fn push(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<(), ResamplerError> {
        self.consumed += samples.len() as u64;
        if self.inner.is_none() {
            out.extend_from_slice(samples);
            self.produced += samples.len() as u64;
            return Ok(());
        }

        self.in_buf.extend_from_slice(samples);
        while let Some(block) = self.process_ready()? {
            self.deliver(&block, out);
        }
        Ok(())
    }

    /// Flush the buffered input, zero-padding the last block, until the
    /// output matches the input duration.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> Result<(), ResamplerError> {
        let target = self.expected_output();
        while self.produced < target {
            let Some(need) = self.inner.as_ref().map(|r| r.input_frames_next()) else {
                break;
            };
            if self.in_buf.len() < need {
                self.in_buf.resize(need, 0.0);
            }
            match self.process_ready()? {
                Some(block) if !block.is_empty() => self.deliver(&block, out),
                _ => break,
            }
        }
        self.in_buf.clear();
        Ok(())
    }

    /// Output length matching everything consumed so far.
    fn expected_output(&self) -> u64 {
        let source = self.source_rate as u64;
        (self.consumed * self.target_rate as u64 + source / 2) / source
    }

    /// Run one FFT block if enough input is buffered.
    fn process_ready(&mut self) -> Result<Option<Vec<f32>>, ResamplerError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(None);
        };
        let need = resampler.input_frames_next();
        if self.in_buf.len() < need {
            return Ok(None);
        }
        let mut block = resampler.process(&[&self.in_buf[..need]], None)?;
        self.in_buf.drain(..need);
        Ok(block.pop())
    }

    fn deliver(&mut self, block: &[f32], out: &mut Vec<f32>) {
        let skipped = self.skip.min(block.len());
        self.skip -= skipped;
        let block = &block[skipped..];

        let room = self.expected_output().saturating_sub(self.produced) as usize;
        let take = block.len().min(room);
        out.extend_from_slice(&block[..take]);
        self.produced += take as u64;
    }
}

impl fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResampler")
            .field("source_rate", &self.source_rate)
            .field("target_rate", &self.target_rate)
            .field("buffered", &self.in_buf.len())
            .field("consumed", &self.consumed)
            .field("produced", &self.produced)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
