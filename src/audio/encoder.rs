//! Chunk encoder: raw device buffers in, fixed-cadence binary chunks out.
//!
//! [`ChunkEncoder`] downmixes each device buffer to mono, resamples it to the
//! target rate and quantises it to 16-bit little-endian PCM.  Every time a
//! full chunk interval (100 ms by default) of audio has accumulated, one
//! [`Chunk`] is emitted.  Chunks carry a sequence number and a timestamp
//! relative to the start of the capture interval, both derived from the
//! sample count so they are exact regardless of callback jitter.
//!
//! The resampler is created on the first buffer (the device rate is only
//! known then) and lives for the whole interval, so callback boundaries never
//! add or lose samples.
//!
//! ```text
//! AudioChunk (interleaved f32 @ device rate)
//!   → stereo_to_mono → StreamResampler → i16 LE
//!   → pending ──every `samples_per_chunk`──▶ Chunk { seq, timestamp_ms, data }
//! ```

use super::capture::{AudioChunk, CaptureError};
use super::resample::{stereo_to_mono, StreamResampler};

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// One discrete unit of encoded audio, ready to be written to the channel as
/// an opaque binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk within its capture interval, starting at 0.
    pub seq: u64,
    /// Offset of the first sample from the start of the capture interval.
    pub timestamp_ms: u64,
    /// Encoded payload (16-bit LE mono PCM).
    pub data: Vec<u8>,
}

impl Chunk {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ChunkEncoder
// ---------------------------------------------------------------------------

/// Stateful encoder for one capture interval.
///
/// A fresh encoder is created every time the capture session enters
/// `Capturing`, so sequence numbers restart at zero for each interval.
#[derive(Debug)]
pub struct ChunkEncoder {
    target_rate: u32,
    samples_per_chunk: usize,
    resampler: Option<StreamResampler>,
    resampled: Vec<f32>,
    pending: Vec<i16>,
    next_seq: u64,
    emitted_samples: u64,
}

impl ChunkEncoder {
    /// Create an encoder producing `interval_ms` chunks at `target_rate` Hz.
    pub fn new(target_rate: u32, interval_ms: u64) -> Self {
        let samples_per_chunk = ((target_rate as u64 * interval_ms) / 1_000).max(1) as usize;
        Self {
            target_rate,
            samples_per_chunk,
            resampler: None,
            resampled: Vec::new(),
            pending: Vec::with_capacity(samples_per_chunk * 2),
            next_seq: 0,
            emitted_samples: 0,
        }
    }

    /// Number of mono samples carried by each full chunk.
    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    /// Feed one raw device buffer; returns every chunk it completed.
    pub fn push(&mut self, audio: &AudioChunk) -> Result<Vec<Chunk>, CaptureError> {
        let mono = stereo_to_mono(&audio.samples, audio.channels);
        let resampler = match &mut self.resampler {
            Some(resampler) => resampler,
            slot @ None => slot.insert(StreamResampler::new(audio.sample_rate, self.target_rate)?),
        };
        if resampler.source_rate() != audio.sample_rate {
            return Err(CaptureError::Stream(format!(
                "input rate changed from {} to {} Hz mid-interval",
                resampler.source_rate(),
                audio.sample_rate
            )));
        }

        self.resampled.clear();
        resampler.push(&mono, &mut self.resampled)?;
        self.pending.extend(self.resampled.iter().map(|&s| quantize(s)));
        Ok(self.drain_full_chunks())
    }

    /// Drain the resampler and emit everything left, the last chunk possibly
    /// partial.  Called when production stops.
    pub fn flush(&mut self) -> Result<Vec<Chunk>, CaptureError> {
        if let Some(resampler) = self.resampler.as_mut() {
            self.resampled.clear();
            resampler.finish(&mut self.resampled)?;
            self.pending.extend(self.resampled.iter().map(|&s| quantize(s)));
        }

        let mut out = self.drain_full_chunks();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            out.push(self.emit(&rest));
        }
        Ok(out)
    }

    fn drain_full_chunks(&mut self) -> Vec<Chunk> {
        let mut out = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let rest = self.pending.split_off(self.samples_per_chunk);
            let full = std::mem::replace(&mut self.pending, rest);
            out.push(self.emit(&full));
        }
        out
    }

    fn emit(&mut self, samples: &[i16]) -> Chunk {
        let chunk = Chunk {
            seq: self.next_seq,
            timestamp_ms: self.emitted_samples * 1_000 / self.target_rate.max(1) as u64,
            data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        };
        self.next_seq += 1;
        self.emitted_samples += samples.len() as u64;
        chunk
    }
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
