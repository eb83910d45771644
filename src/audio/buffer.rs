//! Fixed-capacity circular buffer holding the most recent audio samples.
//!
//! The VAD monitor keeps the last `pre_roll_ms` of audio here while it waits
//! for speech, so the segment reported at speech end also contains the
//! onset that was heard before the detector was confident.  Once full, new
//! samples overwrite the oldest ones.
//!
//! # Example
//!
//! ```rust
//! use voice_stream::audio::RingBuffer;
//!
//! let mut buf = RingBuffer::new(4);
//! buf.push_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
//! assert_eq!(buf.drain(), vec![2.0, 3.0, 4.0, 5.0]);
//! ```

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity circular buffer.
///
/// A capacity of zero is allowed and stores nothing, which is how a
/// `pre_roll_ms = 0` configuration disables the pre-roll.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buf: Vec<T>,
    /// Index of the *next* write position.
    head: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![T::default(); capacity],
            head: 0,
            len: 0,
        }
    }

    /// Create a buffer sized for `duration_ms` of mono audio at `sample_rate`.
    pub fn with_duration(duration_ms: u32, sample_rate: u32) -> Self {
        let capacity = (sample_rate as u64 * duration_ms as u64 / 1_000) as usize;
        Self::new(capacity)
    }

    /// Append `data`, overwriting the oldest items once full.
    pub fn push_slice(&mut self, data: &[T]) {
        let capacity = self.buf.len();
        if capacity == 0 {
            return;
        }

        // Only the last `capacity` items of a long slice can survive.
        let skip = data.len().saturating_sub(capacity);
        for &item in &data[skip..] {
            self.buf[self.head] = item;
            self.head = (self.head + 1) % capacity;
        }
        self.len = (self.len + data.len() - skip).min(capacity);
    }

    /// Remove and return all stored items, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let capacity = self.buf.len();
        let start = (self.head + capacity - self.len) % capacity.max(1);
        let out = (0..self.len)
            .map(|i| self.buf[(start + i) % capacity])
            .collect();
        self.clear();
        out
    }

    /// Discard all stored items.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of items the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
