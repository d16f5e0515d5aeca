/// Rolling window assembler
///
/// Accumulates mono samples from arbitrarily sized capture blocks into a ring
/// buffer holding two classification windows, and hands out overlapping
/// snapshots of the most recent window.

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use std::ops::Deref;
use tracing::trace;

/// Mono audio sample, nominally in [-1.0, 1.0]
pub type AudioSample = f32;

/// Immutable snapshot of the most recent `window_samples` samples
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    samples: Vec<AudioSample>,
}

impl Window {
    pub fn as_slice(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn into_inner(self) -> Vec<AudioSample> {
        self.samples
    }
}

impl Deref for Window {
    type Target = [AudioSample];

    fn deref(&self) -> &Self::Target {
        &self.samples
    }
}

impl From<Vec<AudioSample>> for Window {
    fn from(samples: Vec<AudioSample>) -> Self {
        Self { samples }
    }
}

/// Fixed-capacity rolling buffer that yields classification windows
///
/// Not synchronized; the pipeline keeps it behind a single lock.
pub struct WindowAssembler {
    ring: HeapRb<AudioSample>,
    window_samples: usize,
    total_appended: u64,
}

impl WindowAssembler {
    /// Create an assembler for windows of `window_samples` samples
    ///
    /// The ring holds two windows so consecutive snapshots can overlap.
    pub fn new(window_samples: usize) -> Self {
        let window_samples = window_samples.max(1);
        let capacity = window_samples * 2;
        trace!("Creating window assembler: window={} capacity={}", window_samples, capacity);

        Self {
            ring: HeapRb::new(capacity),
            window_samples,
            total_appended: 0,
        }
    }

    /// Append samples, evicting the oldest ones once capacity is exceeded
    pub fn append(&mut self, samples: &[AudioSample]) {
        if samples.is_empty() {
            return;
        }

        // Only the newest `capacity` samples of an oversized block can survive.
        let capacity = self.capacity();
        let tail = &samples[samples.len().saturating_sub(capacity)..];
        self.ring.push_slice_overwrite(tail);
        self.total_appended += samples.len() as u64;

        trace!("Appended {} samples ({} buffered)", samples.len(), self.len());
    }

    /// Snapshot the most recent window, or `None` during cold start
    pub fn try_extract_window(&self) -> Option<Window> {
        let available = self.ring.occupied_len();
        if available < self.window_samples {
            return None;
        }

        let samples: Vec<AudioSample> = self
            .ring
            .iter()
            .skip(available - self.window_samples)
            .copied()
            .collect();

        Some(Window { samples })
    }

    /// Number of samples currently buffered
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    /// Total samples ever appended, including evicted ones
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    /// Drop all buffered samples
    pub fn clear(&mut self) {
        let occupied = self.ring.occupied_len();
        self.ring.skip(occupied);
        self.total_appended = 0;
    }
}
