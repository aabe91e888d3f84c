//! Sample buffer and the conversion-complete handler.
//!
//! # Handoff contract
//!
//! The completion handler is the only writer of sample slots and the only
//! context that *advances* the cursor. The foreground loop only reads the
//! slots once it has observed `cursor == capacity` with acquire ordering, and
//! the handler refuses to write at that point, so a full buffer is never
//! written while it is being read.
//!
//! The foreground may reset the cursor to 0 at any time (start, end of an
//! emission, trigger release). The handler publishes each advance with a
//! compare-exchange, so a reset that lands between the handler's load and its
//! store wins: the sample just written sits beyond the cursor and is never
//! read.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Samples per data frame.
pub const BUFFER_CAPACITY: usize = 400;

/// Fixed-capacity store of raw converter bytes plus a write cursor.
pub struct SampleBuffer {
    slots: [AtomicU8; BUFFER_CAPACITY],
    cursor: AtomicUsize,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU8::new(0)),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of samples accepted since the last reset.
    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= BUFFER_CAPACITY
    }

    /// Logically discard the contents. Slots are not cleared; the cursor
    /// gates visibility.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Append one sample. Returns `false` when the buffer is full (the sample
    /// is dropped) or when a concurrent reset discarded it.
    fn push(&self, sample: u8) -> bool {
        match self.stage(sample) {
            Some(at) => self.publish(at),
            None => false,
        }
    }

    /// Write `sample` into the slot at the cursor without advancing it.
    /// Returns the slot index, or `None` when the buffer is full.
    pub(crate) fn stage(&self, sample: u8) -> Option<usize> {
        let at = self.cursor.load(Ordering::Acquire);
        if at >= BUFFER_CAPACITY {
            return None;
        }
        self.slots[at].store(sample, Ordering::Relaxed);
        Some(at)
    }

    /// Advance the cursor past a staged slot, unless it moved since staging.
    pub(crate) fn publish(&self, at: usize) -> bool {
        self.cursor
            .compare_exchange(at, at + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Copy out a completed batch, in capture order.
    ///
    /// Returns `None` unless the cursor has reached capacity.
    pub fn take_full(&self) -> Option<[u8; BUFFER_CAPACITY]> {
        if !self.is_full() {
            return None;
        }
        Some(std::array::from_fn(|i| self.slots[i].load(Ordering::Relaxed)))
    }
}

/// State shared between the completion handler and the foreground loop.
///
/// `enabled` is written by the foreground (controller) and read by the
/// handler; `latch` mirrors the converter's result register and is read by
/// the trigger gate.
pub struct AcquisitionEngine {
    buffer: SampleBuffer,
    enabled: AtomicBool,
    latch: AtomicU8,
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AcquisitionEngine {
    pub fn new(enabled: bool) -> Self {
        Self {
            buffer: SampleBuffer::new(),
            enabled: AtomicBool::new(enabled),
            latch: AtomicU8::new(0),
        }
    }

    /// Conversion-complete handler. Never blocks, never allocates.
    ///
    /// Returns whether the sample was stored.
    pub fn on_conversion_complete(&self, sample: u8) -> bool {
        self.latch.store(sample, Ordering::Release);
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        self.buffer.push(sample)
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Most recent conversion result, whether or not it was buffered.
    pub fn latest_sample(&self) -> u8 {
        self.latch.load(Ordering::Acquire)
    }
}
