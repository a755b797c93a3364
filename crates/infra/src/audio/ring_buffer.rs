//! Lock-free frame ring used as the virtual device's hardware buffer.
//!
//! Single producer (the stream's audio thread releasing rendered frames),
//! single consumer (the device's period ticker draining at the configured
//! rate). Positions are monotonically increasing byte counters, so full and
//! empty states need no sacrificial slot.
//!
//! Performance characteristics:
//! - Lock-free, wait-free for single producer/consumer
//! - Cache-padded counters to prevent false sharing between cores
//! - No allocations after construction

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free single-producer single-consumer ring of audio frames.
pub struct FrameRing {
    /// Byte storage; capacity is a power of 2 for mask-based indexing.
    storage: Box<[UnsafeCell<u8>]>,

    /// Bytes per frame (channel count times sample size).
    frame_bytes: usize,

    mask: usize,

    /// Total bytes ever written (producer-owned).
    write_pos: CachePadded<AtomicUsize>,

    /// Total bytes ever read (consumer-owned).
    read_pos: CachePadded<AtomicUsize>,
}

// SAFETY: the producer only writes bytes in [read_pos, write_pos + n) it has
// reserved, the consumer only reads bytes in [read_pos, write_pos); the
// Acquire/Release pairs on the positions order those accesses.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Ring holding at least `capacity_frames` frames of `frame_bytes`
    /// each. Byte capacity is rounded up to the next power of 2.
    pub fn new(capacity_frames: usize, frame_bytes: usize) -> Self {
        assert!(frame_bytes > 0, "frame size must be non-zero");
        let bytes = (capacity_frames.max(1) * frame_bytes).next_power_of_two();
        let storage = (0..bytes).map(|_| UnsafeCell::new(0)).collect();
        Self {
            storage,
            frame_bytes,
            mask: bytes - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn capacity_frames(&self) -> usize {
        self.storage.len() / self.frame_bytes
    }

    /// Frames the producer can currently push without overwriting.
    pub fn free_frames(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        (self.storage.len() - (write_pos - read_pos)) / self.frame_bytes
    }

    /// Frames the consumer can currently pop.
    pub fn filled_frames(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        (write_pos - read_pos) / self.frame_bytes
    }

    /// Push whole frames from `data` (producer side). `data` must be a
    /// multiple of the frame size. Returns the number of frames accepted;
    /// excess frames are dropped when the ring is full.
    pub fn push_frames(&self, data: &[u8]) -> usize {
        debug_assert_eq!(data.len() % self.frame_bytes, 0);
        let frames = (data.len() / self.frame_bytes).min(self.free_frames());
        let bytes = frames * self.frame_bytes;
        let write_pos = self.write_pos.load(Ordering::Acquire);

        for (i, &byte) in data[..bytes].iter().enumerate() {
            let index = (write_pos + i) & self.mask;
            // SAFETY: this span is unreachable by the consumer until the
            // Release store below publishes it.
            unsafe { *self.storage[index].get() = byte };
        }

        self.write_pos.store(write_pos + bytes, Ordering::Release);
        frames
    }

    /// Pop whole frames into `out` (consumer side). Returns the number of
    /// frames read.
    pub fn pop_frames(&self, out: &mut [u8]) -> usize {
        debug_assert_eq!(out.len() % self.frame_bytes, 0);
        let frames = (out.len() / self.frame_bytes).min(self.filled_frames());
        let bytes = frames * self.frame_bytes;
        let read_pos = self.read_pos.load(Ordering::Acquire);

        for (i, slot) in out[..bytes].iter_mut().enumerate() {
            let index = (read_pos + i) & self.mask;
            // SAFETY: everything below write_pos has been published by the
            // producer's Release store.
            *slot = unsafe { *self.storage[index].get() };
        }

        self.read_pos.store(read_pos + bytes, Ordering::Release);
        frames
    }

    /// Drop up to `frames` frames without copying them out (consumer side).
    pub fn discard_frames(&self, frames: usize) -> usize {
        let frames = frames.min(self.filled_frames());
        let read_pos = self.read_pos.load(Ordering::Acquire);
        self.read_pos
            .store(read_pos + frames * self.frame_bytes, Ordering::Release);
        frames
    }
}
