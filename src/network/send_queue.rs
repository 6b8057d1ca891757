//! Outbound queue
//!
//! The writer-side queue shared by TCP and WebSocket connections. It counts
//! what has been queued but not yet written so that `push` can report
//! backpressure against the configured high-water marks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use crate::config::ConnectionConfig;
use crate::sync::MonitorQueue;

use super::SendStatus;

/// An outbound item with a byte length that counts toward the high-water mark
pub(crate) trait Payload {
    fn payload_len(&self) -> usize;
}

impl Payload for Bytes {
    fn payload_len(&self) -> usize {
        self.len()
    }
}

pub(crate) struct SendQueue<T> {
    queue: MonitorQueue<T>,

    /// Queued but not yet flushed to the socket
    pending_bytes: AtomicUsize,
    pending_frames: AtomicUsize,

    /// Backpressure thresholds (0 = disabled)
    high_water_bytes: AtomicUsize,
    high_water_frames: AtomicUsize,
}

impl<T: Payload> SendQueue<T> {
    pub(crate) fn new(config: &ConnectionConfig) -> Self {
        Self {
            queue: MonitorQueue::unbounded(),
            pending_bytes: AtomicUsize::new(0),
            pending_frames: AtomicUsize::new(0),
            high_water_bytes: AtomicUsize::new(config.high_water_bytes),
            high_water_frames: AtomicUsize::new(config.high_water_frames),
        }
    }

    /// Queue one item. Never blocks.
    pub(crate) fn push(&self, item: T) -> SendStatus {
        let len = item.payload_len();

        // Count before pushing so the writer never subtracts first
        let bytes = self.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;
        let frames = self.pending_frames.fetch_add(1, Ordering::AcqRel) + 1;

        if self.queue.push(item).is_err() {
            self.written(len, 1);
            return SendStatus::Dropped;
        }

        if self.above_high_water(bytes, frames) {
            SendStatus::Backpressure {
                pending_bytes: bytes,
                pending_frames: frames,
            }
        } else {
            SendStatus::Queued
        }
    }

    /// Next batch for the writer, `None` once closed and drained
    pub(crate) fn take_all(&self) -> Option<VecDeque<T>> {
        self.queue.take_all()
    }

    /// Record that `bytes` in `frames` items left the queue for the socket
    pub(crate) fn written(&self, bytes: usize, frames: usize) {
        self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.pending_frames.fetch_sub(frames, Ordering::AcqRel);
    }

    fn above_high_water(&self, bytes: usize, frames: usize) -> bool {
        let max_bytes = self.high_water_bytes.load(Ordering::Relaxed);
        let max_frames = self.high_water_frames.load(Ordering::Relaxed);
        (max_bytes > 0 && bytes > max_bytes) || (max_frames > 0 && frames > max_frames)
    }

    pub(crate) fn set_high_water_mark(&self, bytes: usize, frames: usize) {
        self.high_water_bytes.store(bytes, Ordering::Relaxed);
        self.high_water_frames.store(frames, Ordering::Relaxed);
    }

    /// Stop accepting items. True only for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        self.queue.close()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn pending_frames(&self) -> usize {
        self.pending_frames.load(Ordering::Acquire)
    }
}
