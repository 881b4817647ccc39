// src/frame_buffer.rs

use crate::types::Frame;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Counters for the lifetime of the buffer. `pushed == popped + dropped + size`
/// holds at every observation point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameBufferStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

struct Inner {
    frames: VecDeque<Frame>,
    stats: FrameBufferStats,
    closed: bool,
}

/// Bounded drop-oldest frame queue between the capture thread and the
/// processing thread. The producer never blocks: when full, the oldest frame
/// is discarded so the consumer always sees the freshest available frames.
pub struct FrameBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                stats: FrameBufferStats::default(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a frame, discarding the oldest one when at capacity.
    /// Always succeeds; wakes at most one waiting consumer.
    pub fn push(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.frames.len() == self.capacity {
            inner.frames.pop_front();
            inner.stats.dropped += 1;
            debug!("frame buffer full, dropped oldest (total {})", inner.stats.dropped);
        }
        inner.frames.push_back(frame);
        inner.stats.pushed += 1;
        drop(inner);
        self.available.notify_one();
    }

    /// Non-blocking: oldest frame, or None when empty.
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.pop_front();
        if frame.is_some() {
            inner.stats.popped += 1;
        }
        frame
    }

    /// Block up to `timeout` for a frame. Returns None on timeout or when the
    /// buffer has been closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                inner.stats.popped += 1;
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if result.timed_out() && inner.frames.is_empty() {
                return None;
            }
        }
    }

    /// Non-destructive snapshot of the most recent frame.
    pub fn peek_latest(&self) -> Option<Frame> {
        let inner = self.inner.lock().unwrap();
        inner.frames.back().cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
    }

    /// Wake all waiters and make further `pop_timeout` calls return
    /// immediately once drained. Used on shutdown.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FrameBufferStats {
        self.inner.lock().unwrap().stats
    }
}
