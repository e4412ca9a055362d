// src/frame_buffer.rs
//
// Bounded frame queue between the acquisition thread and the consumer.
//
// Policy: drop-oldest on overflow. The acquisition side must keep pace with
// the camera's native frame rate or RTSP buffering collapses upstream, while
// the consumer drains at detector speed. Evicting the oldest frame keeps
// memory bounded and latency low; a skipped frame is strictly better than
// unbounded latency growth for a live detection workload.

use crate::types::Frame;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct FrameQueue {
    inner: Mutex<VecDeque<Frame>>,
    available: Condvar,
    capacity: usize,
}

/// Outcome of a push, so the producer can keep its drop counter honest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The queue was full; exactly one oldest frame was evicted first.
    EvictedOldest,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame queue capacity must be at least 1");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Insert a frame, evicting the oldest entry if at capacity. Never
    /// blocks and never grows past `capacity`.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut queue = self.inner.lock().unwrap();
        let outcome = if queue.len() >= self.capacity {
            queue.pop_front();
            PushOutcome::EvictedOldest
        } else {
            PushOutcome::Stored
        };
        queue.push_back(frame);
        drop(queue);
        self.available.notify_one();
        outcome
    }

    /// Block up to `timeout` for a frame. Returns `None` on timeout. Frames
    /// come out in strict acquisition order.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let mut queue = self.inner.lock().unwrap();
        if queue.is_empty() {
            let (guard, result) = self
                .available
                .wait_timeout_while(queue, timeout, |q| q.is_empty())
                .unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all queued frames, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}
