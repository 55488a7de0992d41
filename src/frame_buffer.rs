use crate::types::Frame;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Most recent decoded preview frame. Readers always get a copy.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    latest: Mutex<Option<Frame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffered frame. Timestamps never move backwards.
    pub fn store(&self, mut frame: Frame) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = latest.as_ref() {
            if frame.captured_at < previous.captured_at {
                frame.captured_at = previous.captured_at;
            }
        }
        *latest = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.captured_at)
    }

    pub fn age(&self) -> Option<Duration> {
        self.last_frame_at().map(|at| at.elapsed())
    }

    pub fn clear(&self) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
