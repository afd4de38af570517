//! Rolling inter-arrival window for frame rate estimation

use std::time::Instant;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Number of inter-arrival deltas the FPS estimate averages over
pub const FPS_WINDOW: usize = 30;

/// Fixed-capacity window of inter-arrival deltas, oldest evicted first
pub struct FpsWindow {
    deltas: HeapRb<f64>,
    last: Option<Instant>,
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            deltas: HeapRb::new(capacity.max(1)),
            last: None,
        }
    }

    /// Record a frame arrival and return the updated rate.
    pub fn record(&mut self, at: Instant) -> f64 {
        if let Some(prev) = self.last {
            let delta = at.saturating_duration_since(prev).as_secs_f64();
            self.deltas.push_overwrite(delta);
        }
        self.last = Some(at);
        self.fps()
    }

    /// `1 / mean(window)`, zero when the window is empty or the mean is zero
    pub fn fps(&self) -> f64 {
        let len = self.deltas.occupied_len();
        if len == 0 {
            return 0.0;
        }
        let mean = self.deltas.iter().sum::<f64>() / len as f64;
        if mean > 0.0 {
            1.0 / mean
        } else {
            0.0
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn reset(&mut self) {
        self.deltas.clear();
        self.last = None;
    }
}

impl Default for FpsWindow {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}
