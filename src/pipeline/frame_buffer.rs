//! Single-slot mailbox for the most recent frame plus rolling statistics
//!
//! Latest frame wins: publishing replaces the slot unconditionally, nothing is
//! queued. The lock is held only while swapping the `Arc` or copying stats.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::window::FpsWindow;
use crate::capture::Frame;

/// Rolling ingestion statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub fps: f64,
    pub frame_count: u64,
    pub bytes_received: u64,
    /// Time from the end of the encoded frame arriving to the decoded frame being published
    pub latency_ms: f64,
}

struct Slot {
    frame: Option<Arc<Frame>>,
    stats: StreamStats,
    window: FpsWindow,
}

pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new(fps_window: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                frame: None,
                stats: StreamStats::default(),
                window: FpsWindow::new(fps_window),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current frame and fold it into the statistics.
    pub fn publish(&self, frame: Arc<Frame>, latency: Duration) -> StreamStats {
        let mut slot = self.lock();
        slot.stats.fps = slot.window.record(frame.timestamp);
        slot.stats.frame_count += 1;
        slot.stats.latency_ms = latency.as_secs_f64() * 1000.0;
        slot.frame = Some(frame);
        slot.stats
    }

    pub fn add_bytes(&self, n: usize) {
        self.lock().stats.bytes_received += n as u64;
    }

    /// The latest frame, or `None` before the first frame / after a reset
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.lock().stats
    }

    /// Drop the frame and zero every statistic.
    pub fn reset(&self) {
        let mut slot = self.lock();
        slot.frame = None;
        slot.stats = StreamStats::default();
        slot.window.reset();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(super::window::FPS_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::time::Instant;

    fn frame_at(at: Instant) -> Arc<Frame> {
        let mut frame = Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb24);
        frame.timestamp = at;
        Arc::new(frame)
    }

    #[test]
    fn latest_frame_wins() {
        let buffer = FrameBuffer::default();
        assert!(buffer.latest().is_none());
        let t = Instant::now();
        let first = frame_at(t);
        let second = frame_at(t + Duration::from_millis(10));
        buffer.publish(first, Duration::ZERO);
        buffer.publish(second.clone(), Duration::from_millis(3));
        assert!(Arc::ptr_eq(&buffer.latest().unwrap(), &second));
        let stats = buffer.stats();
        assert_eq!(stats.frame_count, 2);
        assert!((stats.fps - 100.0).abs() < 1e-6);
        assert!((stats.latency_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_frame_and_stats() {
        let buffer = FrameBuffer::default();
        buffer.add_bytes(4096);
        buffer.publish(frame_at(Instant::now()), Duration::ZERO);
        buffer.reset();
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.stats(), StreamStats::default());
    }

    #[test]
    fn thirty_frames_at_thirty_hz() {
        let buffer = FrameBuffer::default();
        let t0 = Instant::now();
        for i in 0..30u32 {
            buffer.publish(frame_at(t0 + Duration::from_secs_f64(i as f64 / 30.0)), Duration::ZERO);
        }
        let stats = buffer.stats();
        assert_eq!(stats.frame_count, 30);
        assert!((stats.fps - 30.0).abs() < 0.01);
    }
}
