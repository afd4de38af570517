use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use tracing::trace;

use super::status::StatusChange;
use crate::capture::Frame;

/// Consumer of a receiver's signals, fixed at construction.
///
/// Both methods run synchronously on the ingestion thread, one at a time and in
/// arrival order. Consumers that need another thread hop there themselves.
pub trait ReceiverListener: Send + Sync {
    fn on_status(&self, _change: &StatusChange) {}

    fn on_frame(&self, _frame: &Arc<Frame>) {}
}

/// Listener that ignores everything; `get_frame()` polling only
pub struct NoopListener;

impl ReceiverListener for NoopListener {}

/// Channel ends handed to the consumer of a `ChannelListener`
pub struct ReceiverEvents {
    pub status: Receiver<StatusChange>,
    pub frames: Receiver<Arc<Frame>>,
}

/// Forwards signals into flume channels.
///
/// Status changes are never dropped. Frames go through a bounded channel and
/// are dropped when the consumer falls behind.
pub struct ChannelListener {
    status: Sender<StatusChange>,
    frames: Sender<Arc<Frame>>,
}

impl ChannelListener {
    pub fn new(frame_capacity: usize) -> (Self, ReceiverEvents) {
        let (status_tx, status_rx) = flume::unbounded();
        let (frame_tx, frame_rx) = flume::bounded(frame_capacity.max(1));
        (
            Self {
                status: status_tx,
                frames: frame_tx,
            },
            ReceiverEvents {
                status: status_rx,
                frames: frame_rx,
            },
        )
    }
}

impl ReceiverListener for ChannelListener {
    fn on_status(&self, change: &StatusChange) {
        let _ = self.status.send(change.clone());
    }

    fn on_frame(&self, frame: &Arc<Frame>) {
        match self.frames.try_send(frame.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                trace!(sequence = frame.meta.sequence, "frame consumer behind, dropping");
                metrics::counter!("phonecam_frames_dropped").increment(1);
            }
        }
    }
}
