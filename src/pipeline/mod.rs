pub mod frame_buffer;
pub mod shutdown;
pub mod window;

pub use frame_buffer::{FrameBuffer, StreamStats};
pub use shutdown::{Shutdown, Worker};
pub use window::FpsWindow;
