pub mod capture_loop;
pub mod materialize;
pub mod session;
pub mod sink;
pub mod wait;

pub use capture_loop::{CaptureLoop, CaptureStats, LoopState, Termination};
pub use materialize::FrameBuffer;
pub use session::{CaptureParams, CaptureSession, FfmpegSession};
pub use sink::{FileSink, FrameSink};
pub use wait::{Backoff, CancelToken, SleepWaiter, Waiter};
