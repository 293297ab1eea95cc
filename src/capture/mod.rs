//! Live video capture
//!
//! The [`FrameBus`] owns the camera exclusively. Everything else (HTTP
//! viewers, snapshots, the recorder) reads copies of its latest frame.

pub mod bus;
pub mod frame;
pub mod placeholder;
pub mod source;
pub mod stream;

pub use bus::{CameraStatus, FrameBus};
pub use frame::Frame;
pub use source::{CameraOpener, FrameSource, NokhwaOpener};
pub use stream::FrameSubscription;
