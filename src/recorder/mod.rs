//! Recording system module
//!
//! - [`RecordingManager`] owns the session state machine and writer loop
//! - [`encoder`] wraps the ffmpeg process the frames are piped into

pub mod encoder;
pub mod manager;
pub mod state;

pub use encoder::{EncoderSink, EncoderSpawner, EncoderSpec, FfmpegSpawner};
pub use manager::RecordingManager;
pub use state::{RecordingEvent, RecordingMode, RecordingResult, RecordingState, RecordingStatus};
