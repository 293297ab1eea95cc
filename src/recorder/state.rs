//! Recording state management
//!
//! Defines the recording state machine and the status snapshot exposed to
//! callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current state of the recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    Idle,
    /// Acquiring audio and spawning the encoder
    Starting,
    /// Writer loop is feeding the encoder
    Recording,
    /// Writer stopped, waiting for the encoder to finish
    Stopping,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Whether the session captures the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    Full,
    VideoOnly,
}

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    /// Recording started, writing to the given file
    Started(PathBuf),
    /// Recording stopped
    Stopped(PathBuf),
    /// The session aborted
    Error(String),
}

/// Snapshot of the recording session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub mode: Option<RecordingMode>,
    pub output_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub frames_written: u64,
    pub elapsed_seconds: f64,
    pub audio_device: Option<String>,
    pub last_error: Option<String>,
}

impl RecordingStatus {
    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }
}

/// Result of a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingResult {
    pub output_path: PathBuf,
    pub mode: RecordingMode,
    pub frames_written: u64,
    pub duration_seconds: f64,
    /// Encoder exit code, `None` when it had to be killed
    pub encoder_exit_code: Option<i32>,
    /// Whether the output file exists (partial files are kept)
    pub file_exists: bool,
    /// Error that ended the session early, if any
    pub error: Option<String>,
}
