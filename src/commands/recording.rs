//! Recording commands

use std::path::PathBuf;
use tokio::sync::broadcast;

use super::{AvatarCore, CommandResult};
use crate::recorder::{RecordingEvent, RecordingResult, RecordingStatus};

impl AvatarCore {
    /// Start recording, or return the running session's output path
    pub fn start_recording(&self, audio_bitrate: Option<&str>) -> CommandResult<PathBuf> {
        Ok(self.recorder.start(audio_bitrate)?)
    }

    /// Stop recording. `None` when nothing was recording.
    pub fn stop_recording(&self) -> CommandResult<Option<RecordingResult>> {
        Ok(self.recorder.stop()?)
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recorder.status()
    }

    pub fn subscribe_recording_events(&self) -> broadcast::Receiver<RecordingEvent> {
        self.recorder.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::audio::AudioDevice;
    use crate::recorder::{RecordingMode, RecordingState};

    #[test]
    fn test_start_twice_then_stop_releases_microphone() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path(), Fakes::default());

        let first = core.start_recording(None).unwrap();
        let second = core.start_recording(None).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(dir.path().join("recordings")));
        assert_eq!(core.recording_status().mode, Some(RecordingMode::Full));

        let result = core.stop_recording().unwrap().unwrap();
        assert_eq!(result.output_path, first);
        assert_eq!(core.recording_status().state, RecordingState::Idle);
        assert!(core
            .audio_status()
            .leases
            .iter()
            .find(|l| l.device == AudioDevice::Microphone)
            .unwrap()
            .holder
            .is_none());
        core.shutdown();
    }

    #[test]
    fn test_stop_when_idle_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path(), Fakes::default());
        assert!(core.stop_recording().unwrap().is_none());
        core.shutdown();
    }
}
