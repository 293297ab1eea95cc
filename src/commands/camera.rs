//! Camera commands

use std::path::PathBuf;

use super::{AvatarCore, CommandResult};
use crate::capture::{CameraStatus, FrameSubscription};
use crate::config::ResolutionPreset;

impl AvatarCore {
    /// New MJPEG stream. It never ends; without a camera it carries placeholders.
    pub fn subscribe_frames(&self) -> FrameSubscription {
        self.bus.subscribe()
    }

    /// Save the latest frame as a JPEG
    pub fn take_snapshot(&self) -> CommandResult<PathBuf> {
        Ok(self.bus.take_snapshot()?)
    }

    /// JPEG bytes of the latest frame
    pub fn snapshot_jpeg(&self) -> CommandResult<Vec<u8>> {
        Ok(self.bus.snapshot_jpeg()?)
    }

    pub fn set_resolution(&self, preset: &str) -> CommandResult<ResolutionPreset> {
        Ok(self.bus.set_resolution(preset)?)
    }

    pub fn camera_status(&self) -> CameraStatus {
        self.bus.status()
    }
}
