//! Audio commands

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{AvatarCore, CommandResult};
use crate::audio::{
    AudioDevice, ConflictPolicy, DeviceLeaseStatus, LiveAudioClient, LiveAudioStatus,
    MicTestResult, Purpose, SoundOutcome, StreamLease,
};

/// Lease table and live stream state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStatus {
    pub leases: Vec<DeviceLeaseStatus>,
    pub live: LiveAudioStatus,
}

impl AvatarCore {
    /// Take a device for an explicit user action. Conflicts are rejected.
    pub fn acquire_audio(&self, device: AudioDevice, purpose: Purpose) -> CommandResult<StreamLease> {
        Ok(self.mux.acquire(device, purpose, ConflictPolicy::Reject)?)
    }

    /// Give a device back. Returns whether it was still held by this lease.
    pub fn release_audio(&self, lease: &StreamLease) -> CommandResult<bool> {
        Ok(self.mux.release(lease))
    }

    pub fn join_live_audio(&self) -> CommandResult<LiveAudioClient> {
        Ok(self.live.join()?)
    }

    pub fn leave_live_audio(&self, client: Uuid) -> CommandResult<()> {
        self.live.leave(client);
        Ok(())
    }

    pub fn play_tone(&self, frequency: u32, duration: Duration) -> CommandResult<()> {
        Ok(self.player.play_tone(frequency, duration)?)
    }

    pub fn play_sound(&self, sound_id: u32) -> CommandResult<SoundOutcome> {
        Ok(self.player.play_sound(sound_id)?)
    }

    pub fn mic_test(&self) -> CommandResult<MicTestResult> {
        Ok(self.player.mic_test()?)
    }

    pub fn audio_status(&self) -> AudioStatus {
        AudioStatus {
            leases: self.mux.status(),
            live: self.live.status(),
        }
    }
}
