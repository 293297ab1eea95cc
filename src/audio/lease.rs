//! Audio leases
//!
//! A lease is the exclusive, revocable right to use one physical audio device
//! for one purpose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Physical audio devices arbitrated by the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioDevice {
    Microphone,
    Speaker,
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioDevice::Microphone => write!(f, "microphone"),
            AudioDevice::Speaker => write!(f, "speaker"),
        }
    }
}

/// What a lease holder is using the device for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    LiveStream,
    Record,
    TestTone,
    Playback,
    MicTest,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Purpose::LiveStream => "live stream",
            Purpose::Record => "recording",
            Purpose::TestTone => "test tone",
            Purpose::Playback => "playback",
            Purpose::MicTest => "microphone test",
        };
        f.write_str(name)
    }
}

/// What to do when the device is already leased.
///
/// Chosen by each call site rather than globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with `ResourceBusy`
    Reject,
    /// Revoke the holder, give it `grace` to let go, then take the device
    Preempt { grace: Duration },
    /// Block until the holder releases, up to `timeout`
    Wait { timeout: Duration },
}

/// Exclusive right to one audio device.
///
/// Clones share the revocation flag, so a background thread can hold a clone
/// and notice when the lease is taken away.
#[derive(Debug, Clone)]
pub struct StreamLease {
    id: Uuid,
    device: AudioDevice,
    purpose: Purpose,
    acquired_at: DateTime<Utc>,
    revoked: Arc<AtomicBool>,
}

impl StreamLease {
    pub(crate) fn new(device: AudioDevice, purpose: Purpose) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            purpose,
            acquired_at: Utc::now(),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> AudioDevice {
        self.device
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Whether the multiplexer has taken the device away from this holder
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn info(&self) -> LeaseInfo {
        LeaseInfo {
            id: self.id,
            device: self.device,
            purpose: self.purpose,
            acquired_at: self.acquired_at,
        }
    }
}

/// Serializable view of a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    pub id: Uuid,
    pub device: AudioDevice,
    pub purpose: Purpose,
    pub acquired_at: DateTime<Utc>,
}
