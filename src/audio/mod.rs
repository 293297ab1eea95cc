//! Audio device arbitration
//!
//! The microphone and speaker are granted through [`StreamMultiplexer`]
//! leases. Live streaming, recording, tone playback and microphone tests are
//! all lease holders.

pub mod backend;
pub mod lease;
pub mod live;
pub mod multiplexer;
pub mod playback;

pub use backend::{AlsaBackend, AudioBackend};
pub use lease::{AudioDevice, ConflictPolicy, LeaseInfo, Purpose, StreamLease};
pub use live::{LiveAudio, LiveAudioClient, LiveAudioStatus};
pub use multiplexer::{DeviceLeaseStatus, StreamMultiplexer};
pub use playback::{AudioPlayer, MicTestResult, SoundOutcome};
