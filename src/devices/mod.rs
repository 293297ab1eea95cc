//! Device discovery and selection

pub mod alsa;
pub mod registry;
pub mod source;
pub mod types;

pub use registry::{DeviceRegistry, DEFAULT_AUDIO_DEVICE};
pub use source::{DeviceSource, SystemDeviceSource};
pub use types::{CapabilityFlags, DeviceCandidate, DeviceKind, DeviceSelection};
