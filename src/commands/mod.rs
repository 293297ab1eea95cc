//! Command surface for the web layer
//!
//! [`AvatarCore`] wires every component together and exposes the operations
//! the dashboard calls. Each operation returns `Result<T, ErrorResponse>`:
//! component failures become a code plus a human readable message and never
//! escape as a panic.
//!
//! Operations are grouped by concern in the submodules, each adding an
//! `impl AvatarCore` block.

pub mod audio;
pub mod camera;
pub mod devices;
pub mod motor;
pub mod recording;

use std::sync::Arc;

use crate::audio::{AlsaBackend, AudioBackend, AudioPlayer, LiveAudio, StreamMultiplexer};
use crate::capture::{CameraOpener, FrameBus, NokhwaOpener};
use crate::config::CoreConfig;
use crate::devices::{DeviceKind, DeviceRegistry, DeviceSource, SystemDeviceSource};
use crate::recorder::{EncoderSpawner, FfmpegSpawner, RecordingManager};
use crate::serial::{SerialChannel, SerialOpener, SerialPortOpener};
use crate::utils::error::{AppResult, ErrorResponse};

pub use motor::MotorResponse;

/// Result type of every command
pub type CommandResult<T> = Result<T, ErrorResponse>;

/// The external capabilities the core is built on
pub struct CorePorts {
    pub devices: Arc<dyn DeviceSource>,
    pub serial: Arc<dyn SerialOpener>,
    pub camera: Arc<dyn CameraOpener>,
    pub audio: Arc<dyn AudioBackend>,
    pub encoder: Arc<dyn EncoderSpawner>,
}

impl CorePorts {
    /// Real hardware: nokhwa cameras, `serialport`, ALSA tools and ffmpeg
    pub fn system(config: &CoreConfig) -> Self {
        let serial: Arc<dyn SerialOpener> = Arc::new(SerialPortOpener);
        let camera: Arc<dyn CameraOpener> = Arc::new(NokhwaOpener);
        Self {
            devices: Arc::new(SystemDeviceSource::new(
                config.clone(),
                camera.clone(),
                serial.clone(),
            )),
            serial,
            camera,
            audio: Arc::new(AlsaBackend),
            encoder: Arc::new(FfmpegSpawner),
        }
    }
}

/// The hardware core
pub struct AvatarCore {
    config: CoreConfig,
    registry: DeviceRegistry,
    serial: SerialChannel,
    bus: Arc<FrameBus>,
    mux: Arc<StreamMultiplexer>,
    live: LiveAudio,
    player: AudioPlayer,
    recorder: RecordingManager,
}

impl AvatarCore {
    /// Scan devices and start the core on real hardware
    pub fn new(config: CoreConfig) -> AppResult<Self> {
        let ports = CorePorts::system(&config);
        Self::with_ports(config, ports)
    }

    /// Start the core on the given capabilities
    pub fn with_ports(config: CoreConfig, ports: CorePorts) -> AppResult<Self> {
        tracing::info!("Starting avatar tank core v{}", env!("CARGO_PKG_VERSION"));

        let registry = DeviceRegistry::new(config.devices.clone(), ports.devices);
        let selection = registry.refresh();
        let path = |kind| selection.path(kind).map(String::from);

        let serial = SerialChannel::new(
            config.serial.clone(),
            ports.serial,
            path(DeviceKind::SerialPort),
            config.devices.serial_fallbacks.clone(),
        );

        let bus = Arc::new(FrameBus::start(
            config.capture.clone(),
            config.initial_resolution(),
            ports.camera,
            path(DeviceKind::Camera),
            config.devices.camera_fallbacks.clone(),
        )?);

        let mux = Arc::new(StreamMultiplexer::new(config.audio.backoff()));
        let microphone = path(DeviceKind::Microphone);
        let speaker = path(DeviceKind::Speaker);

        let live = LiveAudio::new(
            config.audio.clone(),
            mux.clone(),
            ports.audio.clone(),
            microphone.clone(),
        );
        let player = AudioPlayer::new(
            config.audio.clone(),
            mux.clone(),
            ports.audio.clone(),
            speaker,
            microphone.clone(),
        );
        let recorder = RecordingManager::new(
            config.recorder.clone(),
            config.audio.clone(),
            bus.clone(),
            mux.clone(),
            ports.audio,
            ports.encoder,
            microphone,
        );

        Ok(Self {
            config,
            registry,
            serial,
            bus,
            mux,
            live,
            player,
            recorder,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Stop recording, live audio and the frame bus, then close the motor link
    pub fn shutdown(&self) {
        tracing::info!("Shutting down avatar tank core");
        self.recorder.shutdown();
        self.live.stop();
        self.mux.release_all();
        self.bus.shutdown();
        self.serial.close();
        tracing::info!("Shutdown complete");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use crate::audio::AudioDevice;

    #[test]
    fn test_shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path(), Fakes::default());

        let lease = core
            .acquire_audio(AudioDevice::Speaker, crate::audio::Purpose::Playback)
            .unwrap();
        core.shutdown();

        assert!(lease.is_revoked());
        assert!(!core.camera_status().running);
        assert!(core.audio_status().leases.iter().all(|l| l.holder.is_none()));
    }
}
