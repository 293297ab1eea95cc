//! Core configuration
//!
//! One explicit configuration object is built at startup and handed to every
//! component. Timing constants are named millisecond fields so they can be
//! tuned from a JSON file without touching code.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::devices::DeviceKind;
use crate::utils::error::{AppError, AppResult};

/// Root configuration for the hardware core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub devices: DeviceConfig,
    pub serial: SerialConfig,
    pub capture: CaptureConfig,
    pub audio: AudioConfig,
    pub recorder: RecorderConfig,
}

/// Device discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Explicit camera path (`AV_CAMERA`)
    pub camera_override: Option<String>,
    /// Explicit ALSA capture device (`AV_MIC`)
    pub microphone_override: Option<String>,
    /// Explicit ALSA playback device (`AV_SPK`)
    pub speaker_override: Option<String>,
    /// Explicit motor controller port (`AV_MOTOR`)
    pub serial_override: Option<String>,

    /// Video nodes tried when nothing else is known
    pub camera_fallbacks: Vec<String>,
    /// Serial ports tried by the motor channel after the selected one
    pub serial_fallbacks: Vec<String>,

    /// Name fragments that mark a preferred capture device
    pub microphone_keywords: Vec<String>,
    /// Name fragments that mark a preferred playback device
    pub speaker_keywords: Vec<String>,
    /// Name fragments that mark a preferred camera
    pub camera_keywords: Vec<String>,

    /// Upper bound for `arecord -l` / `aplay -l`
    pub listing_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            camera_override: None,
            microphone_override: None,
            speaker_override: None,
            serial_override: None,
            camera_fallbacks: (0..4).map(|i| format!("/dev/video{}", i)).collect(),
            serial_fallbacks: default_serial_fallbacks(),
            microphone_keywords: vec!["usb".into()],
            speaker_keywords: vec!["usb".into(), "uac".into()],
            camera_keywords: vec!["usb".into()],
            listing_timeout_ms: 10_000,
        }
    }
}

fn default_serial_fallbacks() -> Vec<String> {
    let usb = (0..3).map(|i| format!("/dev/ttyUSB{}", i));
    let acm = (0..3).map(|i| format!("/dev/ttyACM{}", i));
    let ama = (0..2).map(|i| format!("/dev/ttyAMA{}", i));
    usb.chain(acm).chain(ama).collect()
}

impl DeviceConfig {
    /// Override value configured for a device kind, if any
    pub fn override_for(&self, kind: DeviceKind) -> Option<&str> {
        let value = match kind {
            DeviceKind::Camera => &self.camera_override,
            DeviceKind::Microphone => &self.microphone_override,
            DeviceKind::Speaker => &self.speaker_override,
            DeviceKind::SerialPort => &self.serial_override,
        };
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// Keywords that raise a candidate's rank for a device kind
    pub fn keywords_for(&self, kind: DeviceKind) -> &[String] {
        match kind {
            DeviceKind::Camera => &self.camera_keywords,
            DeviceKind::Microphone => &self.microphone_keywords,
            DeviceKind::Speaker => &self.speaker_keywords,
            DeviceKind::SerialPort => &[],
        }
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }
}

/// Motor controller link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Delay after opening a port before the controller accepts commands
    pub settle_delay_ms: u64,
    /// How long a discovery probe collects replies
    pub probe_window_ms: u64,
    /// How long `send` waits for a reply line
    pub command_timeout_ms: u64,
    /// Minimum gap between two consecutive commands
    pub min_command_spacing_ms: u64,
    /// Symmetric PWM bound applied to motor values
    pub max_pwm: i32,
    /// Speed used when a direction command carries none
    pub default_speed: i32,
    /// Voltage reported as 0 %
    pub battery_empty_volts: f64,
    /// Voltage reported as 100 %
    pub battery_full_volts: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            settle_delay_ms: 1500,
            probe_window_ms: 1000,
            command_timeout_ms: 1000,
            min_command_spacing_ms: 50,
            max_pwm: 255,
            default_speed: 150,
            battery_empty_volts: 10.0,
            battery_full_volts: 12.6,
        }
    }
}

impl SerialConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn min_command_spacing(&self) -> Duration {
        Duration::from_millis(self.min_command_spacing_ms)
    }
}

/// A named camera mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPreset {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl ResolutionPreset {
    /// Resolve a preset name (`480p`, `720p`, `1080p`)
    pub fn from_name(name: &str) -> AppResult<Self> {
        let preset = match name {
            "480p" => Self { width: 640, height: 480, fps: 30 },
            "720p" => Self { width: 1280, height: 720, fps: 15 },
            "1080p" => Self { width: 1920, height: 1080, fps: 10 },
            other => {
                return Err(AppError::InvalidArgument(format!(
                    "unknown resolution preset '{}'",
                    other
                )))
            }
        };
        Ok(preset)
    }

    /// Preset name for a known mode, `WxH@fps` otherwise
    pub fn name(&self) -> String {
        match (self.width, self.height, self.fps) {
            (640, 480, 30) => "480p".into(),
            (1280, 720, 15) => "720p".into(),
            (1920, 1080, 10) => "1080p".into(),
            (w, h, fps) => format!("{}x{}@{}", w, h, fps),
        }
    }
}

/// Frame bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Preset used at startup
    pub resolution: String,
    /// JPEG quality for the live stream and snapshots
    pub jpeg_quality: u8,
    /// Consecutive read failures before the camera is reopened
    pub failure_threshold: u32,
    /// Pause before reopening the camera
    pub reinit_delay_ms: u64,
    /// How long `set_resolution` waits for the producer to apply a change
    pub reconfigure_timeout_ms: u64,
    /// Directory for snapshot JPEGs
    pub snapshot_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: "720p".into(),
            jpeg_quality: 85,
            failure_threshold: 5,
            reinit_delay_ms: 1000,
            reconfigure_timeout_ms: 5000,
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

impl CaptureConfig {
    pub fn reinit_delay(&self) -> Duration {
        Duration::from_millis(self.reinit_delay_ms)
    }

    pub fn reconfigure_timeout(&self) -> Duration {
        Duration::from_millis(self.reconfigure_timeout_ms)
    }
}

/// Stream multiplexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConfig {
    /// Minimum wait after a failed device open before trying again
    pub backoff_ms: u64,
    /// How long a preempted holder gets to release its lease
    pub preempt_grace_ms: u64,
    /// Upper bound for device test probes and microphone tests
    pub device_test_timeout_ms: u64,
    /// Upper bound for playing one sound effect
    pub playback_timeout_ms: u64,
    /// Length of the microphone test recording
    pub mic_test_seconds: u32,
    /// Recordings smaller than this are treated as silent
    pub mic_test_min_bytes: u64,
    pub sample_rate: u32,
    /// Bytes per read from the live capture process
    pub chunk_size: usize,
    /// Consecutive empty reads before the live capture gives up
    pub max_empty_reads: u32,
    /// Directory searched for sound effects
    pub sounds_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 1000,
            preempt_grace_ms: 2000,
            device_test_timeout_ms: 3000,
            playback_timeout_ms: 10_000,
            mic_test_seconds: 2,
            mic_test_min_bytes: 1000,
            sample_rate: 44_100,
            chunk_size: 8192,
            max_empty_reads: 50,
            sounds_dir: PathBuf::from("sounds"),
        }
    }
}

impl AudioConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn preempt_grace(&self) -> Duration {
        Duration::from_millis(self.preempt_grace_ms)
    }

    pub fn device_test_timeout(&self) -> Duration {
        Duration::from_millis(self.device_test_timeout_ms)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_timeout_ms)
    }
}

/// Recording session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Directory for finished recordings
    pub output_dir: PathBuf,
    /// Audio bitrate when the caller passes none
    pub default_audio_bitrate: String,
    /// Encoder grace period after its input closes
    pub stop_grace_ms: u64,
    /// Bounded join for the writer thread
    pub writer_join_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            default_audio_bitrate: "96k".into(),
            stop_grace_ms: 5000,
            writer_join_timeout_ms: 2000,
        }
    }
}

impl RecorderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn writer_join_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_join_timeout_ms)
    }
}

impl CoreConfig {
    /// Load configuration from an optional JSON file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `AV_CAMERA`, `AV_MIC`, `AV_SPK` and `AV_MOTOR` from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply device overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let slots = [
            ("AV_CAMERA", &mut self.devices.camera_override),
            ("AV_MIC", &mut self.devices.microphone_override),
            ("AV_SPK", &mut self.devices.speaker_override),
            ("AV_MOTOR", &mut self.devices.serial_override),
        ];
        for (key, slot) in slots {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                tracing::info!("Override {}={}", key, value);
                *slot = Some(value);
            }
        }
    }

    /// Startup resolution, falling back to 720p on an unknown name
    pub fn initial_resolution(&self) -> ResolutionPreset {
        ResolutionPreset::from_name(&self.capture.resolution).unwrap_or_else(|e| {
            tracing::warn!("{}, using 720p", e);
            ResolutionPreset {
                width: 1280,
                height: 720,
                fps: 15,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.min_command_spacing(), Duration::from_millis(50));
        assert_eq!(config.capture.jpeg_quality, 85);
        assert_eq!(config.devices.serial_fallbacks.len(), 8);
        assert_eq!(config.devices.camera_fallbacks[3], "/dev/video3");
        assert_eq!(config.recorder.default_audio_bitrate, "96k");
    }

    #[test]
    fn test_resolution_presets() {
        let p = ResolutionPreset::from_name("1080p").unwrap();
        assert_eq!((p.width, p.height, p.fps), (1920, 1080, 10));
        assert!(matches!(
            ResolutionPreset::from_name("4k"),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [("AV_MOTOR", "/dev/ttyACM1"), ("AV_MIC", "  ")]
            .into_iter()
            .collect();
        let mut config = CoreConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.devices.override_for(DeviceKind::SerialPort), Some("/dev/ttyACM1"));
        assert_eq!(config.devices.override_for(DeviceKind::Microphone), None);
    }

    #[test]
    fn test_load_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(&path, r#"{"serial": {"baudRate": 9600}, "capture": {"resolution": "480p"}}"#)
            .unwrap();

        let config = CoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.settle_delay_ms, 1500);
        assert_eq!(config.initial_resolution().fps, 30);
    }

    #[test]
    fn test_unknown_resolution_falls_back() {
        let mut config = CoreConfig::default();
        config.capture.resolution = "potato".into();
        assert_eq!(config.initial_resolution().width, 1280);
    }
}
