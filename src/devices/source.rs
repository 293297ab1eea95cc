//! Platform device enumeration and probing

use cpal::traits::{DeviceTrait, HostTrait};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use super::alsa::{self, AlsaDevice};
use crate::capture::CameraOpener;
use crate::config::{CoreConfig, ResolutionPreset};
use crate::serial::{probe_port, ProbeClass, SerialOpener};
use crate::utils::error::{AppError, AppResult};
use crate::utils::process::run_with_timeout;

/// Everything the registry needs from the operating system.
///
/// Probe methods return `Err` when the candidate should be dropped.
pub trait DeviceSource: Send + Sync {
    /// Video capture nodes, in discovery order
    fn camera_paths(&self) -> Vec<String>;

    /// Human readable camera name, if the platform knows one
    fn camera_label(&self, path: &str) -> Option<String>;

    /// Open the camera and read one frame
    fn probe_camera(&self, path: &str) -> AppResult<()>;

    /// Parsed `arecord -l`
    fn capture_devices(&self) -> AppResult<Vec<AlsaDevice>>;

    /// Parsed `aplay -l`
    fn playback_devices(&self) -> AppResult<Vec<AlsaDevice>>;

    /// Input or output device names from the audio host, used when listings fail
    fn host_audio_names(&self, input: bool) -> Vec<String>;

    /// Serial ports, in discovery order
    fn serial_paths(&self) -> Vec<String>;

    /// Probe one serial port
    fn probe_serial(&self, path: &str) -> AppResult<ProbeClass>;
}

/// [`DeviceSource`] for a Linux host
pub struct SystemDeviceSource {
    config: CoreConfig,
    camera: Arc<dyn CameraOpener>,
    serial: Arc<dyn SerialOpener>,
    dev_dir: std::path::PathBuf,
}

impl SystemDeviceSource {
    pub fn new(config: CoreConfig, camera: Arc<dyn CameraOpener>, serial: Arc<dyn SerialOpener>) -> Self {
        Self {
            config,
            camera,
            serial,
            dev_dir: "/dev".into(),
        }
    }

    /// Entries of `/dev` whose names start with one of `prefixes`, sorted per prefix
    fn dev_entries(&self, prefixes: &[&str]) -> Vec<String> {
        let names: Vec<String> = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", self.dev_dir, e);
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        for prefix in prefixes {
            let mut matching: Vec<&String> = names
                .iter()
                .filter(|n| {
                    n.strip_prefix(prefix)
                        .map_or(false, |rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                })
                .collect();
            matching.sort_by_key(|n| {
                n[prefix.len()..].parse::<u32>().unwrap_or(u32::MAX)
            });
            paths.extend(
                matching
                    .into_iter()
                    .map(|n| self.dev_dir.join(n).to_string_lossy().to_string()),
            );
        }
        paths
    }

    fn list_alsa(&self, tool: &str) -> AppResult<Vec<AlsaDevice>> {
        let output = run_with_timeout(
            Command::new(tool).arg("-l"),
            self.config.devices.listing_timeout(),
        )?;
        if !output.status.success() {
            return Err(AppError::DeviceNotFound(format!(
                "{} -l failed: {}",
                tool,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(alsa::parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl DeviceSource for SystemDeviceSource {
    fn camera_paths(&self) -> Vec<String> {
        self.dev_entries(&["video"])
    }

    fn camera_label(&self, path: &str) -> Option<String> {
        let node = Path::new(path).file_name()?;
        let name_file = Path::new("/sys/class/video4linux").join(node).join("name");
        std::fs::read_to_string(name_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn probe_camera(&self, path: &str) -> AppResult<()> {
        let mode = ResolutionPreset::from_name("480p")?;
        let mut source = self.camera.open(path, &mode)?;
        let frame = source.read_frame()?;
        if !frame.is_well_formed() {
            return Err(AppError::DeviceNotFound(format!("{} returned a malformed frame", path)));
        }
        Ok(())
    }

    fn capture_devices(&self) -> AppResult<Vec<AlsaDevice>> {
        self.list_alsa("arecord")
    }

    fn playback_devices(&self) -> AppResult<Vec<AlsaDevice>> {
        self.list_alsa("aplay")
    }

    fn host_audio_names(&self, input: bool) -> Vec<String> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        let devices = if input {
            host.input_devices().map(|d| d.collect::<Vec<_>>())
        } else {
            host.output_devices().map(|d| d.collect::<Vec<_>>())
        };
        match devices {
            Ok(devices) => {
                for device in devices {
                    if let Ok(name) = device.name() {
                        names.push(name);
                    }
                }
            }
            Err(e) => tracing::debug!("Audio host enumeration failed: {}", e),
        }
        names
    }

    fn serial_paths(&self) -> Vec<String> {
        self.dev_entries(&["ttyUSB", "ttyACM", "ttyAMA"])
    }

    fn probe_serial(&self, path: &str) -> AppResult<ProbeClass> {
        probe_port(self.serial.as_ref(), path, &self.config.serial)
    }
}
