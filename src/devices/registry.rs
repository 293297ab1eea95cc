//! Device registry
//!
//! Scans every device kind, ranks the candidates and publishes the winners as
//! one immutable [`DeviceSelection`]. Readers get an `Arc` to the current
//! snapshot; a refresh swaps in a new one and never edits the old.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

use super::alsa::AlsaDevice;
use super::source::DeviceSource;
use super::types::{
    select_best, DeviceCandidate, DeviceKind, DeviceSelection, PRIORITY_DISCOVERED,
    PRIORITY_FALLBACK, PRIORITY_KEYWORD, PRIORITY_RECOGNIZED, PRIORITY_RESPONDING,
};
use crate::config::DeviceConfig;
use crate::serial::ProbeClass;

/// ALSA device used when nothing else is found
pub const DEFAULT_AUDIO_DEVICE: &str = "default";

fn matches_keyword(text: &str, keywords: &[String]) -> bool {
    let text = text.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
}

pub struct DeviceRegistry {
    config: DeviceConfig,
    source: Arc<dyn DeviceSource>,
    current: RwLock<Arc<DeviceSelection>>,
}

impl DeviceRegistry {
    /// Create a registry with an empty selection. Call [`Self::refresh`] to scan.
    pub fn new(config: DeviceConfig, source: Arc<dyn DeviceSource>) -> Self {
        Self {
            config,
            source,
            current: RwLock::new(Arc::new(DeviceSelection::default())),
        }
    }

    /// Current selection snapshot
    pub fn current(&self) -> Arc<DeviceSelection> {
        self.current.read().clone()
    }

    /// Scan every kind and swap in the new selection
    pub fn refresh(&self) -> Arc<DeviceSelection> {
        let selection = Arc::new(self.scan());
        *self.current.write() = selection.clone();
        tracing::info!("{}", selection.summary().trim_end());
        selection
    }

    /// Scan every kind without publishing the result
    pub fn scan(&self) -> DeviceSelection {
        let mut selection = DeviceSelection {
            scanned_at: Utc::now(),
            ..DeviceSelection::default()
        };
        for kind in DeviceKind::ALL {
            let candidates = self.candidates(kind);
            let best = select_best(&candidates);
            match &best {
                Some(c) => tracing::debug!(
                    "Selected {} {} (priority {}) from {} candidates",
                    kind.label(),
                    c.path,
                    c.priority,
                    candidates.len()
                ),
                None => tracing::warn!("No {} found", kind.label()),
            }
            selection.set(kind, best);
        }
        selection
    }

    /// Ranked candidates for one kind, in discovery order
    pub fn candidates(&self, kind: DeviceKind) -> Vec<DeviceCandidate> {
        if let Some(path) = self.config.override_for(kind) {
            tracing::info!("Using {} override {}", kind.label(), path);
            return vec![DeviceCandidate::overridden(kind, path)];
        }

        let mut candidates = match kind {
            DeviceKind::Camera => self.camera_candidates(),
            DeviceKind::Microphone | DeviceKind::Speaker => self.audio_candidates(kind),
            DeviceKind::SerialPort => self.serial_candidates(),
        };
        for (index, candidate) in candidates.iter_mut().enumerate() {
            candidate.discovery_index = index;
        }
        candidates
    }

    fn camera_candidates(&self) -> Vec<DeviceCandidate> {
        let keywords = self.config.keywords_for(DeviceKind::Camera);
        let mut candidates = Vec::new();

        for path in self.source.camera_paths() {
            if let Err(e) = self.source.probe_camera(&path) {
                tracing::debug!("Camera {} dropped: {}", path, e);
                continue;
            }
            let label = self.source.camera_label(&path).unwrap_or_else(|| path.clone());
            let mut candidate = DeviceCandidate::new(DeviceKind::Camera, &path, &label);
            candidate.capabilities.responded = true;
            candidate.priority = PRIORITY_RESPONDING;
            if matches_keyword(&label, keywords) {
                candidate.capabilities.keyword_match = true;
                candidate.priority = PRIORITY_KEYWORD;
            }
            candidates.push(candidate);
        }
        candidates
    }

    fn audio_candidates(&self, kind: DeviceKind) -> Vec<DeviceCandidate> {
        let keywords = self.config.keywords_for(kind);
        let input = kind == DeviceKind::Microphone;
        let listing = if input {
            self.source.capture_devices()
        } else {
            self.source.playback_devices()
        };

        let devices: Vec<AlsaDevice> = match listing {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("{} listing failed: {}", kind.label(), e);
                Vec::new()
            }
        };

        let mut candidates: Vec<DeviceCandidate> = devices
            .iter()
            .map(|device| {
                let mut candidate = DeviceCandidate::new(kind, device.plughw(), device.label());
                if device.matches_any(keywords) {
                    candidate.capabilities.keyword_match = true;
                    candidate.priority = PRIORITY_KEYWORD;
                }
                candidate
            })
            .collect();

        if candidates.is_empty() {
            for name in self.source.host_audio_names(input) {
                let mut candidate = DeviceCandidate::new(kind, &name, &name);
                if matches_keyword(&name, keywords) {
                    candidate.capabilities.keyword_match = true;
                    candidate.priority = PRIORITY_KEYWORD;
                }
                candidates.push(candidate);
            }
        }

        if candidates.is_empty() {
            candidates.push(
                DeviceCandidate::new(kind, DEFAULT_AUDIO_DEVICE, "ALSA default")
                    .with_priority(PRIORITY_FALLBACK),
            );
        }
        candidates
    }

    fn serial_candidates(&self) -> Vec<DeviceCandidate> {
        let mut candidates = Vec::new();
        for path in self.source.serial_paths() {
            let class = match self.source.probe_serial(&path) {
                Ok(class) => class,
                Err(e) => {
                    tracing::debug!("Serial port {} dropped: {}", path, e);
                    continue;
                }
            };

            let mut candidate = DeviceCandidate::new(DeviceKind::SerialPort, &path, &path);
            match class {
                ProbeClass::RecognizedController => {
                    candidate.capabilities.responded = true;
                    candidate.capabilities.recognized_controller = true;
                    candidate.priority = PRIORITY_RECOGNIZED;
                    candidate.label = format!("{} (motor controller)", path);
                }
                ProbeClass::Generic => {
                    candidate.capabilities.responded = true;
                    candidate.priority = PRIORITY_RESPONDING;
                }
                ProbeClass::Unknown => candidate.priority = PRIORITY_DISCOVERED,
            }
            candidates.push(candidate);
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::types::PRIORITY_OVERRIDE;
    use crate::testing::FakeDeviceSource;

    fn alsa(card: u32, name: &str) -> AlsaDevice {
        AlsaDevice {
            card,
            card_name: name.into(),
            device: 0,
            device_name: format!("{} Audio", name),
        }
    }

    #[test]
    fn test_override_short_circuits_probing() {
        let source = Arc::new(FakeDeviceSource::default().with_serial("/dev/ttyUSB0", Ok(ProbeClass::RecognizedController)));
        let config = DeviceConfig {
            serial_override: Some("/dev/ttyAMA0".into()),
            ..DeviceConfig::default()
        };
        let registry = DeviceRegistry::new(config, source.clone());

        let selection = registry.refresh();
        let motor = selection.serial_port.as_ref().unwrap();
        assert_eq!(motor.path, "/dev/ttyAMA0");
        assert_eq!(motor.priority, PRIORITY_OVERRIDE);
        assert_eq!(source.serial_probe_count(), 0);
    }

    #[test]
    fn test_usb_microphone_preferred_over_earlier_card() {
        let source = Arc::new(FakeDeviceSource {
            capture: Ok(vec![alsa(0, "bcm2835"), alsa(2, "USB PnP Sound Device")]),
            ..FakeDeviceSource::default()
        });
        let registry = DeviceRegistry::new(DeviceConfig::default(), source);

        let selection = registry.refresh();
        assert_eq!(selection.path(DeviceKind::Microphone), Some("plughw:2,0"));
    }

    #[test]
    fn test_listing_failure_falls_back_to_host_then_default() {
        let source = Arc::new(FakeDeviceSource {
            capture: Err("arecord missing".into()),
            host_inputs: vec!["sysdefault:CARD=Device".into()],
            playback: Err("aplay missing".into()),
            ..FakeDeviceSource::default()
        });
        let registry = DeviceRegistry::new(DeviceConfig::default(), source);

        let selection = registry.refresh();
        assert_eq!(selection.path(DeviceKind::Microphone), Some("sysdefault:CARD=Device"));
        let speaker = selection.speaker.as_ref().unwrap();
        assert_eq!(speaker.path, DEFAULT_AUDIO_DEVICE);
        assert_eq!(speaker.priority, PRIORITY_FALLBACK);
    }

    #[test]
    fn test_serial_ranking_and_dropped_probe_errors() {
        let source = Arc::new(
            FakeDeviceSource::default()
                .with_serial("/dev/ttyUSB0", Ok(ProbeClass::Unknown))
                .with_serial("/dev/ttyUSB1", Err("permission denied".into()))
                .with_serial("/dev/ttyACM0", Ok(ProbeClass::Generic))
                .with_serial("/dev/ttyAMA0", Ok(ProbeClass::RecognizedController)),
        );
        let registry = DeviceRegistry::new(DeviceConfig::default(), source);

        let candidates = registry.candidates(DeviceKind::SerialPort);
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.path != "/dev/ttyUSB1"));
        assert_eq!(
            select_best(&candidates).unwrap().path,
            "/dev/ttyAMA0"
        );
    }

    #[test]
    fn test_camera_probe_failure_yields_none() {
        let source = Arc::new(FakeDeviceSource::default().with_camera("/dev/video0", false));
        let registry = DeviceRegistry::new(DeviceConfig::default(), source);

        let selection = registry.refresh();
        assert!(selection.camera.is_none());
    }

    #[test]
    fn test_refresh_replaces_snapshot_without_mutating_old() {
        let source = Arc::new(FakeDeviceSource::default().with_camera("/dev/video1", true));
        let registry = DeviceRegistry::new(DeviceConfig::default(), source);

        let before = registry.current();
        assert!(before.camera.is_none());

        let after = registry.refresh();
        assert!(before.camera.is_none());
        assert_eq!(after.path(DeviceKind::Camera), Some("/dev/video1"));
        assert!(Arc::ptr_eq(&after, &registry.current()));
    }
}
