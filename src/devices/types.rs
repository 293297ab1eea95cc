//! Device registry types
//!
//! Candidates are produced by a scan and never mutated afterwards. A
//! [`DeviceSelection`] is the immutable snapshot that every other component
//! reads; a rescan builds a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Rank given to an explicit override. Short-circuits scanning.
pub const PRIORITY_OVERRIDE: u32 = 100;
/// Rank for a candidate whose name matches a preferred keyword
pub const PRIORITY_KEYWORD: u32 = 40;
/// Rank for a serial port that answered like the motor controller
pub const PRIORITY_RECOGNIZED: u32 = 30;
/// Rank for a device that answered a probe
pub const PRIORITY_RESPONDING: u32 = 20;
/// Rank for a device that was merely listed
pub const PRIORITY_DISCOVERED: u32 = 10;
/// Rank for the last-resort default device
pub const PRIORITY_FALLBACK: u32 = 0;

/// Physical device classes managed by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Camera,
    Microphone,
    Speaker,
    SerialPort,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::Camera,
        DeviceKind::Microphone,
        DeviceKind::Speaker,
        DeviceKind::SerialPort,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Microphone => "microphone",
            DeviceKind::Speaker => "speaker",
            DeviceKind::SerialPort => "motor",
        }
    }
}

/// What a probe learned about a candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    /// Came from an explicit override
    pub overridden: bool,
    /// Opened and produced data during probing
    pub responded: bool,
    /// Replied with motor controller telemetry
    pub recognized_controller: bool,
    /// Name matched a preferred keyword
    pub keyword_match: bool,
}

/// One discovered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCandidate {
    pub kind: DeviceKind,
    /// Path or device string used to open it (`/dev/video0`, `plughw:1,0`)
    pub path: String,
    /// Human readable name
    pub label: String,
    pub priority: u32,
    pub capabilities: CapabilityFlags,
    /// Position in the scan, used to break ties
    pub discovery_index: usize,
}

impl DeviceCandidate {
    pub fn new(kind: DeviceKind, path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            label: label.into(),
            priority: PRIORITY_DISCOVERED,
            capabilities: CapabilityFlags::default(),
            discovery_index: 0,
        }
    }

    /// Candidate built from an explicit override
    pub fn overridden(kind: DeviceKind, path: &str) -> Self {
        let mut candidate = Self::new(kind, path, format!("override: {}", path));
        candidate.priority = PRIORITY_OVERRIDE;
        candidate.capabilities.overridden = true;
        candidate
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Pick the best candidate.
///
/// Highest priority wins; among equal priorities the first discovered wins.
pub fn select_best(candidates: &[DeviceCandidate]) -> Option<DeviceCandidate> {
    let mut best: Option<&DeviceCandidate> = None;
    for candidate in candidates {
        let better = match best {
            None => true,
            Some(current) => {
                candidate.priority > current.priority
                    || (candidate.priority == current.priority
                        && candidate.discovery_index < current.discovery_index)
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best.cloned()
}

/// The chosen device per kind at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelection {
    pub camera: Option<DeviceCandidate>,
    pub microphone: Option<DeviceCandidate>,
    pub speaker: Option<DeviceCandidate>,
    pub serial_port: Option<DeviceCandidate>,
    pub scanned_at: DateTime<Utc>,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self {
            camera: None,
            microphone: None,
            speaker: None,
            serial_port: None,
            scanned_at: Utc::now(),
        }
    }
}

impl DeviceSelection {
    pub fn get(&self, kind: DeviceKind) -> Option<&DeviceCandidate> {
        match kind {
            DeviceKind::Camera => self.camera.as_ref(),
            DeviceKind::Microphone => self.microphone.as_ref(),
            DeviceKind::Speaker => self.speaker.as_ref(),
            DeviceKind::SerialPort => self.serial_port.as_ref(),
        }
    }

    pub(crate) fn set(&mut self, kind: DeviceKind, candidate: Option<DeviceCandidate>) {
        match kind {
            DeviceKind::Camera => self.camera = candidate,
            DeviceKind::Microphone => self.microphone = candidate,
            DeviceKind::Speaker => self.speaker = candidate,
            DeviceKind::SerialPort => self.serial_port = candidate,
        }
    }

    /// Path of the selected device, if any
    pub fn path(&self, kind: DeviceKind) -> Option<&str> {
        self.get(kind).map(|c| c.path.as_str())
    }

    /// Detection summary printed at startup
    pub fn summary(&self) -> String {
        let mut out = String::from("Device detection summary:\n");
        for kind in DeviceKind::ALL {
            let _ = match self.get(kind) {
                Some(c) => writeln!(
                    out,
                    "  {:<10} {} ({}, priority {})",
                    kind.label(),
                    c.path,
                    c.label,
                    c.priority
                ),
                None => writeln!(out, "  {:<10} none selected", kind.label()),
            };
        }
        out
    }
}
