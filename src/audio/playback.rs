//! Speaker playback and microphone tests
//!
//! Every operation here holds a lease for as long as its subprocess runs.
//! Conflicts are rejected rather than waited on: these are user actions and
//! should report "busy" immediately.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::backend::AudioBackend;
use super::lease::{AudioDevice, ConflictPolicy, Purpose, StreamLease};
use super::multiplexer::StreamMultiplexer;
use crate::config::AudioConfig;
use crate::utils::error::{AppError, AppResult};

/// Beep frequencies used when a sound effect file is missing
pub const BEEP_FREQUENCIES: [u32; 10] = [220, 262, 294, 330, 349, 392, 440, 494, 523, 587];
const BEEP_DURATION: Duration = Duration::from_millis(500);
const SOUND_EXTENSIONS: [&str; 7] = ["mp3", "wav", "ogg", "flac", "m4a", "aac", "opus"];

/// What `play_sound` ended up playing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SoundOutcome {
    File { name: String },
    Beep { frequency: u32 },
}

/// Result of a microphone test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicTestResult {
    pub device: String,
    pub bytes: u64,
    /// The recorded WAV file
    #[serde(skip)]
    pub wav: Vec<u8>,
}

/// Find the file for sound effect `sound_id` in `dir`.
///
/// Ids map onto `sound1`..`sound10` (also `1`..`10` and `Sound1`..`Sound10`).
pub fn find_sound_file(dir: &Path, sound_id: u32) -> Option<PathBuf> {
    let index = sound_id % 10 + 1;
    let stems = [
        format!("sound{}", index),
        format!("{}", index),
        format!("Sound{}", index),
    ];
    stems
        .iter()
        .flat_map(|stem| {
            SOUND_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{}.{}", stem, ext)))
        })
        .find(|path| path.is_file())
}

/// Fallback beep frequency for `sound_id`
pub fn beep_frequency(sound_id: u32) -> u32 {
    BEEP_FREQUENCIES[(sound_id % 10) as usize]
}

fn temp_wav() -> AppResult<tempfile::NamedTempFile> {
    Ok(tempfile::Builder::new()
        .prefix("avatar_tank_")
        .suffix(".wav")
        .tempfile()?)
}

pub struct AudioPlayer {
    config: AudioConfig,
    mux: Arc<StreamMultiplexer>,
    backend: Arc<dyn AudioBackend>,
    speaker: RwLock<Option<String>>,
    microphone: RwLock<Option<String>>,
}

impl AudioPlayer {
    pub fn new(
        config: AudioConfig,
        mux: Arc<StreamMultiplexer>,
        backend: Arc<dyn AudioBackend>,
        speaker: Option<String>,
        microphone: Option<String>,
    ) -> Self {
        Self {
            config,
            mux,
            backend,
            speaker: RwLock::new(speaker),
            microphone: RwLock::new(microphone),
        }
    }

    pub fn set_devices(&self, speaker: Option<String>, microphone: Option<String>) {
        *self.speaker.write() = speaker;
        *self.microphone.write() = microphone;
    }

    fn speaker(&self) -> AppResult<String> {
        self.speaker
            .read()
            .clone()
            .ok_or_else(|| AppError::DeviceNotFound("no speaker selected".into()))
    }

    fn microphone(&self) -> AppResult<String> {
        self.microphone
            .read()
            .clone()
            .ok_or_else(|| AppError::DeviceNotFound("no microphone selected".into()))
    }

    /// Run `body` while holding a lease, releasing it whatever happens
    fn with_lease<T, F>(&self, device: AudioDevice, purpose: Purpose, body: F) -> AppResult<T>
    where
        F: FnOnce(&StreamLease) -> AppResult<T>,
    {
        let lease = self.mux.acquire(device, purpose, ConflictPolicy::Reject)?;
        let result = body(&lease);
        self.mux.release(&lease);
        result
    }

    /// Play a WAV file on the speaker under `lease`, killing it after `timeout`
    fn play_wav(&self, lease: &StreamLease, speaker: &str, wav: &Path, timeout: Duration) -> AppResult<()> {
        let child = match self.backend.spawn_playback(speaker, wav) {
            Ok(child) => child,
            Err(e) => {
                self.mux.report_failure(lease, &e.to_string());
                return Err(e);
            }
        };
        self.mux.attach_process(lease, child)?;
        let status = self.mux.wait_process(lease, timeout)?;
        if !status.success() {
            return Err(AppError::Transport(format!(
                "playback on {} exited with {}",
                speaker, status
            )));
        }
        Ok(())
    }

    /// Play a sine tone on the speaker
    pub fn play_tone(&self, frequency: u32, duration: Duration) -> AppResult<()> {
        if !(20..=20_000).contains(&frequency) {
            return Err(AppError::InvalidArgument(format!(
                "tone frequency {} Hz out of range",
                frequency
            )));
        }
        let speaker = self.speaker()?;
        self.with_lease(AudioDevice::Speaker, Purpose::TestTone, |lease| {
            let wav = temp_wav()?;
            self.backend.render_tone(frequency, duration, wav.path())?;
            let timeout = duration + self.config.device_test_timeout();
            self.play_wav(lease, &speaker, wav.path(), timeout)?;
            tracing::info!("Played {} Hz tone on {}", frequency, speaker);
            Ok(())
        })
    }

    /// Play sound effect `sound_id`, beeping when no file exists for it
    pub fn play_sound(&self, sound_id: u32) -> AppResult<SoundOutcome> {
        let speaker = self.speaker()?;
        let file = find_sound_file(&self.config.sounds_dir, sound_id);

        self.with_lease(AudioDevice::Speaker, Purpose::Playback, |lease| {
            let wav = temp_wav()?;
            let outcome = match file {
                Some(path) => {
                    self.backend.convert_to_wav(&path, wav.path())?;
                    SoundOutcome::File {
                        name: path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default(),
                    }
                }
                None => {
                    let frequency = beep_frequency(sound_id);
                    self.backend.render_tone(frequency, BEEP_DURATION, wav.path())?;
                    SoundOutcome::Beep { frequency }
                }
            };
            self.play_wav(lease, &speaker, wav.path(), self.config.playback_timeout())?;
            tracing::info!("Played sound {}: {:?}", sound_id, outcome);
            Ok(outcome)
        })
    }

    /// Record a short clip from the microphone and return it
    pub fn mic_test(&self) -> AppResult<MicTestResult> {
        let microphone = self.microphone()?;
        let seconds = self.config.mic_test_seconds;

        self.with_lease(AudioDevice::Microphone, Purpose::MicTest, |lease| {
            let wav = temp_wav()?;
            let child = match self.backend.spawn_recording(&microphone, seconds, wav.path()) {
                Ok(child) => child,
                Err(e) => {
                    self.mux.report_failure(lease, &e.to_string());
                    return Err(e);
                }
            };
            self.mux.attach_process(lease, child)?;

            let timeout = Duration::from_secs(seconds as u64) + self.config.device_test_timeout();
            let status = self.mux.wait_process(lease, timeout)?;

            let data = std::fs::read(wav.path())?;
            let bytes = data.len() as u64;
            if !status.success() || bytes < self.config.mic_test_min_bytes {
                return Err(AppError::Transport(format!(
                    "microphone test on {} failed ({}, {} bytes)",
                    microphone, status, bytes
                )));
            }

            tracing::info!("Microphone test on {} recorded {} bytes", microphone, bytes);
            Ok(MicTestResult {
                device: microphone.clone(),
                bytes,
                wav: data,
            })
        })
    }
}
