//! ffmpeg recording encoder
//!
//! Raw RGB24 frames go to ffmpeg on stdin; when a microphone is available
//! ffmpeg opens it itself through ALSA and muxes both into one file.

use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::utils::error::{AppError, AppResult};
use crate::utils::process::{terminate, ProcessExit, StderrTail};

/// Lines of encoder stderr kept for error reports
const STDERR_TAIL: usize = 20;

/// Audio input for the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInput {
    pub device: String,
    pub bitrate: String,
}

/// What the encoder receives and where it writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub audio: Option<AudioInput>,
    pub output: PathBuf,
}

impl EncoderSpec {
    /// Bytes in one raw input frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// ffmpeg command line for this encoder
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("{}x{}", self.width, self.height));
        args.extend(["-r".to_string(), self.fps.to_string(), "-i".into(), "-".into()]);

        if let Some(audio) = &self.audio {
            args.extend(
                ["-f", "alsa", "-ar", "44100", "-ac", "1", "-i", audio.device.as_str()]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-crf",
                "23",
                "-pix_fmt",
                "yuv420p",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        if let Some(audio) = &self.audio {
            args.extend(
                ["-c:a", "aac", "-b:a", audio.bitrate.as_str(), "-ac", "1"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// A running encoder process
///
/// Methods take `&self` so the writer thread can feed frames while another
/// thread finishes the encoder.
pub trait EncoderSink: Send + Sync {
    /// Write one raw frame. `BrokenPipe` means the encoder went away.
    fn write_frame(&self, data: &[u8]) -> std::io::Result<()>;

    fn is_alive(&self) -> bool;

    /// Close the input, wait up to `grace`, then kill
    fn finish(&self, grace: Duration) -> ProcessExit;

    /// Recent diagnostic output
    fn diagnostics(&self) -> String {
        String::new()
    }
}

/// Starts encoder processes
pub trait EncoderSpawner: Send + Sync {
    fn spawn(&self, spec: &EncoderSpec) -> AppResult<Arc<dyn EncoderSink>>;
}

/// Spawns `ffmpeg`
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSpawner;

impl EncoderSpawner for FfmpegSpawner {
    fn spawn(&self, spec: &EncoderSpec) -> AppResult<Arc<dyn EncoderSink>> {
        Ok(Arc::new(FfmpegEncoder::spawn(spec)?))
    }
}

pub struct FfmpegEncoder {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    stderr_tail: StderrTail,
    output: PathBuf,
}

impl FfmpegEncoder {
    pub fn spawn(spec: &EncoderSpec) -> AppResult<Self> {
        if let Some(parent) = spec.output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut child = Command::new("ffmpeg")
            .args(spec.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::Encoder(format!("failed to start ffmpeg: {}", e)))?;

        let stdin = child.stdin.take();
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| StderrTail::drain(stderr, STDERR_TAIL, "ffmpeg recorder"))
            .unwrap_or_default();

        tracing::info!(
            "Started ffmpeg recorder: {}x{} @ {}fps, audio={}, output: {:?}",
            spec.width,
            spec.height,
            spec.fps,
            spec.audio.as_ref().map_or("none", |a| a.device.as_str()),
            spec.output
        );

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            stderr_tail,
            output: spec.output.clone(),
        })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl EncoderSink for FfmpegEncoder {
    fn write_frame(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.stdin.lock();
        match guard.as_mut() {
            Some(stdin) => stdin.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "encoder input closed",
            )),
        }
    }

    fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn finish(&self, grace: Duration) -> ProcessExit {
        // A writer stuck in a full pipe holds the stdin lock; killing the
        // process is what unblocks it.
        match self.stdin.try_lock_for(grace) {
            Some(mut stdin) => drop(stdin.take()),
            None => {
                tracing::warn!("Encoder input still busy after {:?}, killing", grace);
                let _ = self.child.lock().kill();
            }
        }

        let exit = terminate(&mut self.child.lock(), grace);
        if !exit.success() {
            tracing::warn!(
                "ffmpeg recorder exited with {:?} (forced={}): {}",
                exit.code,
                exit.forced,
                self.diagnostics()
            );
        } else {
            tracing::info!("ffmpeg recorder finished: {:?}", self.output);
        }
        exit
    }

    fn diagnostics(&self) -> String {
        self.stderr_tail.text()
    }
}
