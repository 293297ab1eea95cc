//! External audio tools
//!
//! Device I/O happens in ALSA command line tools and ffmpeg. Every subprocess
//! that opens a physical device is handed back to the caller so it can be
//! attached to a lease.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::utils::error::{AppError, AppResult};
use crate::utils::process::{run_with_timeout, StderrTail};

/// Time a freshly spawned capture gets to fail before it is considered running
const STARTUP_CHECK: Duration = Duration::from_millis(200);
/// Upper bound for offline conversions (tone rendering, decoding sound files)
const CONVERT_TIMEOUT: Duration = Duration::from_secs(15);
/// Capture stderr lines kept after startup
const CAPTURE_STDERR_LINES: usize = 10;

/// Audio device operations used by the multiplexer's clients
pub trait AudioBackend: Send + Sync {
    /// Open the capture device briefly to confirm it works
    fn probe_capture(&self, device: &str, timeout: Duration) -> AppResult<()>;

    /// Start a raw capture: mono s16le PCM at `sample_rate` on stdout
    fn spawn_capture(&self, device: &str, sample_rate: u32) -> AppResult<Child>;

    /// Start playing a WAV file on `device`
    fn spawn_playback(&self, device: &str, wav: &Path) -> AppResult<Child>;

    /// Start recording `seconds` of audio from `device` into a WAV file
    fn spawn_recording(&self, device: &str, seconds: u32, output: &Path) -> AppResult<Child>;

    /// Render a sine tone into a WAV file
    fn render_tone(&self, frequency: u32, duration: Duration, output: &Path) -> AppResult<()>;

    /// Decode any audio file into a WAV file
    fn convert_to_wav(&self, input: &Path, output: &Path) -> AppResult<()>;
}

/// Map a failed ALSA open to the error taxonomy
fn classify_device_error(device: &str, stderr: &str) -> AppError {
    let detail = stderr.trim();
    if detail.to_lowercase().contains("busy") {
        AppError::ResourceBusy(format!("{} is busy: {}", device, detail))
    } else {
        AppError::Transport(format!("{} failed: {}", device, detail))
    }
}

/// Return an error if the child exited within the startup window
fn ensure_running(mut child: Child, device: &str) -> AppResult<Child> {
    thread::sleep(STARTUP_CHECK);
    if let Some(status) = child.try_wait()? {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if stderr.trim().is_empty() {
            stderr = format!("exited with {}", status);
        }
        return Err(classify_device_error(device, &stderr));
    }
    Ok(child)
}

/// [`AudioBackend`] using `arecord`, `aplay` and `ffmpeg`
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl AlsaBackend {
    fn run_ffmpeg(args: &[&str]) -> AppResult<()> {
        let output = run_with_timeout(
            Command::new("ffmpeg").args(["-hide_banner", "-loglevel", "error", "-y"]).args(args),
            CONVERT_TIMEOUT,
        )?;
        if !output.status.success() {
            return Err(AppError::Encoder(format!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl AudioBackend for AlsaBackend {
    fn probe_capture(&self, device: &str, timeout: Duration) -> AppResult<()> {
        let output = run_with_timeout(
            Command::new("arecord").args(["-D", device, "-f", "cd", "-d", "1", "-q", "/dev/null"]),
            timeout,
        )?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_device_error(
                device,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn spawn_capture(&self, device: &str, sample_rate: u32) -> AppResult<Child> {
        let rate = sample_rate.to_string();
        let child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "alsa",
                "-i",
                device,
                "-acodec",
                "pcm_s16le",
                "-ar",
                &rate,
                "-ac",
                "1",
                "-af",
                "highpass=f=100,lowpass=f=7000",
                "-f",
                "s16le",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        tracing::info!("Started audio capture on {} ({} Hz mono)", device, sample_rate);
        let mut child = ensure_running(child, device)?;
        // ffmpeg keeps warning for as long as it runs
        if let Some(stderr) = child.stderr.take() {
            StderrTail::drain(stderr, CAPTURE_STDERR_LINES, format!("audio capture {}", device));
        }
        Ok(child)
    }

    fn spawn_playback(&self, device: &str, wav: &Path) -> AppResult<Child> {
        let child = Command::new("aplay")
            .args(["-q", "-D", device])
            .arg(wav)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }

    fn spawn_recording(&self, device: &str, seconds: u32, output: &Path) -> AppResult<Child> {
        let duration = seconds.to_string();
        let child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "warning",
                "-f",
                "alsa",
                "-i",
                device,
                "-t",
                &duration,
                "-ac",
                "1",
                "-ar",
                "44100",
                "-f",
                "wav",
                "-y",
            ])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    fn render_tone(&self, frequency: u32, duration: Duration, output: &Path) -> AppResult<()> {
        let source = format!(
            "sine=frequency={}:duration={:.2}",
            frequency,
            duration.as_secs_f64()
        );
        let output = output.to_string_lossy();
        Self::run_ffmpeg(&[
            "-f", "lavfi", "-i", &source, "-ar", "48000", "-ac", "2", "-f", "wav", "-acodec",
            "pcm_s16le", &output,
        ])
    }

    fn convert_to_wav(&self, input: &Path, output: &Path) -> AppResult<()> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        Self::run_ffmpeg(&[
            "-i", &input, "-ar", "48000", "-ac", "2", "-f", "wav", "-acodec", "pcm_s16le",
            &output,
        ])
    }
}
