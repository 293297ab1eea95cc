//! In-memory stand-ins for hardware and external tools

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::AudioBackend;
use crate::capture::{CameraOpener, Frame, FrameSource};
use crate::config::ResolutionPreset;
use crate::devices::alsa::AlsaDevice;
use crate::devices::DeviceSource;
use crate::recorder::{EncoderSink, EncoderSpawner, EncoderSpec};
use crate::serial::{ProbeClass, SerialLink, SerialOpener};
use crate::utils::error::{AppError, AppResult};
use crate::utils::process::ProcessExit;

// ---------------------------------------------------------------------------
// Serial

#[derive(Default)]
struct SerialWire {
    written: Vec<String>,
    broken: bool,
}

/// Serial link that answers commands by prefix
pub struct FakeSerialLink {
    replies: Vec<(String, String)>,
    pending: VecDeque<u8>,
    wire: Arc<Mutex<SerialWire>>,
}

impl FakeSerialLink {
    fn new(replies: &[(String, String)], wire: Arc<Mutex<SerialWire>>) -> Self {
        Self {
            replies: replies.to_vec(),
            pending: VecDeque::new(),
            wire,
        }
    }

    /// Each `(prefix, reply)` answers any written line starting with `prefix`
    pub fn with_replies(replies: Vec<(&str, &str)>) -> Self {
        let replies: Vec<(String, String)> = replies
            .into_iter()
            .map(|(p, r)| (p.to_string(), r.to_string()))
            .collect();
        Self::new(&replies, Arc::default())
    }

    /// A link that never answers
    pub fn silent() -> Self {
        Self::new(&[], Arc::default())
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
    }
}

impl SerialLink for FakeSerialLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut wire = self.wire.lock();
        if wire.broken {
            return Err(Self::broken_pipe());
        }
        wire.written.push(line.to_string());
        if let Some((_, reply)) = self.replies.iter().find(|(p, _)| line.starts_with(p.as_str())) {
            self.pending.extend(reply.bytes());
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.wire.lock().broken {
            return Err(Self::broken_pipe());
        }
        if self.pending.is_empty() {
            thread::sleep(Duration::from_millis(2));
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

/// Opener over a fixed set of fake ports sharing one written-lines log
#[derive(Clone, Default)]
pub struct FakeSerialOpener {
    ports: Arc<Mutex<HashMap<String, Vec<(String, String)>>>>,
    wire: Arc<Mutex<SerialWire>>,
}

impl FakeSerialOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(self, path: &str, replies: Vec<(&str, &str)>) -> Self {
        self.ports.lock().insert(
            path.to_string(),
            replies
                .into_iter()
                .map(|(p, r)| (p.to_string(), r.to_string()))
                .collect(),
        );
        self
    }

    /// Every line written to any port, in order
    pub fn written(&self) -> Vec<String> {
        self.wire.lock().written.clone()
    }

    /// Make opens, reads and writes fail as if the device was unplugged
    pub fn set_broken(&self, broken: bool) {
        self.wire.lock().broken = broken;
    }
}

impl SerialOpener for FakeSerialOpener {
    fn open(&self, path: &str, _baud_rate: u32) -> AppResult<Box<dyn SerialLink>> {
        if self.wire.lock().broken {
            return Err(AppError::Transport(format!("{} unplugged", path)));
        }
        let ports = self.ports.lock();
        let replies = ports
            .get(path)
            .ok_or_else(|| AppError::Transport(format!("no such port {}", path)))?;
        Ok(Box::new(FakeSerialLink::new(replies, self.wire.clone())))
    }

    fn exists(&self, path: &str) -> bool {
        self.ports.lock().contains_key(path)
    }
}

// ---------------------------------------------------------------------------
// Device enumeration

/// Scripted platform for the device registry
pub struct FakeDeviceSource {
    pub cameras: Vec<(String, bool)>,
    pub capture: Result<Vec<AlsaDevice>, String>,
    pub playback: Result<Vec<AlsaDevice>, String>,
    pub host_inputs: Vec<String>,
    pub host_outputs: Vec<String>,
    pub serials: Vec<(String, Result<ProbeClass, String>)>,
    pub serial_probes: AtomicUsize,
}

impl Default for FakeDeviceSource {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            capture: Ok(Vec::new()),
            playback: Ok(Vec::new()),
            host_inputs: Vec::new(),
            host_outputs: Vec::new(),
            serials: Vec::new(),
            serial_probes: AtomicUsize::new(0),
        }
    }
}

impl FakeDeviceSource {
    pub fn with_camera(mut self, path: &str, works: bool) -> Self {
        self.cameras.push((path.to_string(), works));
        self
    }

    pub fn with_serial(mut self, path: &str, probe: Result<ProbeClass, String>) -> Self {
        self.serials.push((path.to_string(), probe));
        self
    }

    pub fn serial_probe_count(&self) -> usize {
        self.serial_probes.load(Ordering::SeqCst)
    }
}

impl DeviceSource for FakeDeviceSource {
    fn camera_paths(&self) -> Vec<String> {
        self.cameras.iter().map(|(p, _)| p.clone()).collect()
    }

    fn camera_label(&self, _path: &str) -> Option<String> {
        None
    }

    fn probe_camera(&self, path: &str) -> AppResult<()> {
        match self.cameras.iter().find(|(p, _)| p == path) {
            Some((_, true)) => Ok(()),
            _ => Err(AppError::DeviceNotFound(format!("{} gave no frame", path))),
        }
    }

    fn capture_devices(&self) -> AppResult<Vec<AlsaDevice>> {
        self.capture.clone().map_err(AppError::Transport)
    }

    fn playback_devices(&self) -> AppResult<Vec<AlsaDevice>> {
        self.playback.clone().map_err(AppError::Transport)
    }

    fn host_audio_names(&self, input: bool) -> Vec<String> {
        if input {
            self.host_inputs.clone()
        } else {
            self.host_outputs.clone()
        }
    }

    fn serial_paths(&self) -> Vec<String> {
        self.serials.iter().map(|(p, _)| p.clone()).collect()
    }

    fn probe_serial(&self, path: &str) -> AppResult<ProbeClass> {
        self.serial_probes.fetch_add(1, Ordering::SeqCst);
        match self.serials.iter().find(|(p, _)| p == path) {
            Some((_, result)) => result.clone().map_err(AppError::Transport),
            None => Err(AppError::DeviceNotFound(path.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Camera

const FAKE_WIDTH: u32 = 32;
const FAKE_HEIGHT: u32 = 24;

#[derive(Default)]
struct CameraRig {
    /// Path to reads-before-failure (`None` never fails)
    cameras: HashMap<String, Option<u32>>,
    opens: HashMap<String, usize>,
    modes: HashMap<String, ResolutionPreset>,
}

/// Opener over scripted cameras producing small gradient frames
#[derive(Clone, Default)]
pub struct FakeCameraOpener {
    rig: Arc<Mutex<CameraRig>>,
    live: Arc<AtomicUsize>,
}

impl FakeCameraOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, path: &str) -> Self {
        self.rig.lock().cameras.insert(path.to_string(), None);
        self
    }

    /// A camera whose every handle fails after `reads_before_fail` frames
    pub fn with_failing_camera(self, path: &str, reads_before_fail: u32) -> Self {
        self.rig
            .lock()
            .cameras
            .insert(path.to_string(), Some(reads_before_fail));
        self
    }

    pub fn open_count(&self, path: &str) -> usize {
        self.rig.lock().opens.get(path).copied().unwrap_or(0)
    }

    pub fn last_mode(&self, path: &str) -> Option<ResolutionPreset> {
        self.rig.lock().modes.get(path).copied()
    }

    /// Open handles not yet dropped
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CameraOpener for FakeCameraOpener {
    fn open(&self, path: &str, mode: &ResolutionPreset) -> AppResult<Box<dyn FrameSource>> {
        let mut rig = self.rig.lock();
        let Some(reads_left) = rig.cameras.get(path).copied() else {
            return Err(AppError::DeviceNotFound(format!("no camera at {}", path)));
        };
        *rig.opens.entry(path.to_string()).or_default() += 1;
        rig.modes.insert(path.to_string(), *mode);

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeFrameSource {
            path: path.to_string(),
            reads_left,
            tick: 0,
            live: self.live.clone(),
        }))
    }
}

struct FakeFrameSource {
    path: String,
    reads_left: Option<u32>,
    tick: u8,
    live: Arc<AtomicUsize>,
}

impl FrameSource for FakeFrameSource {
    fn read_frame(&mut self) -> AppResult<Frame> {
        if let Some(left) = self.reads_left.as_mut() {
            if *left == 0 {
                return Err(AppError::Transport(format!("{} stopped responding", self.path)));
            }
            *left -= 1;
        }
        self.tick = self.tick.wrapping_add(1);
        let data = vec![self.tick; (FAKE_WIDTH * FAKE_HEIGHT * 3) as usize];
        Ok(Frame::new(FAKE_WIDTH, FAKE_HEIGHT, data))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

impl Drop for FakeFrameSource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Audio

#[derive(Clone, Copy, PartialEq, Eq)]
enum AudioScript {
    Streaming,
    FailingCapture,
    FailingProbe,
    StuckPlayback,
}

/// Audio backend running short shell processes instead of ALSA tools
#[derive(Clone)]
pub struct FakeAudioBackend {
    script: AudioScript,
    recording_bytes: usize,
    tones: Arc<Mutex<Vec<u32>>>,
}

impl FakeAudioBackend {
    fn scripted(script: AudioScript) -> Self {
        Self {
            script,
            recording_bytes: 4096,
            tones: Arc::default(),
        }
    }

    /// Every operation works; captures produce a steady stream of PCM
    pub fn streaming() -> Self {
        Self::scripted(AudioScript::Streaming)
    }

    /// The capture process cannot be started
    pub fn failing_capture() -> Self {
        Self::scripted(AudioScript::FailingCapture)
    }

    /// The device test before recording fails
    pub fn failing_probe() -> Self {
        Self::scripted(AudioScript::FailingProbe)
    }

    /// Playback processes never finish on their own
    pub fn stuck_playback() -> Self {
        Self::scripted(AudioScript::StuckPlayback)
    }

    /// Recordings come out `bytes` long
    pub fn recording(bytes: usize) -> Self {
        Self {
            recording_bytes: bytes,
            ..Self::streaming()
        }
    }

    /// Frequencies rendered so far
    pub fn tones(&self) -> Vec<u32> {
        self.tones.lock().clone()
    }

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }
}

impl AudioBackend for FakeAudioBackend {
    fn probe_capture(&self, device: &str, _timeout: Duration) -> AppResult<()> {
        if self.script == AudioScript::FailingProbe {
            return Err(AppError::ResourceBusy(format!("{} is busy", device)));
        }
        Ok(())
    }

    fn spawn_capture(&self, device: &str, _sample_rate: u32) -> AppResult<Child> {
        if self.script == AudioScript::FailingCapture {
            return Err(AppError::Transport(format!("{} failed: no such device", device)));
        }
        Ok(Self::shell("while :; do printf '%04096d' 0; sleep 0.05; done")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?)
    }

    fn spawn_playback(&self, _device: &str, wav: &Path) -> AppResult<Child> {
        let script = if self.script == AudioScript::StuckPlayback {
            "sleep 10"
        } else {
            "test -f \"$0\""
        };
        Ok(Self::shell(script)
            .arg(wav)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?)
    }

    fn spawn_recording(&self, _device: &str, _seconds: u32, output: &Path) -> AppResult<Child> {
        let script = format!("head -c {} /dev/zero > \"$0\"", self.recording_bytes);
        Ok(Self::shell(&script)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?)
    }

    fn render_tone(&self, frequency: u32, _duration: Duration, output: &Path) -> AppResult<()> {
        self.tones.lock().push(frequency);
        std::fs::write(output, b"RIFF tone")?;
        Ok(())
    }

    fn convert_to_wav(&self, input: &Path, output: &Path) -> AppResult<()> {
        std::fs::copy(input, output)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoder

/// Encoder that counts frames instead of running ffmpeg
#[derive(Default)]
pub struct FakeEncoder {
    frame_len: usize,
    frames: AtomicU64,
    /// Frames whose size did not match the spawn geometry
    misfits: AtomicU64,
    broken: AtomicBool,
    dead: AtomicBool,
    finished: AtomicBool,
}

impl EncoderSink for FakeEncoder {
    fn write_frame(&self, data: &[u8]) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) || self.dead.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder gone"));
        }
        if data.len() != self.frame_len {
            self.misfits.fetch_add(1, Ordering::SeqCst);
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.finished.load(Ordering::SeqCst)
    }

    fn finish(&self, _grace: Duration) -> ProcessExit {
        self.finished.store(true, Ordering::SeqCst);
        let code = if self.dead.load(Ordering::SeqCst) { 1 } else { 0 };
        ProcessExit {
            code: Some(code),
            forced: false,
        }
    }
}

#[derive(Default)]
struct SpawnerState {
    failing: bool,
    spawns: usize,
    last_spec: Option<EncoderSpec>,
    current: Option<Arc<FakeEncoder>>,
}

#[derive(Clone, Default)]
pub struct FakeEncoderSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeEncoderSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spawn fails
    pub fn failing() -> Self {
        let spawner = Self::default();
        spawner.state.lock().failing = true;
        spawner
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawns
    }

    pub fn last_spec(&self) -> Option<EncoderSpec> {
        self.state.lock().last_spec.clone()
    }

    fn current(&self) -> Option<Arc<FakeEncoder>> {
        self.state.lock().current.clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.current()
            .map_or(0, |e| e.frames.load(Ordering::SeqCst))
    }

    pub fn misfit_frames(&self) -> u64 {
        self.current()
            .map_or(0, |e| e.misfits.load(Ordering::SeqCst))
    }

    /// Close the current encoder's input as if ffmpeg crashed
    pub fn break_pipe(&self) {
        if let Some(encoder) = self.current() {
            encoder.broken.store(true, Ordering::SeqCst);
        }
    }

    /// The current encoder exits with status 1
    pub fn kill(&self) {
        if let Some(encoder) = self.current() {
            encoder.dead.store(true, Ordering::SeqCst);
        }
    }

    pub fn finished(&self) -> bool {
        self.current()
            .map_or(false, |e| e.finished.load(Ordering::SeqCst))
    }
}

impl EncoderSpawner for FakeEncoderSpawner {
    fn spawn(&self, spec: &EncoderSpec) -> AppResult<Arc<dyn EncoderSink>> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(AppError::Encoder("ffmpeg not found".into()));
        }
        state.spawns += 1;
        state.last_spec = Some(spec.clone());
        let encoder = Arc::new(FakeEncoder {
            frame_len: spec.frame_len(),
            ..FakeEncoder::default()
        });
        state.current = Some(encoder.clone());
        Ok(encoder)
    }
}
