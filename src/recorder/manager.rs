//! Recording session manager
//!
//! Drives one ffmpeg process fed from the frame bus. The manager never opens
//! the camera; a writer thread copies the bus's latest frame into the encoder
//! at the capture frame rate. The microphone is taken through a `Record`
//! lease, preempting a live stream if needed; without it the session runs
//! video-only.
//!
//! Start and stop are serialized by the session lock. The writer thread never
//! takes that lock: it reports failures through [`SessionShared`] only.

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use super::encoder::{AudioInput, EncoderSink, EncoderSpawner, EncoderSpec};
use super::state::{RecordingEvent, RecordingMode, RecordingResult, RecordingState, RecordingStatus};
use crate::audio::{AudioBackend, AudioDevice, ConflictPolicy, Purpose, StreamLease, StreamMultiplexer};
use crate::capture::FrameBus;
use crate::config::{AudioConfig, RecorderConfig};
use crate::utils::error::AppResult;
use crate::utils::worker::{CancelToken, Ticker, Worker};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session fields shared with the writer thread
#[derive(Default)]
struct SessionShared {
    state: RwLock<RecordingState>,
    frames_written: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl SessionShared {
    fn state(&self) -> RecordingState {
        *self.state.read()
    }

    fn set_state(&self, state: RecordingState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!("Recording state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }
}

struct ActiveSession {
    output: PathBuf,
    mode: RecordingMode,
    audio_device: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    encoder: Arc<dyn EncoderSink>,
    lease: Option<StreamLease>,
    writer: Worker,
}

/// Everything the writer loop needs
struct WriterContext {
    bus: Arc<FrameBus>,
    encoder: Arc<dyn EncoderSink>,
    shared: Arc<SessionShared>,
    mux: Arc<StreamMultiplexer>,
    lease: Option<StreamLease>,
    events: broadcast::Sender<RecordingEvent>,
    width: u32,
    height: u32,
    fps: u32,
}

fn write_loop(ctx: WriterContext, token: CancelToken) {
    let mut ticker = Ticker::from_fps(ctx.fps);
    let mut skipped: u64 = 0;
    let mut source_size = (0, 0);

    while ticker.wait(&token) {
        let frame = ctx.bus.latest_frame();
        if (frame.width, frame.height) != source_size {
            source_size = (frame.width, frame.height);
            if source_size != (ctx.width, ctx.height) {
                tracing::info!(
                    "Bus frames are {}x{}, scaling to {}x{} for the encoder",
                    frame.width,
                    frame.height,
                    ctx.width,
                    ctx.height
                );
            }
        }

        // The camera can come up, drop to the placeholder or change mode mid-recording
        let data = match frame.scaled_to(ctx.width, ctx.height) {
            Ok(data) => data,
            Err(e) => {
                skipped += 1;
                if skipped == 1 || skipped % 100 == 0 {
                    tracing::debug!("Skipping frame {}: {}", frame.seq, e);
                }
                continue;
            }
        };

        if let Err(e) = ctx.encoder.write_frame(&data) {
            if token.is_cancelled() {
                break;
            }
            let reason = if e.kind() == std::io::ErrorKind::BrokenPipe {
                format!("encoder pipe closed: {}", ctx.encoder.diagnostics())
            } else {
                format!("encoder write failed: {}", e)
            };
            tracing::error!("Recording aborted: {}", reason);

            *ctx.shared.last_error.write() = Some(reason.clone());
            ctx.shared.set_state(RecordingState::Idle);
            if let Some(lease) = &ctx.lease {
                ctx.mux.release(lease);
            }
            let _ = ctx.events.send(RecordingEvent::Error(reason));
            return;
        }
        ctx.shared.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    tracing::info!(
        "Recording writer stopped after {} frames ({} skipped)",
        ctx.shared.frames_written.load(Ordering::Relaxed),
        skipped
    );
}

pub struct RecordingManager {
    config: RecorderConfig,
    audio_config: AudioConfig,
    bus: Arc<FrameBus>,
    mux: Arc<StreamMultiplexer>,
    backend: Arc<dyn AudioBackend>,
    spawner: Arc<dyn EncoderSpawner>,
    microphone: RwLock<Option<String>>,

    session: Mutex<Option<ActiveSession>>,
    shared: Arc<SessionShared>,
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl RecordingManager {
    pub fn new(
        config: RecorderConfig,
        audio_config: AudioConfig,
        bus: Arc<FrameBus>,
        mux: Arc<StreamMultiplexer>,
        backend: Arc<dyn AudioBackend>,
        spawner: Arc<dyn EncoderSpawner>,
        microphone: Option<String>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            audio_config,
            bus,
            mux,
            backend,
            spawner,
            microphone: RwLock::new(microphone),
            session: Mutex::new(None),
            shared: Arc::new(SessionShared::default()),
            event_tx,
        }
    }

    pub fn set_microphone(&self, device: Option<String>) {
        *self.microphone.write() = device;
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> RecordingState {
        self.shared.state()
    }

    /// Take the microphone for recording, or `None` for a video-only session
    fn acquire_audio(&self) -> Option<(StreamLease, String)> {
        let device = match self.microphone.read().clone() {
            Some(device) => device,
            None => {
                tracing::info!("No microphone selected, recording video only");
                return None;
            }
        };

        let policy = ConflictPolicy::Preempt {
            grace: self.audio_config.preempt_grace(),
        };
        let lease = match self.mux.acquire(AudioDevice::Microphone, Purpose::Record, policy) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!("Microphone unavailable ({}), recording video only", e);
                return None;
            }
        };

        if let Err(e) = self
            .backend
            .probe_capture(&device, self.audio_config.device_test_timeout())
        {
            tracing::warn!("Microphone {} failed its test ({}), recording video only", device, e);
            self.mux.release(&lease);
            return None;
        }

        Some((lease, device))
    }

    /// Start recording, or return the current output path if already recording
    pub fn start(&self, audio_bitrate: Option<&str>) -> AppResult<PathBuf> {
        let mut session = self.session.lock();

        if let Some(active) = session.as_ref() {
            if self.shared.state() == RecordingState::Recording {
                tracing::debug!("Recording already running: {:?}", active.output);
                return Ok(active.output.clone());
            }
        }
        // A session whose writer failed is still holding its encoder
        if let Some(stale) = session.take() {
            self.teardown(stale);
        }

        self.shared.set_state(RecordingState::Starting);
        *self.shared.last_error.write() = None;
        self.shared.frames_written.store(0, Ordering::Relaxed);

        match self.launch(audio_bitrate) {
            Ok(active) => {
                let output = active.output.clone();
                tracing::info!("Recording started ({:?}): {:?}", active.mode, output);
                *session = Some(active);
                self.shared.set_state(RecordingState::Recording);
                let _ = self.event_tx.send(RecordingEvent::Started(output.clone()));
                Ok(output)
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                *self.shared.last_error.write() = Some(e.to_string());
                self.shared.set_state(RecordingState::Idle);
                let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Setup for `start`. On error everything acquired here is released.
    fn launch(&self, audio_bitrate: Option<&str>) -> AppResult<ActiveSession> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let output = self.config.output_dir.join(format!(
            "rec_{}.mov",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        // Encode at the size frames arrive in at start; later frames are scaled to it
        let frame = self.bus.latest_frame();
        let fps = self.bus.mode().fps;

        let audio = self.acquire_audio();
        let (lease, audio_device) = match audio {
            Some((lease, device)) => (Some(lease), Some(device)),
            None => (None, None),
        };
        let release = |lease: &Option<StreamLease>| {
            if let Some(lease) = lease {
                self.mux.release(lease);
            }
        };

        let spec = EncoderSpec {
            width: frame.width,
            height: frame.height,
            fps,
            audio: audio_device.as_ref().map(|device| AudioInput {
                device: device.clone(),
                bitrate: audio_bitrate
                    .filter(|b| !b.trim().is_empty())
                    .unwrap_or(self.config.default_audio_bitrate.as_str())
                    .to_string(),
            }),
            output: output.clone(),
        };

        let encoder = match self.spawner.spawn(&spec) {
            Ok(encoder) => encoder,
            Err(e) => {
                release(&lease);
                return Err(e);
            }
        };

        let ctx = WriterContext {
            bus: self.bus.clone(),
            encoder: encoder.clone(),
            shared: self.shared.clone(),
            mux: self.mux.clone(),
            lease: lease.clone(),
            events: self.event_tx.clone(),
            width: spec.width,
            height: spec.height,
            fps,
        };
        let writer = match Worker::spawn("recording-writer", move |token| write_loop(ctx, token)) {
            Ok(writer) => writer,
            Err(e) => {
                encoder.finish(self.config.stop_grace());
                release(&lease);
                return Err(e);
            }
        };

        Ok(ActiveSession {
            output,
            mode: if audio_device.is_some() {
                RecordingMode::Full
            } else {
                RecordingMode::VideoOnly
            },
            audio_device,
            started_at: Utc::now(),
            started: Instant::now(),
            encoder,
            lease,
            writer,
        })
    }

    /// Stop the writer, finish the encoder and release the microphone
    fn teardown(&self, mut active: ActiveSession) -> RecordingResult {
        if !active.writer.shutdown(self.config.writer_join_timeout()) {
            tracing::warn!("Recording writer did not stop in time, finishing encoder anyway");
        }

        let exit = active.encoder.finish(self.config.stop_grace());

        // Released whatever the encoder did
        if let Some(lease) = active.lease.take() {
            self.mux.release(&lease);
        }

        let error = self.shared.last_error.read().clone();
        RecordingResult {
            file_exists: active.output.exists(),
            output_path: active.output,
            mode: active.mode,
            frames_written: self.shared.frames_written.load(Ordering::Relaxed),
            duration_seconds: active.started.elapsed().as_secs_f64(),
            encoder_exit_code: if exit.forced { None } else { exit.code },
            error,
        }
    }

    /// Stop recording. Returns `None` when nothing was recording.
    pub fn stop(&self) -> AppResult<Option<RecordingResult>> {
        let mut session = self.session.lock();
        let Some(active) = session.take() else {
            tracing::debug!("Stop requested while idle");
            return Ok(None);
        };

        let failed = self.shared.state() != RecordingState::Recording;
        if !failed {
            self.shared.set_state(RecordingState::Stopping);
        }
        tracing::info!("Stopping recording: {:?}", active.output);

        let result = self.teardown(active);
        self.shared.set_state(RecordingState::Idle);
        if !failed {
            let _ = self
                .event_tx
                .send(RecordingEvent::Stopped(result.output_path.clone()));
        }

        tracing::info!(
            "Recording stopped: {} frames in {:.1}s, file {:?}",
            result.frames_written,
            result.duration_seconds,
            result.output_path
        );
        Ok(Some(result))
    }

    pub fn status(&self) -> RecordingStatus {
        let session = self.session.lock();
        let mut status = RecordingStatus {
            state: self.shared.state(),
            frames_written: self.shared.frames_written.load(Ordering::Relaxed),
            last_error: self.shared.last_error.read().clone(),
            ..RecordingStatus::default()
        };
        if let Some(active) = session.as_ref() {
            status.mode = Some(active.mode);
            status.output_path = Some(active.output.clone());
            status.started_at = Some(active.started_at);
            status.audio_device = active.audio_device.clone();
            if status.state == RecordingState::Recording {
                status.elapsed_seconds = active.started.elapsed().as_secs_f64();
            }
        }
        status
    }

    /// Stop any session, reporting failures instead of returning them
    pub fn shutdown(&self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Error stopping recording during shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::testing::{FakeAudioBackend, FakeCameraOpener, FakeEncoderSpawner};
    use crate::utils::error::AppError;
    use std::time::Duration;

    struct Rig {
        manager: RecordingManager,
        bus: Arc<FrameBus>,
        mux: Arc<StreamMultiplexer>,
        spawner: FakeEncoderSpawner,
        _dir: tempfile::TempDir,
    }

    fn rig(spawner: FakeEncoderSpawner, backend: FakeAudioBackend, microphone: Option<&str>) -> Rig {
        rig_on(spawner, backend, microphone, Some("/dev/video0"))
    }

    /// Rig whose bus starts on `camera`, or on the placeholder when `None`
    fn rig_on(
        spawner: FakeEncoderSpawner,
        backend: FakeAudioBackend,
        microphone: Option<&str>,
        camera: Option<&str>,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let opener = FakeCameraOpener::new().with_camera("/dev/video0");
        let capture = CaptureConfig {
            resolution: "480p".into(),
            snapshot_dir: dir.path().join("snapshots"),
            ..CaptureConfig::default()
        };
        let bus = FrameBus::start(
            capture,
            crate::config::ResolutionPreset::from_name("480p").unwrap(),
            Arc::new(opener),
            camera.map(String::from),
            Vec::new(),
        )
        .unwrap();
        let bus = Arc::new(bus);

        // Wait for the first camera frame so the encoder size is stable
        let deadline = Instant::now() + Duration::from_secs(2);
        while camera.is_some() && bus.latest_frame().is_placeholder && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mux = Arc::new(StreamMultiplexer::new(Duration::ZERO));
        let config = RecorderConfig {
            output_dir: dir.path().join("recordings"),
            stop_grace_ms: 200,
            writer_join_timeout_ms: 500,
            ..RecorderConfig::default()
        };
        let audio = AudioConfig {
            preempt_grace_ms: 100,
            ..AudioConfig::default()
        };
        let manager = RecordingManager::new(
            config,
            audio,
            bus.clone(),
            mux.clone(),
            Arc::new(backend),
            Arc::new(spawner.clone()),
            microphone.map(String::from),
        );
        Rig {
            manager,
            bus,
            mux,
            spawner,
            _dir: dir,
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn test_start_twice_returns_same_path() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        let first = rig.manager.start(None).unwrap();
        let second = rig.manager.start(Some("128k")).unwrap();
        assert_eq!(first, second);
        assert_eq!(rig.spawner.spawn_count(), 1);
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("rec_"));
        rig.manager.stop().unwrap();
    }

    #[test]
    fn test_full_mode_uses_default_bitrate_and_holds_microphone() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        rig.manager.start(None).unwrap();

        let status = rig.manager.status();
        assert_eq!(status.state, RecordingState::Recording);
        assert_eq!(status.mode, Some(RecordingMode::Full));
        let spec = rig.spawner.last_spec().unwrap();
        assert_eq!(spec.audio.unwrap().bitrate, "96k");
        assert_eq!(
            rig.mux.holder(AudioDevice::Microphone).unwrap().purpose,
            Purpose::Record
        );

        assert!(wait_for(|| rig.spawner.frames_written() > 0));
        let result = rig.manager.stop().unwrap().unwrap();
        assert!(result.frames_written > 0);
        assert!(rig.mux.holder(AudioDevice::Microphone).is_none());
        assert_eq!(rig.manager.state(), RecordingState::Idle);
    }

    #[test]
    fn test_busy_microphone_falls_back_to_video_only() {
        let rig = rig(
            FakeEncoderSpawner::new(),
            FakeAudioBackend::failing_probe(),
            Some("plughw:1,0"),
        );
        rig.manager.start(None).unwrap();

        assert_eq!(rig.manager.status().mode, Some(RecordingMode::VideoOnly));
        assert!(rig.spawner.last_spec().unwrap().audio.is_none());
        assert!(rig.mux.holder(AudioDevice::Microphone).is_none());
        rig.manager.stop().unwrap();
    }

    #[test]
    fn test_recording_preempts_live_stream_lease() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        let live = rig
            .mux
            .acquire(AudioDevice::Microphone, Purpose::LiveStream, ConflictPolicy::Reject)
            .unwrap();

        rig.manager.start(None).unwrap();
        assert!(live.is_revoked());
        assert_eq!(rig.manager.status().mode, Some(RecordingMode::Full));
        rig.manager.stop().unwrap();
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), None);
        assert!(rig.manager.stop().unwrap().is_none());
        assert_eq!(rig.manager.state(), RecordingState::Idle);
    }

    #[test]
    fn test_spawn_failure_returns_to_idle_and_releases_audio() {
        let rig = rig(FakeEncoderSpawner::failing(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        let mut events = rig.manager.subscribe();

        assert!(matches!(rig.manager.start(None), Err(AppError::Encoder(_))));
        assert_eq!(rig.manager.state(), RecordingState::Idle);
        assert!(rig.mux.holder(AudioDevice::Microphone).is_none());
        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Error(_))));
    }

    #[test]
    fn test_broken_pipe_aborts_session_and_stop_still_releases() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        let mut events = rig.manager.subscribe();
        rig.manager.start(None).unwrap();
        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Started(_))));

        rig.spawner.break_pipe();
        assert!(wait_for(|| rig.manager.state() == RecordingState::Idle));
        assert!(rig.manager.status().last_error.is_some());
        assert!(rig.mux.holder(AudioDevice::Microphone).is_none());
        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Error(_))));

        let result = rig.manager.stop().unwrap().unwrap();
        assert!(result.error.is_some());
        assert!(rig.spawner.finished());
    }

    #[test]
    fn test_stop_releases_lease_when_encoder_already_dead() {
        let rig = rig(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), Some("plughw:1,0"));
        rig.manager.start(None).unwrap();
        rig.spawner.kill();

        let result = rig.manager.stop().unwrap().unwrap();
        assert_eq!(result.encoder_exit_code, Some(1));
        assert!(rig.mux.holder(AudioDevice::Microphone).is_none());
    }

    #[test]
    fn test_camera_arriving_mid_recording_is_scaled_into_encoder() {
        let rig = rig_on(FakeEncoderSpawner::new(), FakeAudioBackend::streaming(), None, None);
        rig.manager.start(None).unwrap();

        let spec = rig.spawner.last_spec().unwrap();
        assert_eq!((spec.width, spec.height), (640, 480));
        assert!(wait_for(|| rig.spawner.frames_written() > 0));

        rig.bus.set_camera_path(Some("/dev/video0".into()));
        rig.bus.reinitialize().unwrap();
        assert!(wait_for(|| !rig.bus.latest_frame().is_placeholder));
        assert_eq!(rig.bus.latest_frame().width, 32);

        let after_switch = rig.spawner.frames_written();
        assert!(wait_for(|| rig.spawner.frames_written() >= after_switch + 3));
        assert_eq!(rig.spawner.misfit_frames(), 0);

        let status = rig.manager.status();
        assert_eq!(status.state, RecordingState::Recording);
        assert!(status.last_error.is_none());
        rig.manager.stop().unwrap();
    }
}
