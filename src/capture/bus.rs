//! Frame bus
//!
//! A single producer thread owns the camera and publishes the most recent
//! frame into one shared slot. Readers copy the slot out under the same lock,
//! so memory stays bounded to one frame no matter how many consumers there
//! are and the producer never waits on a slow reader.
//!
//! Device changes (resolution switch, reopen after a rescan, release) are
//! requests picked up by the producer at the top of its loop. Callers block
//! on an acknowledgement with a timeout.

use chrono::Local;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::frame::Frame;
use super::placeholder::{self, PlaceholderSource, PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};
use super::source::{CameraOpener, FrameSource};
use super::stream::FrameSubscription;
use crate::config::{CaptureConfig, ResolutionPreset};
use crate::utils::error::{AppError, AppResult};
use crate::utils::worker::{fps_interval, CancelToken, Ticker, Worker};

const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Device change requested from outside the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    /// Close the camera and reopen through the selected path and fallbacks,
    /// switching to the given mode first
    Reopen(Option<ResolutionPreset>),
    /// Close the camera and serve the placeholder until the next reopen
    Release,
}

#[derive(Debug, Default)]
struct Control {
    pending: Option<Request>,
    requested: u64,
    applied: u64,
}

/// Camera state for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    /// Device the producer is reading from, or `placeholder`
    pub device: String,
    pub placeholder: bool,
    pub resolution: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames_published: u64,
    pub consecutive_errors: u32,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    device: String,
    placeholder: bool,
    frames_published: u64,
    consecutive_errors: u32,
}

/// State shared between the producer, subscriptions and callers
pub(crate) struct BusShared {
    config: CaptureConfig,
    opener: Arc<dyn CameraOpener>,
    camera_path: RwLock<Option<String>>,
    fallbacks: Vec<String>,
    mode: RwLock<(String, ResolutionPreset)>,

    slot: Mutex<Frame>,
    /// Last encoded JPEG keyed by frame sequence, shared by all subscribers
    encoded: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
    placeholder_jpeg: OnceLock<Arc<Vec<u8>>>,

    control: Mutex<Control>,
    applied: Condvar,
    counters: RwLock<Counters>,
}

impl BusShared {
    pub(crate) fn latest(&self) -> Frame {
        self.slot.lock().clone()
    }

    pub(crate) fn fps(&self) -> u32 {
        self.mode.read().1.fps
    }

    pub(crate) fn quality(&self) -> u8 {
        self.config.jpeg_quality
    }

    fn publish(&self, mut frame: Frame) {
        {
            let mut slot = self.slot.lock();
            frame.seq = slot.seq + 1;
            *slot = frame;
        }
        let mut counters = self.counters.write();
        counters.frames_published += 1;
        counters.consecutive_errors = 0;
    }

    /// JPEG for `frame`, reusing the cached encoding when another reader already made it
    pub(crate) fn jpeg_for(&self, frame: &Frame) -> Arc<Vec<u8>> {
        if let Some((seq, jpeg)) = self.encoded.lock().as_ref() {
            if *seq == frame.seq && frame.seq != 0 {
                return jpeg.clone();
            }
        }

        match frame.to_jpeg(self.quality()) {
            Ok(jpeg) => {
                let jpeg = Arc::new(jpeg);
                *self.encoded.lock() = Some((frame.seq, jpeg.clone()));
                jpeg
            }
            Err(e) => {
                tracing::debug!("Frame {} could not be encoded: {}", frame.seq, e);
                self.placeholder_jpeg()
            }
        }
    }

    fn placeholder_jpeg(&self) -> Arc<Vec<u8>> {
        self.placeholder_jpeg
            .get_or_init(|| {
                let frame = placeholder::render(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, 0);
                Arc::new(frame.to_jpeg(self.quality()).unwrap_or_default())
            })
            .clone()
    }

    fn take_request(&self) -> Option<(Request, u64)> {
        let mut control = self.control.lock();
        let generation = control.requested;
        control.pending.take().map(|r| (r, generation))
    }

    fn acknowledge(&self, generation: u64) {
        let mut control = self.control.lock();
        if generation > control.applied {
            control.applied = generation;
        }
        self.applied.notify_all();
    }

    /// Post a request and wait for the producer to apply it
    fn request(&self, request: Request, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        let mut control = self.control.lock();
        control.requested += 1;
        let generation = control.requested;
        control.pending = Some(request);

        while control.applied < generation {
            if self.applied.wait_until(&mut control, deadline).timed_out() {
                return Err(AppError::ProtocolTimeout(format!(
                    "camera did not apply {:?} within {:?}",
                    request, timeout
                )));
            }
        }
        Ok(())
    }

    fn candidate_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(path) = self.camera_path.read().clone() {
            paths.push(path);
        }
        for path in &self.fallbacks {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// Open the first camera that works, or the placeholder
    fn open_best(&self) -> Box<dyn FrameSource> {
        let mode = self.mode.read().1;
        for path in self.candidate_paths() {
            match self.opener.open(&path, &mode) {
                Ok(source) => {
                    self.set_device(source.describe(), false);
                    return source;
                }
                Err(e) => tracing::debug!("Camera {} unavailable: {}", path, e),
            }
        }

        tracing::warn!("No camera available, serving placeholder frames");
        self.placeholder_source()
    }

    fn placeholder_source(&self) -> Box<dyn FrameSource> {
        self.set_device("placeholder".into(), true);
        Box::new(PlaceholderSource::new())
    }

    fn set_device(&self, device: String, placeholder: bool) {
        let mut counters = self.counters.write();
        counters.device = device;
        counters.placeholder = placeholder;
        counters.consecutive_errors = 0;
    }
}

fn run_producer(shared: Arc<BusShared>, token: CancelToken) {
    let mut ticker = Ticker::from_fps(shared.fps());
    let mut source = shared.open_best();
    let mut failures: u32 = 0;

    while ticker.wait(&token) {
        if let Some((request, generation)) = shared.take_request() {
            // Drop the current handle before opening anything new
            drop(std::mem::replace(&mut source, Box::new(PlaceholderSource::new())));
            source = match request {
                Request::Reopen(mode) => {
                    if let Some(mode) = mode {
                        *shared.mode.write() = (mode.name(), mode);
                    }
                    shared.open_best()
                }
                Request::Release => {
                    tracing::info!("Camera released");
                    shared.placeholder_source()
                }
            };
            ticker.set_interval(fps_interval(shared.fps()));
            failures = 0;
            shared.acknowledge(generation);
        }

        match source.read_frame() {
            Ok(frame) => {
                failures = 0;
                shared.publish(frame);
            }
            Err(e) => {
                failures += 1;
                shared.counters.write().consecutive_errors = failures;
                if failures == 1 {
                    tracing::warn!("Frame read failed on {}: {}", source.describe(), e);
                }

                if failures >= shared.config.failure_threshold {
                    tracing::warn!(
                        "{} consecutive read failures, reinitializing camera",
                        failures
                    );
                    drop(std::mem::replace(&mut source, shared.placeholder_source()));
                    if token.sleep(shared.config.reinit_delay()) {
                        break;
                    }
                    source = shared.open_best();
                    failures = 0;
                }
            }
        }
    }

    tracing::info!("Frame producer stopped");
}

/// Single-producer, many-reader live frame distribution
pub struct FrameBus {
    shared: Arc<BusShared>,
    worker: Mutex<Option<Worker>>,
}

impl FrameBus {
    /// Start the producer thread.
    ///
    /// `camera_path` is the registry's selection; `fallbacks` are tried after it.
    pub fn start(
        config: CaptureConfig,
        initial: ResolutionPreset,
        opener: Arc<dyn CameraOpener>,
        camera_path: Option<String>,
        fallbacks: Vec<String>,
    ) -> AppResult<Self> {
        let preset_name = initial.name();
        let initial_frame = placeholder::render(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, 0);

        let shared = Arc::new(BusShared {
            config,
            opener,
            camera_path: RwLock::new(camera_path),
            fallbacks,
            mode: RwLock::new((preset_name, initial)),
            slot: Mutex::new(initial_frame),
            encoded: Mutex::new(None),
            placeholder_jpeg: OnceLock::new(),
            control: Mutex::new(Control::default()),
            applied: Condvar::new(),
            counters: RwLock::new(Counters {
                device: "placeholder".into(),
                placeholder: true,
                ..Counters::default()
            }),
        });

        let producer_shared = shared.clone();
        let worker = Worker::spawn("frame-bus", move |token| run_producer(producer_shared, token))?;
        tracing::info!(
            "Frame bus started at {}x{} @ {}fps",
            initial.width,
            initial.height,
            initial.fps
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Copy of the most recent frame
    pub fn latest_frame(&self) -> Frame {
        self.shared.latest()
    }

    /// Current capture mode
    pub fn mode(&self) -> ResolutionPreset {
        self.shared.mode.read().1
    }

    /// New independent MJPEG stream over the latest frame
    pub fn subscribe(&self) -> FrameSubscription {
        FrameSubscription::new(self.shared.clone())
    }

    /// JPEG of the latest frame
    pub fn snapshot_jpeg(&self) -> AppResult<Vec<u8>> {
        self.shared.latest().to_jpeg(self.shared.quality())
    }

    /// Write the latest frame to the snapshot directory
    pub fn take_snapshot(&self) -> AppResult<PathBuf> {
        let jpeg = self.snapshot_jpeg()?;
        let dir = &self.shared.config.snapshot_dir;
        std::fs::create_dir_all(dir)?;

        let path = dir.join(format!(
            "avatar_tank_{}.jpg",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::write(&path, &jpeg)?;
        tracing::info!("Snapshot saved: {:?} ({} bytes)", path, jpeg.len());
        Ok(path)
    }

    /// Switch to a named resolution preset and wait for the camera to reopen
    pub fn set_resolution(&self, preset_name: &str) -> AppResult<ResolutionPreset> {
        let preset = ResolutionPreset::from_name(preset_name)?;
        tracing::info!("Changing resolution to {}", preset_name);
        // The producer records the new mode when it reopens the camera
        self.shared
            .request(Request::Reopen(Some(preset)), self.shared.config.reconfigure_timeout())?;
        Ok(preset)
    }

    /// Use a new camera path from the registry on the next reopen
    pub fn set_camera_path(&self, path: Option<String>) {
        *self.shared.camera_path.write() = path;
    }

    /// Close and reopen the camera
    pub fn reinitialize(&self) -> AppResult<()> {
        self.shared
            .request(Request::Reopen(None), self.shared.config.reconfigure_timeout())
    }

    /// Close the camera and serve the placeholder until [`Self::reinitialize`]
    pub fn release_camera(&self) -> AppResult<()> {
        self.shared
            .request(Request::Release, self.shared.config.reconfigure_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |w| !w.is_finished())
    }

    pub fn status(&self) -> CameraStatus {
        let (name, mode) = self.shared.mode.read().clone();
        let counters = self.shared.counters.read();
        CameraStatus {
            device: counters.device.clone(),
            placeholder: counters.placeholder,
            resolution: name,
            width: mode.width,
            height: mode.height,
            fps: mode.fps,
            frames_published: counters.frames_published,
            consecutive_errors: counters.consecutive_errors,
            running: self.is_running(),
        }
    }

    /// Stop the producer and release the camera
    pub fn shutdown(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown(PRODUCER_JOIN_TIMEOUT);
        }
    }
}

impl Drop for FrameBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCameraOpener;
    use std::thread;

    fn test_config(dir: Option<&std::path::Path>) -> CaptureConfig {
        CaptureConfig {
            resolution: "480p".into(),
            failure_threshold: 3,
            reinit_delay_ms: 10,
            reconfigure_timeout_ms: 2000,
            snapshot_dir: dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("snapshots")),
            ..CaptureConfig::default()
        }
    }

    fn start_bus(opener: &FakeCameraOpener, path: Option<&str>, dir: Option<&std::path::Path>) -> FrameBus {
        FrameBus::start(
            test_config(dir),
            ResolutionPreset::from_name("480p").unwrap(),
            Arc::new(opener.clone()),
            path.map(String::from),
            vec![],
        )
        .unwrap()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_no_camera_streams_placeholder_forever() {
        let opener = FakeCameraOpener::new();
        let bus = start_bus(&opener, Some("/dev/video0"), None);

        let mut stream = bus.subscribe();
        for _ in 0..3 {
            let chunk = stream.next().unwrap();
            let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
            assert!(chunk.starts_with(header));
            assert_eq!(&chunk[header.len()..header.len() + 2], &[0xFF, 0xD8]);
        }
        assert!(bus.status().placeholder);
        bus.shutdown();
    }

    #[test]
    fn test_camera_frames_are_published_in_order() {
        let opener = FakeCameraOpener::new().with_camera("/dev/video0");
        let bus = start_bus(&opener, Some("/dev/video0"), None);

        assert!(wait_for(|| bus.status().frames_published >= 3));
        assert_eq!(bus.status().device, "/dev/video0");

        let mut last = 0;
        for _ in 0..10 {
            let frame = bus.latest_frame();
            assert!(frame.is_well_formed());
            assert!(frame.seq >= last);
            last = frame.seq;
            thread::sleep(Duration::from_millis(15));
        }
        assert!(last > 0);
        bus.shutdown();
    }

    #[test]
    fn test_read_failures_trigger_reopen() {
        let opener = FakeCameraOpener::new().with_failing_camera("/dev/video0", 2);
        let bus = start_bus(&opener, Some("/dev/video0"), None);

        assert!(wait_for(|| opener.open_count("/dev/video0") >= 2));
        bus.shutdown();
    }

    #[test]
    fn test_set_resolution_reopens_with_new_mode() {
        let opener = FakeCameraOpener::new().with_camera("/dev/video0");
        let bus = start_bus(&opener, Some("/dev/video0"), None);

        let preset = bus.set_resolution("1080p").unwrap();
        assert_eq!(preset.width, 1920);
        assert_eq!(opener.last_mode("/dev/video0").map(|m| m.width), Some(1920));
        assert_eq!(bus.status().resolution, "1080p");

        assert!(matches!(bus.set_resolution("8k"), Err(AppError::InvalidArgument(_))));
        bus.shutdown();
    }

    #[test]
    fn test_release_closes_camera_until_reinitialized() {
        let opener = FakeCameraOpener::new().with_camera("/dev/video0");
        let bus = start_bus(&opener, Some("/dev/video0"), None);
        assert!(wait_for(|| opener.live_handles() == 1));

        bus.release_camera().unwrap();
        assert_eq!(opener.live_handles(), 0);
        assert!(bus.status().placeholder);

        bus.reinitialize().unwrap();
        assert_eq!(opener.live_handles(), 1);
        assert!(!bus.status().placeholder);
        bus.shutdown();
        assert_eq!(opener.live_handles(), 0);
    }

    #[test]
    fn test_snapshot_written_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FakeCameraOpener::new().with_camera("/dev/video0");
        let bus = start_bus(&opener, Some("/dev/video0"), Some(dir.path()));
        assert!(wait_for(|| bus.status().frames_published > 0));

        let path = bus.take_snapshot().unwrap();
        assert!(path.starts_with(dir.path()));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        bus.shutdown();
    }

    #[test]
    fn test_requests_time_out_after_shutdown() {
        let opener = FakeCameraOpener::new();
        let mut config = test_config(None);
        config.reconfigure_timeout_ms = 50;
        let bus = FrameBus::start(
            config,
            ResolutionPreset::from_name("480p").unwrap(),
            Arc::new(opener),
            None,
            vec![],
        )
        .unwrap();
        bus.shutdown();

        assert!(!bus.is_running());
        assert!(matches!(bus.reinitialize(), Err(AppError::ProtocolTimeout(_))));

        // A mode the producer never applied is not reported
        assert!(matches!(bus.set_resolution("1080p"), Err(AppError::ProtocolTimeout(_))));
        assert_eq!(bus.status().resolution, "480p");
        assert_eq!(bus.mode().width, 640);
    }

    #[test]
    fn test_unknown_startup_preset_reports_mode_in_use() {
        let mut config = test_config(None);
        config.resolution = "potato".into();
        let bus = FrameBus::start(
            config,
            ResolutionPreset::from_name("720p").unwrap(),
            Arc::new(FakeCameraOpener::new()),
            None,
            vec![],
        )
        .unwrap();

        let status = bus.status();
        assert_eq!(status.resolution, "720p");
        assert_eq!((status.width, status.height), (1280, 720));
        bus.shutdown();
    }
}
