//! Frame sources
//!
//! A [`FrameSource`] is owned by exactly one thread, the bus producer (or a
//! registry probe). Sources are opened through a [`CameraOpener`] inside that
//! thread because camera handles are not `Send`.

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

use super::frame::Frame;
use crate::config::ResolutionPreset;
use crate::utils::error::{AppError, AppResult};

/// Produces raw frames on demand
pub trait FrameSource {
    /// Read the next frame, blocking for at most one camera frame interval
    fn read_frame(&mut self) -> AppResult<Frame>;

    /// Whether this source is synthetic
    fn is_placeholder(&self) -> bool {
        false
    }

    /// Short description for logs and status
    fn describe(&self) -> String;
}

/// Opens camera devices by path
pub trait CameraOpener: Send + Sync {
    fn open(&self, path: &str, mode: &ResolutionPreset) -> AppResult<Box<dyn FrameSource>>;
}

/// Resolve a device path such as `/dev/video2` (or a bare `2`) to a camera index
pub fn camera_index(path: &str) -> CameraIndex {
    let digits: String = path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    match digits.parse::<u32>() {
        Ok(index) => CameraIndex::Index(index),
        Err(_) => CameraIndex::String(path.to_string()),
    }
}

/// [`CameraOpener`] backed by nokhwa's native capture backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NokhwaOpener;

impl CameraOpener for NokhwaOpener {
    fn open(&self, path: &str, mode: &ResolutionPreset) -> AppResult<Box<dyn FrameSource>> {
        let index = camera_index(path);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(mode.width, mode.height),
                FrameFormat::MJPEG,
                mode.fps,
            ),
        ));

        let mut camera = Camera::new(index.clone(), requested).map_err(|e| {
            AppError::DeviceNotFound(format!("failed to open camera {}: {}", path, e))
        })?;
        camera.open_stream().map_err(|e| {
            AppError::DeviceNotFound(format!("failed to start stream on {}: {}", path, e))
        })?;

        let format = camera.camera_format();
        tracing::info!(
            "Camera {} opened: {}x{} @ {}fps ({:?}), requested {}x{} @ {}fps",
            path,
            format.resolution().width(),
            format.resolution().height(),
            format.frame_rate(),
            format.format(),
            mode.width,
            mode.height,
            mode.fps
        );

        Ok(Box::new(NokhwaSource {
            path: path.to_string(),
            camera,
        }))
    }
}

struct NokhwaSource {
    path: String,
    camera: Camera,
}

impl FrameSource for NokhwaSource {
    fn read_frame(&mut self) -> AppResult<Frame> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| AppError::Transport(format!("camera read failed: {}", e)))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| AppError::Transport(format!("camera decode failed: {}", e)))?;
        let (width, height) = (image.width(), image.height());
        Ok(Frame::new(width, height, image.into_raw()))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

impl Drop for NokhwaSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::debug!("Stopping camera {} failed: {}", self.path, e);
        }
    }
}
