//! Frame type and JPEG encoding

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;

use crate::utils::error::{AppError, AppResult};

/// Boundary marker used by the multipart MJPEG stream
pub const MJPEG_BOUNDARY: &str = "frame";

/// One RGB24 raster image.
///
/// Pixel data sits behind an `Arc` so copying a frame out of the bus slot
/// never duplicates the buffer and a reader can never see a half-written one.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the bus on publish
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, `width * height * 3` bytes
    pub data: Arc<Vec<u8>>,
    /// Synthetic frame shown while no camera is available
    pub is_placeholder: bool,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            seq: 0,
            captured_at: Utc::now(),
            width,
            height,
            data: Arc::new(data),
            is_placeholder: false,
        }
    }

    pub fn placeholder(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            is_placeholder: true,
            ..Self::new(width, height, data)
        }
    }

    /// Expected byte length for the frame's dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    fn to_image(&self) -> AppResult<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.as_ref().clone()).ok_or_else(|| {
            AppError::Encoder(format!(
                "frame buffer of {} bytes does not match {}x{}",
                self.data.len(),
                self.width,
                self.height
            ))
        })
    }

    /// Pixel data at `width` x `height`.
    ///
    /// A frame that already has that size hands out its own buffer; any other
    /// frame is rescaled.
    pub fn scaled_to(&self, width: u32, height: u32) -> AppResult<Arc<Vec<u8>>> {
        if self.width == width && self.height == height && self.is_well_formed() {
            return Ok(self.data.clone());
        }
        let image = self.to_image()?;
        let scaled = imageops::resize(&image, width, height, FilterType::Triangle);
        Ok(Arc::new(scaled.into_raw()))
    }

    /// Encode to JPEG at `quality` (1-100)
    pub fn to_jpeg(&self, quality: u8) -> AppResult<Vec<u8>> {
        let image = self.to_image()?;

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
            .encode_image(&image)
            .map_err(|e| AppError::Encoder(format!("JPEG encoding failed: {}", e)))?;
        Ok(jpeg)
    }
}

/// Wrap one JPEG in a multipart chunk for an MJPEG HTTP response
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\n\r\n",
        MJPEG_BOUNDARY
    );
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}
