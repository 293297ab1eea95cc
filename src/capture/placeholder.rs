//! Synthetic frames served when no camera is available

use super::frame::Frame;
use super::source::FrameSource;
use crate::utils::error::AppResult;

pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

const BACKGROUND: [u8; 3] = [32, 32, 40];
const BORDER: [u8; 3] = [200, 60, 60];
const STRIPE: [u8; 3] = [90, 90, 110];
const BORDER_WIDTH: u32 = 8;
const STRIPE_WIDTH: u32 = 24;

/// Render one placeholder frame. `tick` moves the stripe so viewers can see
/// the stream is still alive.
pub fn render(width: u32, height: u32, tick: u64) -> Frame {
    let travel = width.saturating_sub(2 * BORDER_WIDTH + STRIPE_WIDTH).max(1) as u64;
    let stripe_x = BORDER_WIDTH + ((tick * 8) % travel) as u32;

    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            let on_border = x < BORDER_WIDTH
                || y < BORDER_WIDTH
                || x >= width.saturating_sub(BORDER_WIDTH)
                || y >= height.saturating_sub(BORDER_WIDTH);
            let pixel = if on_border {
                BORDER
            } else if x >= stripe_x && x < stripe_x + STRIPE_WIDTH {
                STRIPE
            } else {
                BACKGROUND
            };
            data.extend_from_slice(&pixel);
        }
    }

    Frame::placeholder(width, height, data)
}

/// Frame source that never fails
#[derive(Debug, Default)]
pub struct PlaceholderSource {
    tick: u64,
}

impl PlaceholderSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSource for PlaceholderSource {
    fn read_frame(&mut self) -> AppResult<Frame> {
        self.tick = self.tick.wrapping_add(1);
        Ok(render(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, self.tick))
    }

    fn is_placeholder(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "placeholder".into()
    }
}
