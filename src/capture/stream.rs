//! MJPEG subscriptions over the frame bus

use std::sync::Arc;

use super::bus::BusShared;
use super::frame::multipart_chunk;
use crate::utils::worker::{fps_interval, Ticker};

/// Infinite stream of multipart JPEG chunks.
///
/// Each subscription has its own ticker, so a slow HTTP client only slows
/// itself down. It never ends and never fails: when a frame cannot be
/// encoded the placeholder image is sent instead.
pub struct FrameSubscription {
    shared: Arc<BusShared>,
    ticker: Ticker,
    last_seq: Option<u64>,
}

impl FrameSubscription {
    pub(crate) fn new(shared: Arc<BusShared>) -> Self {
        let ticker = Ticker::from_fps(shared.fps());
        Self {
            shared,
            ticker,
            last_seq: None,
        }
    }

    /// Sequence number of the last frame this subscription yielded
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Next JPEG without the multipart framing
    pub fn next_jpeg(&mut self) -> Arc<Vec<u8>> {
        let interval = fps_interval(self.shared.fps());
        if self.ticker.interval() != interval {
            self.ticker.set_interval(interval);
        }
        self.ticker.wait_uncancellable();

        let frame = self.shared.latest();
        self.last_seq = Some(frame.seq);
        self.shared.jpeg_for(&frame)
    }
}

impl Iterator for FrameSubscription {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let jpeg = self.next_jpeg();
        Some(multipart_chunk(&jpeg))
    }
}
