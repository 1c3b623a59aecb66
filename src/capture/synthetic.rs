//! Test-card frame source for running without camera hardware

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tracing::{debug, info, instrument};

use super::frame::Resolution;
use super::source::FrameSource;

/// SMPTE-style colour bars, scrolled one step per frame
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Generates JPEG frames at a fixed cadence
pub struct SyntheticSource {
    resolution: Option<Resolution>,
    running: bool,
    quality: u8,
    frame_interval: Duration,
    next_deadline: Option<Instant>,
    counter: u64,
}

impl SyntheticSource {
    pub fn new(fps: u32, quality: u8) -> Self {
        Self {
            resolution: None,
            running: false,
            quality: quality.clamp(1, 100),
            frame_interval: Duration::from_secs(1) / fps.max(1),
            next_deadline: None,
            counter: 0,
        }
    }

    fn render(&self, resolution: Resolution) -> Result<Bytes> {
        let (width, height) = resolution.dimensions();
        let bar_width = (width / BARS.len() as u32).max(1);
        let shift = (self.counter * 4) as u32 % width;
        // Bottom eighth is a progress strip so motion is visible at any size
        let strip_top = height - height / 8;
        let progress = (self.counter % 100) as u32 * width / 100;

        let img = RgbImage::from_fn(width, height, |x, y| {
            if y >= strip_top {
                return if x <= progress { Rgb([235, 128, 16]) } else { Rgb([32, 32, 32]) };
            }
            let bar = ((x + shift) % width) / bar_width;
            Rgb(BARS[bar as usize % BARS.len()])
        });

        let mut buf = Vec::with_capacity((width * height / 4) as usize);
        JpegEncoder::new_with_quality(&mut buf, self.quality).encode_image(&img)?;
        Ok(Bytes::from(buf))
    }

    fn pace(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.next_deadline {
            if deadline > now {
                thread::sleep(deadline - now);
            }
        }
        let base = self.next_deadline.map_or(now, |d| d.max(now));
        self.next_deadline = Some(base + self.frame_interval);
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn configure(&mut self, resolution: Resolution) -> Result<()> {
        if self.running {
            return Err(eyre!("Cannot configure a running source"));
        }
        debug!(%resolution, "Synthetic source configured");
        self.resolution = Some(resolution);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let resolution = self
            .resolution
            .ok_or_else(|| eyre!("Source must be configured before start"))?;
        info!(%resolution, quality = self.quality, "Synthetic capture started");
        self.running = true;
        self.next_deadline = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            info!("Synthetic capture stopped");
        }
        self.running = false;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    fn capture_frame(&mut self) -> Result<Bytes> {
        if !self.running {
            return Err(eyre!("Stream not started"));
        }
        let resolution = self
            .resolution
            .ok_or_else(|| eyre!("Source is not configured"))?;

        self.pace();
        let frame = self.render(resolution)?;
        self.counter += 1;
        Ok(frame)
    }

    fn active_resolution(&self) -> Option<Resolution> {
        self.resolution
    }
}
