//! V4L2 MJPEG capture with memory-mapped buffers

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::Resolution;
use super::source::FrameSource;
use crate::{utils, CaptureConfig};

/// Camera that already emits JPEG, so frames go to the bus untouched
pub struct V4l2Source {
    device: Box<Device>,
    path: String,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    resolution: Option<Resolution>,
}

impl V4l2Source {
    /// Open the configured device, or the first MJPEG-capable one
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let path = if config.device.is_empty() {
            utils::auto_detect_device()?
        } else {
            config.device.clone()
        };
        info!(device = %path, "Initializing V4L2 capture");

        let device = Device::with_path(&path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        Ok(Self {
            device: Box::new(device),
            path,
            stream: None,
            buffer_count: config.buffer_count.max(2),
            resolution: None,
        })
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.path
    }

    fn configure(&mut self, resolution: Resolution) -> Result<()> {
        if self.stream.is_some() {
            return Err(eyre!("Device busy: stop streaming before reconfiguring"));
        }

        let (width, height) = resolution.dimensions();
        let mut fmt = self.device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(b"MJPG");

        let applied = self.device.set_format(&fmt)?;
        if applied.fourcc != FourCC::new(b"MJPG") {
            return Err(eyre!("Device refused MJPEG output (got {})", applied.fourcc));
        }
        if (applied.width, applied.height) != (width, height) {
            return Err(eyre!(
                "Device does not support {}: driver chose {}x{}",
                resolution,
                applied.width,
                applied.height
            ));
        }

        info!(%resolution, width, height, "V4L2 format set");
        self.resolution = Some(resolution);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.resolution.is_none() {
            return Err(eyre!("Device must be configured before start"));
        }
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Dropping the stream issues STREAMOFF and releases the buffers
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    fn capture_frame(&mut self) -> Result<Bytes> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| eyre!("Stream not started"))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());

        Ok(Bytes::copy_from_slice(&buf[..used]))
    }

    fn active_resolution(&self) -> Option<Resolution> {
        self.resolution
    }
}
