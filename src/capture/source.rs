use bytes::Bytes;
use color_eyre::Result;
use tracing::info;

use super::frame::Resolution;
use super::synthetic::SyntheticSource;
use crate::{CaptureConfig, SourceKind};

/// Camera device seen by the capture pipeline.
///
/// Every call may block on the driver. The coordinator only reconfigures a
/// stopped source, and `capture_frame` is only called between `start` and `stop`.
pub trait FrameSource: Send + 'static {
    /// Short label for logs
    fn name(&self) -> &str;

    /// Apply a new output size; the source must be stopped
    fn configure(&mut self, resolution: Resolution) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Stop capturing; a no-op on a stopped source
    fn stop(&mut self) -> Result<()>;

    /// Block until the next JPEG frame is available
    fn capture_frame(&mut self) -> Result<Bytes>;

    /// Resolution of the last successful `configure`
    fn active_resolution(&self) -> Option<Resolution>;
}

/// Build the frame source selected in configuration
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    info!(source = ?config.source, "Opening frame source");

    match config.source {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(
            config.fps,
            config.jpeg_quality,
        ))),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(super::v4l2::V4l2Source::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(color_eyre::eyre::eyre!(
            "V4L2 capture requested but zerocam was built without the `v4l2` feature"
        )),
    }
}
