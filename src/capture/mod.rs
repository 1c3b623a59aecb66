pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod worker;

pub use frame::{Frame, Resolution};
pub use source::{open_source, FrameSource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
pub use worker::CaptureWorker;
