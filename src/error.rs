//! Error kinds shared by the capture pipeline and the HTTP gateway

/// Failures of a resolution change request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconfigError {
    /// Requested value is not one of the supported resolutions
    #[error("unsupported resolution '{0}', expected one of 480p, 720p, 1080p")]
    InvalidResolution(String),

    /// Another resolution change holds the capture pipeline
    #[error("a resolution change is already in progress")]
    InProgress,

    /// Camera driver refused to stop, reconfigure or restart
    #[error("capture device error: {0}")]
    Device(String),
}

/// Frame bus signals consumed by stream sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// No frames will arrive for this wait: the bus was paused or closed
    #[error("frame source unavailable")]
    SourceUnavailable,
}
