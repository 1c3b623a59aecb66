use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ReconfigError;

/// JPEG-encoded frame with zero-copy semantics
#[derive(Clone, PartialEq)]
pub struct Frame {
    /// Immutable frame data - can be shared across sessions without copying
    pub data: Bytes,

    /// Resolution the source was configured for when the frame was captured
    pub resolution: Resolution,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    /// Publish order on the frame bus; 0 until published
    pub(crate) sequence: u64,
}

impl Frame {
    pub fn new(data: Bytes, resolution: Resolution) -> Self {
        Self {
            data,
            resolution,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("resolution", &self.resolution)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Capture resolutions the gateway accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::P480, Resolution::P720, Resolution::P1080];

    /// Output size as (width, height)
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P480 => (720, 480),
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ReconfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|res| res.as_str() == s)
            .ok_or_else(|| ReconfigError::InvalidResolution(s.to_owned()))
    }
}
