//! Per-client MJPEG delivery loop

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::bus::FrameBus;
use crate::capture::Frame;
use crate::error::BusError;
use crate::StreamConfig;

/// Multipart boundary token, without the leading dashes
pub const BOUNDARY: &str = "FRAME";

/// `Content-Type` of the stream response
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=FRAME";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound half of a client connection
pub trait ChunkSink: Send {
    /// Write one multipart part. An error means the client is gone.
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

/// Body channel of a streaming HTTP response
impl ChunkSink for mpsc::Sender<Bytes> {
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            self.send(chunk)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
        }
    }
}

/// Retry and pacing rules for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Consecutive `SourceUnavailable` results tolerated before giving up
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Bound on a single wait; elapsing counts as `SourceUnavailable`
    pub frame_timeout: Option<Duration>,
    /// Minimum gap between two parts
    pub frame_interval: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for SessionPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            frame_timeout: (config.frame_timeout_ms > 0)
                .then(|| Duration::from_millis(config.frame_timeout_ms)),
            frame_interval: Duration::from_millis(config.frame_interval_ms),
        }
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Write failed: the client went away
    Disconnected,
    /// Retries exhausted without a frame
    SourceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    /// `SourceUnavailable` results seen over the whole session
    pub interruptions: u32,
    pub end: SessionEnd,
}

/// One streaming client. Tracks the last sequence it delivered so every
/// part it writes is strictly newer than the previous one.
pub struct StreamSession {
    id: u64,
    bus: Arc<FrameBus>,
    policy: SessionPolicy,
    last_seen: u64,
}

impl StreamSession {
    pub fn new(bus: Arc<FrameBus>, policy: SessionPolicy) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            bus,
            policy,
            last_seen: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver frames until the client disconnects or the source stays
    /// unavailable for longer than the retry policy allows.
    #[instrument(name = "stream_session", skip_all, fields(id = self.id))]
    pub async fn run<S: ChunkSink>(mut self, mut sink: S) -> SessionSummary {
        let _active = ActiveSession::enter();
        debug!("Stream session started");

        let mut frames = 0;
        let mut interruptions = 0;
        let mut failures = 0;

        let end = loop {
            match self.next_frame().await {
                Ok(frame) => {
                    failures = 0;
                    if let Err(e) = sink.write_chunk(encode_part(&frame)).await {
                        debug!("Write failed: {}", e);
                        break SessionEnd::Disconnected;
                    }
                    self.last_seen = frame.sequence();
                    frames += 1;

                    if !self.policy.frame_interval.is_zero() {
                        tokio::time::sleep(self.policy.frame_interval).await;
                    }
                }
                Err(BusError::SourceUnavailable) => {
                    interruptions += 1;
                    failures += 1;
                    if failures > self.policy.retry_attempts {
                        warn!(failures, "Frame source unavailable, ending stream");
                        break SessionEnd::SourceUnavailable;
                    }
                    debug!(failures, "Frame source unavailable, retrying");
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        };

        info!(frames, interruptions, ?end, "Stream session ended");
        SessionSummary {
            frames,
            interruptions,
            end,
        }
    }

    async fn next_frame(&self) -> Result<Frame, BusError> {
        let wait = self.bus.wait_for_next(self.last_seen);
        match self.policy.frame_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Err(BusError::SourceUnavailable)),
            None => wait.await,
        }
    }
}

/// Keeps the active session gauge honest even if the session future is dropped
struct ActiveSession;

impl ActiveSession {
    fn enter() -> Self {
        metrics::gauge!("zerocam_stream_sessions").increment(1.0);
        Self
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        metrics::gauge!("zerocam_stream_sessions").decrement(1.0);
    }
}

/// Encode one multipart part: boundary, part headers, JPEG body, CRLF
pub fn encode_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );

    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}
