#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use zerocam::pipeline::{FrameBus, ReconfigCoordinator, SessionPolicy};
use zerocam::{FrameSource, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Configure(Resolution),
    Start,
    Stop,
    Capture(u64),
}

/// Test-side view of a [`MockSource`]
#[derive(Clone, Default)]
pub struct MockHandle {
    events: Arc<Mutex<Vec<Event>>>,
    active: Arc<Mutex<Option<Resolution>>>,
    fail_start: Arc<AtomicBool>,
    configure_delay_ms: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
}

impl MockHandle {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Events other than captures, in order
    pub fn lifecycle(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Capture(_)))
            .collect()
    }

    pub fn active(&self) -> Option<Resolution> {
        *self.active.lock().unwrap()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn configure_delay(&self, delay: Duration) {
        self.configure_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Camera double. Each frame payload is `<resolution>:<counter>` where the
/// counter increases across restarts, so capture order is visible to readers.
pub struct MockSource {
    handle: MockHandle,
    configured: Option<Resolution>,
    running: bool,
}

impl FrameSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, resolution: Resolution) -> Result<()> {
        if self.running {
            return Err(eyre!("configure while running"));
        }
        thread::sleep(Duration::from_millis(
            self.handle.configure_delay_ms.load(Ordering::SeqCst),
        ));
        self.handle.record(Event::Configure(resolution));
        self.configured = Some(resolution);
        *self.handle.active.lock().unwrap() = Some(resolution);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.handle.fail_start.load(Ordering::SeqCst) {
            return Err(eyre!("device busy"));
        }
        self.handle.record(Event::Start);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.handle.record(Event::Stop);
        }
        self.running = false;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Bytes> {
        if !self.running {
            return Err(eyre!("not running"));
        }
        let resolution = self.configured.ok_or_else(|| eyre!("not configured"))?;
        thread::sleep(Duration::from_millis(2));

        let n = self.handle.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.handle.record(Event::Capture(n));
        Ok(Bytes::from(format!("{resolution}:{n}")))
    }

    fn active_resolution(&self) -> Option<Resolution> {
        self.configured
    }
}

pub fn coordinator() -> (Arc<ReconfigCoordinator>, MockHandle) {
    let handle = MockHandle::default();
    let source = MockSource {
        handle: handle.clone(),
        configured: None,
        running: false,
    };
    let coordinator = ReconfigCoordinator::new(Box::new(source), Arc::new(FrameBus::new()), None);
    (Arc::new(coordinator), handle)
}

pub fn policy() -> SessionPolicy {
    SessionPolicy {
        retry_attempts: 5,
        retry_delay: Duration::from_millis(10),
        frame_timeout: Some(Duration::from_secs(2)),
        frame_interval: Duration::ZERO,
    }
}

/// Split a multipart part into its JPEG payload
pub fn payload(part: &[u8]) -> &[u8] {
    let start = part
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("part headers")
        + 4;
    &part[start..part.len() - 2]
}

/// Decode a mock payload into (resolution, counter)
pub fn parse_payload(part: &[u8]) -> (Resolution, u64) {
    let text = std::str::from_utf8(payload(part)).expect("utf8 payload");
    let (res, n) = text.split_once(':').expect("resolution:counter");
    (res.parse().unwrap(), n.parse().unwrap())
}

/// Read parts until `wanted` of them carry `target`, then drop the receiver
pub async fn collect_until(
    mut rx: mpsc::Receiver<Bytes>,
    target: Resolution,
    wanted: usize,
) -> Vec<(Resolution, u64)> {
    let mut seen = Vec::new();
    let mut hits = 0;
    while let Some(part) = rx.recv().await {
        let decoded = parse_payload(&part);
        seen.push(decoded);
        if decoded.0 == target {
            hits += 1;
            if hits == wanted {
                break;
            }
        }
    }
    seen
}
