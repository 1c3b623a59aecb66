//! Dedicated capture thread feeding the frame bus

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use crossbeam::channel;
use tracing::{debug, info, warn};

use super::frame::{Frame, Resolution};
use super::source::FrameSource;
use crate::pipeline::FrameBus;

/// Back-off after a failed capture call
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Running capture loop. Owns the source until [`CaptureWorker::stop`]
/// hands it back.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Option<Box<dyn FrameSource>>>,
}

/// The capture thread could not be created; the source is handed back
pub struct SpawnFailure {
    pub error: io::Error,
    pub source: Option<Box<dyn FrameSource>>,
}

impl CaptureWorker {
    /// Spawn the capture thread for a started source
    pub fn spawn(
        source: Box<dyn FrameSource>,
        bus: Arc<FrameBus>,
        resolution: Resolution,
        cpu_core: Option<usize>,
    ) -> Result<Self, SpawnFailure> {
        let builder = thread::Builder::new().name("capture".into());
        Self::spawn_with(builder, source, bus, resolution, cpu_core)
    }

    fn spawn_with(
        builder: thread::Builder,
        source: Box<dyn FrameSource>,
        bus: Arc<FrameBus>,
        resolution: Resolution,
        cpu_core: Option<usize>,
    ) -> Result<Self, SpawnFailure> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        // The source travels through a channel so a failed spawn can reclaim it
        let (handoff, inbox) = channel::bounded::<Box<dyn FrameSource>>(1);
        let reclaim = inbox.clone();
        if let Err(channel::SendError(source)) = handoff.send(source) {
            return Err(SpawnFailure {
                error: io::Error::other("capture hand-off closed"),
                source: Some(source),
            });
        }

        let spawned = builder.spawn(move || {
            let source = inbox.recv().ok()?;
            pin_to_core(cpu_core);
            Some(capture_loop(source, &bus, resolution, &flag))
        });

        match spawned {
            Ok(handle) => Ok(Self { stop, handle }),
            Err(error) => Err(SpawnFailure {
                error,
                source: reclaim.try_recv().ok(),
            }),
        }
    }

    /// Signal the loop to exit and wait for it. Blocks for at most one
    /// in-flight `capture_frame` call.
    pub fn stop(self) -> Result<Box<dyn FrameSource>> {
        self.stop.store(true, Ordering::Release);
        self.handle
            .join()
            .map_err(|_| eyre!("Capture thread panicked; source lost"))?
            .ok_or_else(|| eyre!("Capture thread never received the source"))
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    bus: &FrameBus,
    resolution: Resolution,
    stop: &AtomicBool,
) -> Box<dyn FrameSource> {
    info!(source = source.name(), %resolution, "Capture loop running");
    let mut captured: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        match source.capture_frame() {
            Ok(data) => {
                if bus.publish(Frame::new(data, resolution)).is_err() {
                    debug!("Frame bus gate closed, leaving capture loop");
                    break;
                }
                captured += 1;
            }
            Err(e) => {
                warn!("Capture error: {:#}", e);
                thread::sleep(CAPTURE_RETRY_DELAY);
            }
        }
    }

    info!(captured, "Capture loop stopped");
    source
}

fn pin_to_core(cpu_core: Option<usize>) {
    let Some(core) = cpu_core else {
        return;
    };

    let target = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core));
    match target {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!(core, "Capture thread pinned");
        }
        _ => warn!(core, "Unable to pin capture thread"),
    }
}
