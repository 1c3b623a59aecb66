//! Serialises resolution changes against the running capture loop

use std::sync::Arc;

use arc_swap::ArcSwap;
use color_eyre::eyre::WrapErr;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use super::bus::FrameBus;
use crate::capture::worker::SpawnFailure;
use crate::capture::{CaptureWorker, FrameSource, Resolution};
use crate::error::ReconfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Stopped,
    Running,
    Reconfiguring,
}

/// Snapshot of the capture pipeline, readable without taking the device lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    /// Resolution of the current (or last attempted) capture session
    pub resolution: Option<Resolution>,
    /// Device error that left capture stopped
    pub last_error: Option<String>,
}

/// Who holds the source right now
#[derive(Default)]
struct Device {
    /// Present while capture is stopped
    idle: Option<Box<dyn FrameSource>>,
    /// Present while capture is running
    worker: Option<CaptureWorker>,
}

/// Owns the frame source and is the only component allowed to stop, configure
/// or start it. At most one request holds the device at a time; a request
/// arriving while another is in flight fails with `InProgress`.
///
/// The device work runs on its own task, so a caller that gives up (client
/// disconnect, timeout) never leaves the pipeline half reconfigured.
pub struct ReconfigCoordinator {
    shared: Arc<Shared>,
    device: Arc<Mutex<Device>>,
}

/// State the device task needs besides the device itself
struct Shared {
    bus: Arc<FrameBus>,
    status: ArcSwap<CaptureStatus>,
    cpu_core: Option<usize>,
}

impl ReconfigCoordinator {
    /// Take ownership of a stopped source. The bus stays closed until
    /// [`ReconfigCoordinator::start`] succeeds.
    pub fn new(source: Box<dyn FrameSource>, bus: Arc<FrameBus>, cpu_core: Option<usize>) -> Self {
        bus.close();
        let status = CaptureStatus {
            state: CaptureState::Stopped,
            resolution: source.active_resolution(),
            last_error: None,
        };

        Self {
            shared: Arc::new(Shared {
                bus,
                status: ArcSwap::from_pointee(status),
                cpu_core,
            }),
            device: Arc::new(Mutex::new(Device {
                idle: Some(source),
                worker: None,
            })),
        }
    }

    pub fn bus(&self) -> &Arc<FrameBus> {
        &self.shared.bus
    }

    pub fn status(&self) -> Arc<CaptureStatus> {
        self.shared.status.load_full()
    }

    /// Configure and start capture
    pub async fn start(&self, resolution: Resolution) -> Result<(), ReconfigError> {
        self.restart(resolution).await
    }

    /// Parse a client-supplied resolution and apply it. Invalid input is
    /// rejected before the device is touched.
    pub async fn request_resolution(&self, requested: &str) -> Result<Resolution, ReconfigError> {
        let resolution = requested.parse::<Resolution>()?;
        self.change_resolution(resolution).await?;
        Ok(resolution)
    }

    /// Stop capture, reconfigure the source and start it again.
    ///
    /// No frame is published between the start and the end of the change.
    /// Waiting sessions receive `SourceUnavailable` once and then park until
    /// the first frame at the new resolution. On device failure capture stays
    /// stopped until a later request succeeds. Dropping the returned future
    /// does not abort a change that already holds the device.
    pub async fn change_resolution(&self, resolution: Resolution) -> Result<(), ReconfigError> {
        self.restart(resolution).await
    }

    async fn restart(&self, resolution: Resolution) -> Result<(), ReconfigError> {
        let device = self.device.clone().try_lock_owned().map_err(|_| {
            warn!(%resolution, "Rejecting resolution change, another one is in flight");
            ReconfigError::InProgress
        })?;

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.restart(device, resolution).await })
            .await
            .map_err(|e| ReconfigError::Device(format!("reconfiguration task failed: {e}")))?
    }

    /// Stop capture for good and release the device. Waits for an in-flight
    /// reconfiguration instead of rejecting.
    pub async fn shutdown(&self) -> Result<(), ReconfigError> {
        let device = self.device.clone().lock_owned().await;
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.shutdown(device).await })
            .await
            .map_err(|e| ReconfigError::Device(format!("shutdown task failed: {e}")))?
    }
}

impl Shared {
    #[instrument(skip(self, device))]
    async fn restart(
        &self,
        mut device: OwnedMutexGuard<Device>,
        resolution: Resolution,
    ) -> Result<(), ReconfigError> {
        let from = self.status.load().resolution;
        info!(from = ?from, to = %resolution, "Reconfiguring capture");
        self.set_status(CaptureState::Reconfiguring, Some(resolution), None);
        self.bus.pause();

        let source = match take_source(&mut device).await {
            Ok(source) => source,
            Err(e) => return Err(self.fail(resolution, e)),
        };

        let (source, applied) = run_blocking(move || {
            let mut source = source;
            let applied = apply_resolution(source.as_mut(), resolution);
            if applied.is_err() {
                let _ = source.stop();
            }
            (source, applied)
        })
        .await
        .map_err(|e| self.fail(resolution, e))?;

        if let Err(e) = applied {
            device.idle = Some(source);
            return Err(self.fail(resolution, ReconfigError::Device(format!("{e:#}"))));
        }

        // Resume before spawning: the loop exits on its first rejected publish
        self.bus.resume();
        match CaptureWorker::spawn(source, self.bus.clone(), resolution, self.cpu_core) {
            Ok(worker) => device.worker = Some(worker),
            Err(SpawnFailure { error, source }) => {
                if let Some(mut source) = source {
                    let _ = source.stop();
                    device.idle = Some(source);
                }
                return Err(self.fail(
                    resolution,
                    ReconfigError::Device(format!("failed to spawn capture thread: {error}")),
                ));
            }
        }

        self.set_status(CaptureState::Running, Some(resolution), None);
        metrics::counter!("zerocam_reconfigurations_total", "outcome" => "ok").increment(1);
        info!(%resolution, "Capture running");
        Ok(())
    }

    async fn shutdown(&self, mut device: OwnedMutexGuard<Device>) -> Result<(), ReconfigError> {
        self.bus.close();

        let mut source = take_source(&mut device).await?;
        let (source, stopped) = run_blocking(move || {
            let stopped = source.stop();
            (source, stopped)
        })
        .await?;
        device.idle = Some(source);

        let resolution = self.status.load().resolution;
        self.set_status(CaptureState::Stopped, resolution, None);
        stopped.map_err(|e| ReconfigError::Device(format!("{e:#}")))?;
        info!("Capture shut down");
        Ok(())
    }

    /// Leave capture stopped after a failed request
    fn fail(&self, resolution: Resolution, err: ReconfigError) -> ReconfigError {
        error!(%resolution, "Reconfiguration failed: {}", err);
        self.bus.close();
        self.set_status(CaptureState::Stopped, Some(resolution), Some(err.to_string()));
        metrics::counter!("zerocam_reconfigurations_total", "outcome" => "error").increment(1);
        err
    }

    fn set_status(&self, state: CaptureState, resolution: Option<Resolution>, last_error: Option<String>) {
        self.status.store(Arc::new(CaptureStatus {
            state,
            resolution,
            last_error,
        }));
    }
}

fn apply_resolution(source: &mut dyn FrameSource, resolution: Resolution) -> color_eyre::Result<()> {
    source.stop().wrap_err("Failed to stop capture")?;
    source
        .configure(resolution)
        .wrap_err_with(|| format!("Failed to configure {resolution}"))?;
    source.start().wrap_err("Failed to restart capture")
}

/// Reclaim the source from whichever side currently owns it
async fn take_source(device: &mut Device) -> Result<Box<dyn FrameSource>, ReconfigError> {
    if let Some(worker) = device.worker.take() {
        return run_blocking(move || worker.stop())
            .await?
            .map_err(|e| ReconfigError::Device(format!("{e:#}")));
    }
    device
        .idle
        .take()
        .ok_or_else(|| ReconfigError::Device("capture device lost".into()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ReconfigError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReconfigError::Device(format!("device task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use color_eyre::{eyre::eyre, Result};

    use super::*;

    /// Emits a tiny fake JPEG every millisecond, optionally refusing to start
    struct StubSource {
        resolution: Option<Resolution>,
        running: bool,
        fail_start: bool,
    }

    impl FrameSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        fn configure(&mut self, resolution: Resolution) -> Result<()> {
            self.resolution = Some(resolution);
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(eyre!("device busy"));
            }
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.running = false;
            Ok(())
        }

        fn capture_frame(&mut self) -> Result<Bytes> {
            if !self.running {
                return Err(eyre!("not started"));
            }
            std::thread::sleep(Duration::from_millis(1));
            Ok(Bytes::from_static(b"\xFF\xD8\xFF\xD9"))
        }

        fn active_resolution(&self) -> Option<Resolution> {
            self.resolution
        }
    }

    fn coordinator(fail_start: bool) -> ReconfigCoordinator {
        let source = StubSource {
            resolution: None,
            running: false,
            fail_start,
        };
        ReconfigCoordinator::new(Box::new(source), Arc::new(FrameBus::new()), None)
    }

    #[tokio::test]
    async fn starts_stopped_with_closed_bus() {
        let coord = coordinator(false);
        assert_eq!(coord.status().state, CaptureState::Stopped);
        assert!(!coord.bus().is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_change_resolution() {
        let coord = coordinator(false);
        coord.start(Resolution::P720).await.unwrap();
        assert_eq!(coord.status().state, CaptureState::Running);

        let frame = coord.bus().wait_for_next(0).await.unwrap();
        assert_eq!(frame.resolution, Resolution::P720);

        assert_eq!(coord.request_resolution("1080p").await.unwrap(), Resolution::P1080);
        let status = coord.status();
        assert_eq!(status.state, CaptureState::Running);
        assert_eq!(status.resolution, Some(Resolution::P1080));

        let frame = coord.bus().wait_for_next(frame.sequence()).await.unwrap();
        assert_eq!(frame.resolution, Resolution::P1080);

        coord.shutdown().await.unwrap();
        assert_eq!(coord.status().state, CaptureState::Stopped);
    }

    #[tokio::test]
    async fn invalid_resolution_leaves_state_alone() {
        let coord = coordinator(false);
        let err = coord.request_resolution("4k").await.unwrap_err();
        assert_eq!(err, ReconfigError::InvalidResolution("4k".into()));
        assert_eq!(coord.status().state, CaptureState::Stopped);
        assert_eq!(coord.status().last_error, None);
    }

    #[tokio::test]
    async fn device_failure_leaves_capture_stopped() {
        let coord = coordinator(true);
        let err = coord.start(Resolution::P480).await.unwrap_err();
        assert!(matches!(err, ReconfigError::Device(ref msg) if msg.contains("device busy")));

        let status = coord.status();
        assert_eq!(status.state, CaptureState::Stopped);
        assert!(status.last_error.is_some());
        assert!(!coord.bus().is_open());
        assert!(coord.bus().wait_for_next(0).await.is_err());
    }

    #[tokio::test]
    async fn held_device_rejects_second_request() {
        let coord = coordinator(false);
        let _held = coord.device.lock().await;
        assert_eq!(
            coord.change_resolution(Resolution::P720).await,
            Err(ReconfigError::InProgress)
        );
    }
}
