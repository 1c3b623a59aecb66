pub mod bus;
pub mod coordinator;
pub mod session;

pub use bus::{BusStats, FrameBus};
pub use coordinator::{CaptureState, CaptureStatus, ReconfigCoordinator};
pub use session::{encode_part, ChunkSink, SessionEnd, SessionPolicy, SessionSummary, StreamSession};
