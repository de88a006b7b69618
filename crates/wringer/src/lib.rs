//! wringer - start/stop stress harness for continuous capture
//!
//! Wrings capture sessions through endless configure/capture/teardown
//! cycles while a `poisonpool::BufferPool` quarantines every released
//! frame buffer. A driver thread that keeps writing after teardown
//! corrupts the poison pattern and fails the run.
//!
//! Modules:
//! - `device`: the capture device contract and display modes
//! - `sink`: device notifications condensed into a restart latch
//! - `session`: the per-device capture state machine
//! - `orchestrator`: runs N sessions, converges them on abort
//! - `sim`: scripted in-process devices, including the saboteur

pub mod device;
pub mod orchestrator;
pub mod sim;
pub mod sink;
pub mod session;

pub use device::{AudioParams, CaptureDevice, DeviceError, DisplayMode};
pub use orchestrator::{Orchestrator, RunGroup, RunReport};
pub use session::{CaptureSession, SessionConfig, SessionStats};
pub use sim::{Sabotage, SimDevice, SimScript};
pub use sink::{NotificationSink, RestartLatch, RestartReason};
