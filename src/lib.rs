//! Taskpump Background Task Engine
//!
//! Frame-friendly background task execution for an interactive frontend:
//! tasks are pushed per kind, advanced either cooperatively from the main
//! loop or on worker threads, and report completion through exactly-once
//! callbacks on the main-loop thread.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod kinds;
pub mod location;
pub mod pump;
pub mod queue;
pub mod retrieve;
pub mod task;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use engine::TaskEngine;
pub use error::{EngineError, PushError, QueueError, TaskError};
pub use kinds::autoconfig::{ConnectRequest, DeviceProfile, ProfileRegistry};
pub use kinds::discovery::{DiscoveryBackend, LobbyDiscoveryBackend};
pub use kinds::screenshot::Framebuffer;
pub use location::{LocationDriver, LocationState, NullLocationDriver, Position};
pub use pump::PumpMode;
pub use queue::TaskView;
pub use retrieve::TransferStatus;
pub use task::{
    OverlayData, Payload, Progress, StepOutcome, TaskCallback, TaskContext, TaskHandler, TaskId,
    TaskKind, TaskOutcome, TaskReport, TaskSpec, TaskState, WifiNetwork,
};
