//! Scene monitoring: signal arbitration and the threads that drive it.
//!
//! This module provides:
//! - The scene state machine (`arbiter`)
//! - Debouncers and arbiter bundled per monitoring run (`session`)
//! - Messages between GUI, control thread and workers (`events`)
//! - The capture and scoring worker (`worker`)
//! - The control thread (`runner`)

pub mod arbiter;
pub mod events;
pub mod runner;
pub mod session;
pub mod worker;

pub use arbiter::{SceneRole, SceneSink};
pub use events::{
    ControlCommand, ControlMessage, DetectionStatus, LogEntry, LogLevel, ObsStatus, StatusEvent,
    create_channels,
};
pub use runner::spawn_control;
