//! Testing utilities for vdpflow orchestration.
//!
//! This module provides:
//! - Scripted extraction backends
//! - Recording media store, warehouse and compensator fakes
//! - Saga step builders that log execution order

mod backends;
mod collaborators;
mod steps;

pub use backends::ScriptedBackend;
pub use collaborators::{RecordingCompensator, RecordingMediaStore, RecordingWarehouse};
pub use steps::{failing_step, recording_step, ExecutionLog};
