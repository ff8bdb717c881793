//! Core domain model types for vdpflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Pipeline stage and item status enums
//! - Typed outbox events

mod event;
mod stage;

pub use event::{EventType, OutboxEvent};
pub use stage::{ItemStatus, PipelineStage};
