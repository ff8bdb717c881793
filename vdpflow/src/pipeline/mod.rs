//! Item processing.
//!
//! This module provides:
//! - The pipeline item and its state machine
//! - Item repositories
//! - Single-flight claims per content key
//! - Stage plans mapping each stage to saga steps
//! - The orchestrator driving items through the stages

mod item;
mod orchestrator;
mod plan;
mod repository;
mod single_flight;
mod vdp_plan;


pub use item::{ItemError, PipelineItem};
pub use orchestrator::{IngestRequest, PipelineOrchestrator, SUPPORTED_PLATFORMS};
pub use plan::{StageContext, StagePlan};
pub use repository::{InMemoryItemRepository, ItemRepository};
pub use single_flight::{FlightGuard, FlightMode, SingleFlight};
pub use vdp_plan::{
    CollaboratorCompensator, MediaStore, VdpCollaborators, VdpStagePlan, Warehouse,
    DEFAULT_TABLE,
};
