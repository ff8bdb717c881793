//! # Vdpflow
//!
//! Fault-tolerant orchestration for the VDP content-extraction pipeline.
//!
//! Items move through six stages (`ingest`, `fetch_media`, `vdp_extract`,
//! `enrich_complete`, `load_bq`, `finalize`). Each stage runs as a saga:
//!
//! - **Sagas**: ordered forward steps, reverse-order compensation on failure
//! - **Health-checked router**: redundant extraction backends behind
//!   per-backend circuit breakers
//! - **Dead-letter queue**: classifies terminal failures as `retry`,
//!   `manual` or `discard`
//! - **Pipeline state machine**: single-flight per content key, retries
//!   with backoff
//! - **Consensus gate**: out-of-band approval of pipeline changes, with a
//!   rollback plan for approved ones
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vdpflow::prelude::*;
//!
//! let config = OrchestratorConfig::from_file("vdpflow.json")?;
//! let registry = BreakerRegistry::new();
//! let router = Arc::new(config.http_router(&registry)?);
//!
//! let plan = VdpStagePlan::standard(VdpCollaborators { media, warehouse, router });
//! let dlq = Arc::new(DeadLetterQueue::new(config.dlq.clone(), Arc::new(LoggingDlqSink)));
//! let orchestrator = PipelineOrchestrator::new(
//!     Arc::new(plan),
//!     Arc::new(InMemoryItemRepository::new()),
//!     dlq,
//! );
//!
//! let item = orchestrator
//!     .ingest(IngestRequest::new("youtube", "abc123", "https://youtu.be/abc123"))
//!     .await?;
//! let done = orchestrator
//!     .process_with_retry(&item.content_key, Arc::new(CancellationToken::new()))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod consensus;
pub mod core;
pub mod dlq;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod saga;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{run_time_boxed, CancellationToken};
    pub use crate::config::OrchestratorConfig;
    pub use crate::consensus::{
        AgentProposal, AgentRole, ConsensusGate, ConsensusPolicy, ConsensusResult, Decision,
        RollbackPlan, RollbackTargets, SloImpact,
    };
    pub use crate::core::{EventType, ItemStatus, OutboxEvent, PipelineStage};
    pub use crate::dlq::{
        DeadLetterQueue, DlqConfig, DlqMessage, DlqPolicy, DlqSink, InMemoryDlqSink,
        JsonLinesDlqSink, LoggingDlqSink,
    };
    pub use crate::errors::{FailureKind, Result, ValidationError, VdpflowError};
    pub use crate::events::{ChannelEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        FlightMode, InMemoryItemRepository, IngestRequest, ItemRepository, MediaStore,
        PipelineItem, PipelineOrchestrator, StagePlan, VdpCollaborators, VdpStagePlan, Warehouse,
    };
    #[cfg(feature = "http")]
    pub use crate::resilience::HttpBackend;
    pub use crate::resilience::{
        Backend, BackendConfig, BreakerConfig, BreakerRegistry, CircuitBreaker,
        ExtractionRequest, HealthCheckedRouter, RouterConfig,
    };
    pub use crate::saga::{CompensationAction, CompensationExecutor, SagaStep, SagaTransaction};
    pub use std::sync::Arc;
}
