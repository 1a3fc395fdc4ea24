//!
//! Cloudflow Core - the asynchronous task-flow engine
//!
//! This crate defines the flow and task domain models, the persistence
//! interface, and the scheduling machinery that drives multi-step cloud
//! operations to completion: dependency resolution, claim-based dispatch
//! with bounded concurrency, retry with backoff, share-data propagation,
//! and a poll-until-done helper for eventually consistent vendor APIs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flows, tasks, graphs and the store interface
pub mod domain;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

/// Action executor and handler trait
pub mod executor;

/// Eventual-consistency polling helper
pub mod poller;

/// Flow create/update surface
pub mod producer;

/// Handler and template registry
pub mod registry;

/// Scheduling and dispatch loop
pub mod scheduler;

/// Core types
pub mod types;

// Re-export key types
pub use config::{EngineConfig, FailureMode};
pub use error::EngineError;
pub use types::Params;

pub use domain::flow::{Flow, FlowId, FlowKind, FlowStatus, ShareData};
pub use domain::store::FlowStore;
pub use domain::task::{ActionId, Backoff, RetryPolicy, Task, TaskStatus};
pub use executor::{ActionContext, ActionExecutor, ActionHandler, ActionOutcome};
pub use poller::poll_until_done;
pub use producer::{
    AddCustomFlowOption, AddTemplateFlowOption, CustomFlowTask, FlowInfo, Producer,
    TemplateFlowTask, UpdateFlowStateOption,
};
pub use registry::{ActionRegistry, FlowTemplate, TemplateTask};
pub use scheduler::Scheduler;

#[cfg(feature = "testing")]
pub use domain::store::memory::MemoryFlowStore;
