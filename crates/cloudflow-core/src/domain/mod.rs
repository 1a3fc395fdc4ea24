/// Flow domain model and status machine
pub mod flow;

/// Task domain model, retry policies and backoff
pub mod task;

/// Dependency-graph validation and resolution
pub mod graph;

/// Persistence interface and in-memory implementation
pub mod store;
