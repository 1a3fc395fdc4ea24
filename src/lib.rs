//!
//! Cloudflow - asynchronous task-flow engine for a multi-cloud resource
//! control plane
//!
//! The [`Engine`] ties the pieces of `cloudflow-core` together: a flow
//! store, an action registry, a producer for submitting flows, and a
//! background scheduler that drives them to completion.
//!
//! ```no_run
//! use cloudflow::{Engine, EngineConfig};
//! use cloudflow_core::MemoryFlowStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), cloudflow::EngineError> {
//! let engine = Engine::builder()
//!     .with_store(Arc::new(MemoryFlowStore::new()))
//!     .with_config(EngineConfig::load())
//!     .build()?;
//! engine.start();
//! // ... submit flows through engine.producer() ...
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use cloudflow_core::{
    ActionContext, ActionHandler, ActionRegistry, AddCustomFlowOption, AddTemplateFlowOption,
    CustomFlowTask, EngineConfig, EngineError, FailureMode, Flow, FlowId, FlowInfo, FlowKind,
    FlowStatus, FlowStore, FlowTemplate, Params, Producer, RetryPolicy, Scheduler, ShareData,
    Task, TaskStatus, TemplateFlowTask, TemplateTask, UpdateFlowStateOption,
};

#[cfg(feature = "postgres")]
pub use cloudflow_state_postgres as postgres;

/// Assembles an [`Engine`] from a store, handlers, templates and tuning.
#[derive(Default)]
pub struct EngineBuilder {
    registry: ActionRegistry,
    config: EngineConfig,
    store: Option<Arc<dyn FlowStore>>,
}

impl EngineBuilder {
    /// Start an empty builder
    pub fn new() -> Self {
        Self {
            registry: ActionRegistry::new(),
            config: EngineConfig::default(),
            store: None,
        }
    }

    /// Set the flow store backend (required)
    pub fn with_store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the default engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an action handler, optionally with a default retry
    /// policy for tasks built from templates.
    pub fn register_action(
        mut self,
        handler: Arc<dyn ActionHandler>,
        default_retry: Option<RetryPolicy>,
    ) -> Self {
        self.registry.register(handler, default_retry);
        self
    }

    /// Register a flow template; every slot must name an already
    /// registered action.
    pub fn register_template(mut self, template: FlowTemplate) -> Result<Self, EngineError> {
        self.registry.register_template(template)?;
        Ok(self)
    }

    /// Build the engine. Fails when no store was provided.
    pub fn build(self) -> Result<Engine, EngineError> {
        let store = self
            .store
            .ok_or_else(|| EngineError::Validation("engine requires a flow store".to_string()))?;
        let registry = Arc::new(self.registry);

        Ok(Engine {
            producer: Producer::new(store.clone(), registry.clone()),
            scheduler: Arc::new(Scheduler::new(store.clone(), registry, self.config)),
            store,
            shutdown: CancellationToken::new(),
            loop_handle: std::sync::Mutex::new(None),
        })
    }
}

/// A running task-flow engine: producer surface plus background
/// scheduler.
pub struct Engine {
    producer: Producer,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn FlowStore>,
    shutdown: CancellationToken,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The caller-facing create/update/query surface
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// The scheduler; exposed for single-stepping in tests and for
    /// embedding into custom runtimes.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The underlying store
    pub fn store(&self) -> Arc<dyn FlowStore> {
        self.store.clone()
    }

    /// Spawn the background scheduling loop. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        let mut handle = match self.loop_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handle.is_some() {
            return;
        }

        let scheduler = self.scheduler.clone();
        let token = self.shutdown.child_token();
        *handle = Some(tokio::spawn(async move {
            scheduler.run(token).await;
        }));
        info!("engine started");
    }

    /// Stop claiming, drain in-flight workers and wait for the loop to
    /// exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "scheduler loop panicked");
            }
        }
        info!("engine stopped");
    }

    /// Block until the flow reaches a terminal status, polling the
    /// store at `interval`, for at most `timeout`.
    pub async fn wait_for_flow(
        &self,
        id: &FlowId,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Flow, EngineError> {
        let store = self.store.clone();
        let keys = [id.clone()];
        let mut flows = cloudflow_core::poll_until_done(
            &keys,
            |keys: &[FlowId]| {
                let store = store.clone();
                let id = keys[0].clone();
                async move {
                    let flow = store
                        .get_flow(&id)
                        .await?
                        .ok_or_else(|| EngineError::FlowNotFound(id.to_string()))?;
                    Ok(vec![flow])
                }
            },
            |flows: &[Flow]| flows.iter().all(|f| f.status.is_terminal()),
            interval,
            timeout,
        )
        .await?;
        flows
            .pop()
            .ok_or_else(|| EngineError::FlowNotFound(id.to_string()))
    }
}
