//! Flow create/update surface.
//!
//! Callers build flows either from a registered template or from an
//! explicit custom task list. Everything is validated against the
//! registry and the dependency graph before the first store write, so a
//! malformed definition is never persisted. The producer returns as soon
//! as the flow is durably accepted; outcomes are discovered by querying
//! flow and task status.

use crate::domain::flow::{Flow, FlowId, FlowKind, FlowStatus, ShareData};
use crate::domain::graph;
use crate::domain::store::FlowStore;
use crate::domain::task::{ActionId, RetryPolicy, Task};
use crate::registry::ActionRegistry;
use crate::{EngineError, Params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Per-flow inputs for one slot of a template flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFlowTask {
    /// Template slot this payload belongs to
    pub action_id: ActionId,

    /// Payload handed to the slot's handler
    #[serde(default = "Params::null")]
    pub params: Params,
}

/// Request to build a flow from a registered template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTemplateFlowOption {
    /// Template name; also becomes the flow name
    pub name: String,

    /// Per-slot payloads, keyed by `action_id`. Slots without an entry
    /// run with null params.
    #[serde(default)]
    pub tasks: Vec<TemplateFlowTask>,

    /// Initial share data visible to every task
    #[serde(default)]
    pub share_data: ShareData,

    /// Free-form annotation carried on the flow
    #[serde(default)]
    pub memo: Option<String>,

    /// When set, the flow is persisted but held back from scheduling
    /// until released through [`Producer::update_flow_state`].
    #[serde(default)]
    pub is_init_state: bool,
}

/// One task of a custom flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFlowTask {
    /// Flow-unique task identifier
    pub action_id: ActionId,

    /// Registry key of the handler to run
    pub action_name: String,

    /// Predecessor action ids
    #[serde(default)]
    pub depend_on: Vec<ActionId>,

    /// Payload handed to the handler
    #[serde(default = "Params::null")]
    pub params: Params,

    /// Retry policy; falls back to the handler's registered default,
    /// then to a single attempt
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Request to build a flow from an explicit task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddCustomFlowOption {
    /// Label for the flow
    pub name: String,

    /// The full task set; never extended after creation
    pub tasks: Vec<CustomFlowTask>,

    /// Initial share data visible to every task
    #[serde(default)]
    pub share_data: ShareData,

    /// Free-form annotation carried on the flow
    #[serde(default)]
    pub memo: Option<String>,

    /// When set, the flow is persisted but held back from scheduling
    /// until released through [`Producer::update_flow_state`].
    #[serde(default)]
    pub is_init_state: bool,
}

/// One entry of a batch flow-status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInfo {
    /// Flow to update
    pub id: FlowId,

    /// Target status
    pub status: FlowStatus,
}

/// Batch release/update of flows created with `is_init_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFlowStateOption {
    /// Per-flow target statuses
    pub flow_infos: Vec<FlowInfo>,
}

/// The engine's caller-facing create/update surface.
pub struct Producer {
    store: Arc<dyn FlowStore>,
    registry: Arc<ActionRegistry>,
}

impl Producer {
    /// Create a producer over a store and registry
    pub fn new(store: Arc<dyn FlowStore>, registry: Arc<ActionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Build and persist a flow from a registered template. Slot params
    /// are matched by `action_id`; unknown ids are rejected.
    pub async fn add_template_flow(
        &self,
        opt: AddTemplateFlowOption,
    ) -> Result<FlowId, EngineError> {
        if opt.name.trim().is_empty() {
            return Err(EngineError::Validation("flow name is required".to_string()));
        }
        let template = self
            .registry
            .template(&opt.name)
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown flow template: {}", opt.name))
            })?
            .clone();

        let mut params: HashMap<ActionId, Params> = HashMap::with_capacity(opt.tasks.len());
        for task in opt.tasks {
            if task.action_id.0.trim().is_empty() {
                return Err(EngineError::Validation(
                    "task action_id is required".to_string(),
                ));
            }
            if !template.tasks.iter().any(|s| s.action_id == task.action_id) {
                return Err(EngineError::Validation(format!(
                    "action_id {} is not part of template {}",
                    task.action_id, opt.name
                )));
            }
            if params.insert(task.action_id.clone(), task.params).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate params for action_id {}",
                    task.action_id
                )));
            }
        }

        let tasks: Vec<Task> = template
            .tasks
            .iter()
            .map(|slot| {
                Task::new(
                    slot.action_id.clone(),
                    slot.action_name.clone(),
                    slot.depend_on.clone(),
                    params.remove(&slot.action_id).unwrap_or_else(Params::null),
                    self.registry.default_retry(&slot.action_name),
                )
            })
            .collect();

        self.persist(
            opt.name,
            FlowKind::Template,
            tasks,
            opt.share_data,
            opt.memo,
            opt.is_init_state,
        )
        .await
    }

    /// Validate and persist a flow from an explicit task list.
    pub async fn add_custom_flow(&self, opt: AddCustomFlowOption) -> Result<FlowId, EngineError> {
        if opt.name.trim().is_empty() {
            return Err(EngineError::Validation("flow name is required".to_string()));
        }

        let mut tasks = Vec::with_capacity(opt.tasks.len());
        for task in opt.tasks {
            if task.action_id.0.trim().is_empty() {
                return Err(EngineError::Validation(
                    "task action_id is required".to_string(),
                ));
            }
            if !self.registry.contains(&task.action_name) {
                return Err(EngineError::Validation(format!(
                    "task {} references unregistered action {}",
                    task.action_id, task.action_name
                )));
            }
            let retry = task
                .retry
                .or_else(|| self.registry.default_retry(&task.action_name));
            tasks.push(Task::new(
                task.action_id,
                task.action_name,
                task.depend_on,
                task.params,
                retry,
            ));
        }

        self.persist(
            opt.name,
            FlowKind::Custom,
            tasks,
            opt.share_data,
            opt.memo,
            opt.is_init_state,
        )
        .await
    }

    /// Batch status update; the release path for init-state flows. Each
    /// target must be a transition the flow state machine allows.
    pub async fn update_flow_state(&self, opt: UpdateFlowStateOption) -> Result<(), EngineError> {
        if opt.flow_infos.is_empty() {
            return Err(EngineError::Validation(
                "flow_infos is required".to_string(),
            ));
        }
        for info in &opt.flow_infos {
            self.store.set_flow_status(&info.id, info.status).await?;
        }
        Ok(())
    }

    /// Request cancellation. In-flight attempts drain; nothing further
    /// is claimed. A flow that never started is cancelled outright.
    pub async fn cancel_flow(&self, id: &FlowId) -> Result<(), EngineError> {
        let flow = self
            .store
            .get_flow(id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(id.to_string()))?;

        let target = match flow.status {
            FlowStatus::Pending => FlowStatus::Cancelled,
            _ => FlowStatus::Cancelling,
        };
        self.store.set_flow_status(id, target).await?;
        info!(flow = %id, status = ?target, "flow cancellation requested");
        Ok(())
    }

    /// Fetch a flow by id
    pub async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError> {
        self.store.get_flow(id).await
    }

    /// Fetch a flow's tasks
    pub async fn get_tasks(&self, id: &FlowId) -> Result<Vec<Task>, EngineError> {
        self.store.get_tasks(id).await
    }

    /// List flows, optionally filtered by status
    pub async fn list_flows(&self, status: Option<FlowStatus>) -> Result<Vec<Flow>, EngineError> {
        self.store.list_flows(status).await
    }

    async fn persist(
        &self,
        name: String,
        kind: FlowKind,
        tasks: Vec<Task>,
        share_data: ShareData,
        memo: Option<String>,
        is_init_state: bool,
    ) -> Result<FlowId, EngineError> {
        graph::validate(&tasks)?;

        let flow = Flow::new(name, kind, share_data)
            .with_memo(memo)
            .with_init_state(is_init_state);
        let id = flow.id.clone();
        let task_count = tasks.len();

        self.store.create_flow(flow, tasks).await?;
        info!(flow = %id, kind = ?kind, tasks = task_count, gated = is_init_state, "flow accepted");
        Ok(id)
    }
}
