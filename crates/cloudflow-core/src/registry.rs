//! Action registry: maps action-type names to executable handlers and
//! flow templates to predeclared task sets.
//!
//! The registry is built once at process start and handed to the producer
//! and executor by `Arc`; after that it is read-only, so no further
//! synchronization is required.

use crate::domain::task::{ActionId, RetryPolicy};
use crate::executor::ActionHandler;
use crate::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

struct ActionEntry {
    handler: Arc<dyn ActionHandler>,
    default_retry: Option<RetryPolicy>,
}

/// One task slot in a flow template. Params are supplied per flow at
/// creation time, keyed by `action_id`.
#[derive(Debug, Clone)]
pub struct TemplateTask {
    /// Identifier the task will carry inside every flow built from the
    /// template
    pub action_id: ActionId,

    /// Registry key of the handler to run
    pub action_name: String,

    /// Predecessor action ids within the template
    pub depend_on: Vec<ActionId>,
}

impl TemplateTask {
    /// Build a template slot
    pub fn new(
        action_id: impl Into<ActionId>,
        action_name: impl Into<String>,
        depend_on: Vec<ActionId>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            action_name: action_name.into(),
            depend_on,
        }
    }
}

/// A named, predeclared task set
#[derive(Debug, Clone)]
pub struct FlowTemplate {
    /// Template name, the producer's lookup key
    pub name: String,

    /// Ordered task slots
    pub tasks: Vec<TemplateTask>,
}

/// Process-wide handler and template table, read-only after startup.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionEntry>,
    templates: HashMap<String, FlowTemplate>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its action name with an optional default
    /// retry policy applied to template-built tasks.
    pub fn register(
        &mut self,
        handler: Arc<dyn ActionHandler>,
        default_retry: Option<RetryPolicy>,
    ) {
        let name = handler.name().to_string();
        self.actions.insert(
            name,
            ActionEntry {
                handler,
                default_retry,
            },
        );
    }

    /// Register a flow template. Every slot's action name must already
    /// resolve to a handler.
    pub fn register_template(&mut self, template: FlowTemplate) -> Result<(), EngineError> {
        for slot in &template.tasks {
            if !self.contains(&slot.action_name) {
                return Err(EngineError::ActionNotFound(slot.action_name.clone()));
            }
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Resolve a handler by action name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ActionHandler>, EngineError> {
        self.actions
            .get(name)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| EngineError::ActionNotFound(name.to_string()))
    }

    /// Default retry policy recorded for an action name
    pub fn default_retry(&self, name: &str) -> Option<RetryPolicy> {
        self.actions.get(name).and_then(|e| e.default_retry.clone())
    }

    /// Whether a handler is registered under the name
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Look up a flow template by name
    pub fn template(&self, name: &str) -> Option<&FlowTemplate> {
        self.templates.get(name)
    }
}
