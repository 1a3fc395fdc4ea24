//! Action executor: invokes the handler registered for a claimed task.
//!
//! The executor resolves handlers by the action name recorded on the task,
//! so it never depends on the registry's template metadata. Handler errors
//! are captured in the returned outcome, not propagated; the scheduler
//! decides between retry and terminal failure.

use crate::domain::flow::ShareData;
use crate::domain::task::Task;
use crate::registry::ActionRegistry;
use crate::{EngineError, Params};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A unit of executable work, registered by name.
///
/// Handlers are where vendor adaptors get called; the engine treats them
/// as arbitrary fallible remote operations. Long-running cloud-side
/// provisioning is absorbed inside the handler with
/// [`poll_until_done`](crate::poller::poll_until_done).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key for this handler
    fn name(&self) -> &str;

    /// Run one attempt. The returned value is recorded as the task
    /// result; share-data writes go through the context.
    async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError>;
}

impl std::fmt::Debug for dyn ActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandler")
            .field("name", &self.name())
            .finish()
    }
}

/// Per-attempt view handed to a handler: the task's params, a read
/// snapshot of the flow's share data, and a write buffer whose contents
/// are merged back only when the attempt succeeds.
pub struct ActionContext {
    params: Params,
    share: ShareData,
    patch: ShareData,
}

impl ActionContext {
    /// Build a context from a task's params and a share-data snapshot
    pub fn new(params: Params, share: ShareData) -> Self {
        Self {
            params,
            share,
            patch: ShareData::new(),
        }
    }

    /// The task's opaque payload
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Decode the payload into the handler's parameter type
    pub fn decode_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        self.params
            .decode()
            .map_err(|e| EngineError::Validation(format!("params: {}", e)))
    }

    /// Read a share-data key: pending writes from this attempt shadow
    /// the snapshot.
    pub fn share(&self, key: &str) -> Option<&serde_json::Value> {
        self.patch.get(key).or_else(|| self.share.get(key))
    }

    /// Stage a share-data write for downstream tasks
    pub fn set_share(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.patch.set(key, value);
    }

    fn into_patch(self) -> ShareData {
        self.patch
    }
}

/// Outcome of one task attempt
pub struct ActionOutcome {
    /// Handler result or captured error
    pub result: Result<Option<Params>, EngineError>,

    /// Share-data writes staged by the attempt; empty on failure
    pub share_patch: ShareData,
}

/// Invokes registered handlers for claimed tasks.
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
}

impl ActionExecutor {
    /// Create an executor over a registry
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one attempt of a claimed task against a share-data
    /// snapshot. A missing handler surfaces like any other handler
    /// failure so the task's retry policy applies.
    pub async fn execute(&self, task: &Task, share: ShareData) -> ActionOutcome {
        let handler = match self.registry.resolve(&task.action_name) {
            Ok(handler) => handler,
            Err(err) => {
                return ActionOutcome {
                    result: Err(err),
                    share_patch: ShareData::new(),
                }
            }
        };

        debug!(
            action_id = %task.action_id,
            action_name = %task.action_name,
            attempt = task.attempt,
            "executing action"
        );

        let mut ctx = ActionContext::new(task.params.clone(), share);
        match handler.execute(&mut ctx).await {
            Ok(result) => ActionOutcome {
                result: Ok(result),
                share_patch: ctx.into_patch(),
            },
            Err(err) => ActionOutcome {
                // A failed attempt publishes nothing downstream
                result: Err(err),
                share_patch: ShareData::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Params;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
            let input = ctx.params().clone();
            ctx.set_share("echoed", input.as_value().clone());
            Ok(Some(input))
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl ActionHandler for AlwaysFail {
        fn name(&self) -> &str {
            "always_fail"
        }

        async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
            ctx.set_share("leak", json!(true));
            Err(EngineError::Handler("vendor unavailable".to_string()))
        }
    }

    fn executor() -> ActionExecutor {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo), None);
        registry.register(Arc::new(AlwaysFail), None);
        ActionExecutor::new(Arc::new(registry))
    }

    fn task(action_name: &str, params: Params) -> Task {
        Task::new("a1", action_name, vec![], params, None)
    }

    #[tokio::test]
    async fn test_execute_returns_result_and_patch() {
        let executor = executor();
        let params = Params::new(json!({"region": "ap-1"}));
        let outcome = executor
            .execute(&task("echo", params.clone()), ShareData::new())
            .await;

        assert_eq!(outcome.result.unwrap(), Some(params));
        assert_eq!(
            outcome.share_patch.get("echoed").unwrap(),
            &json!({"region": "ap-1"})
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_discards_patch() {
        let executor = executor();
        let outcome = executor
            .execute(&task("always_fail", Params::null()), ShareData::new())
            .await;

        assert!(matches!(outcome.result, Err(EngineError::Handler(_))));
        assert!(outcome.share_patch.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_surfaces_as_outcome() {
        let executor = executor();
        let outcome = executor
            .execute(&task("ghost", Params::null()), ShareData::new())
            .await;

        assert!(matches!(outcome.result, Err(EngineError::ActionNotFound(_))));
    }

    #[tokio::test]
    async fn test_context_share_shadows_snapshot() {
        let mut share = ShareData::new();
        share.set("eip_id", json!("eip-old"));

        let mut ctx = ActionContext::new(Params::null(), share);
        assert_eq!(ctx.share("eip_id").unwrap(), &json!("eip-old"));

        ctx.set_share("eip_id", json!("eip-new"));
        assert_eq!(ctx.share("eip_id").unwrap(), &json!("eip-new"));
    }
}
