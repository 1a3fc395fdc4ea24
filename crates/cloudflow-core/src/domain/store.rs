//! Flow/Task store trait.
//!
//! The store is the single source of truth all engine components read and
//! write through; every mutation is one transactional store operation.
//! External crates implement [`FlowStore`] for real persistence (see the
//! relational implementation in `cloudflow-state-postgres`); the in-memory
//! implementation behind the `testing` feature backs unit and integration
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::flow::{Flow, FlowId, FlowStatus, ShareData};
use super::task::{ActionId, Task, TaskStatus};
use crate::{EngineError, Params};

/// Persistence contract for flows and their tasks.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Persist a flow and its tasks atomically. Tasks are created with
    /// their flow and never added afterward.
    async fn create_flow(&self, flow: Flow, tasks: Vec<Task>) -> Result<(), EngineError>;

    /// Fetch a flow by id
    async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError>;

    /// List flows, optionally filtered by status
    async fn list_flows(&self, status: Option<FlowStatus>) -> Result<Vec<Flow>, EngineError>;

    /// Snapshot of a flow's tasks
    async fn get_tasks(&self, id: &FlowId) -> Result<Vec<Task>, EngineError>;

    /// Bounded page of flows a scheduling pass should look at: Pending
    /// (unless gated by init state), Scheduled, Running, and Cancelling.
    async fn list_runnable(&self, limit: usize) -> Result<Vec<Flow>, EngineError>;

    /// Transition the given Pending tasks to Ready. Tasks no longer
    /// Pending are skipped; another scheduler got there first.
    async fn mark_ready(&self, id: &FlowId, action_ids: &[ActionId]) -> Result<(), EngineError>;

    /// Atomic Ready -> Running compare-and-set. Exactly one caller wins;
    /// everyone else gets [`EngineError::ClaimLost`]. The winner's token
    /// is recorded and the attempt counter incremented. Claims are also
    /// refused while the backoff gate (`not_before`) has not passed or
    /// the owning flow is cancelling or terminal.
    async fn claim_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        worker: &str,
    ) -> Result<Task, EngineError>;

    /// Fold a finished attempt back into the store: Running -> Success or
    /// Running -> Failed with the handler's result or error.
    async fn complete_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        status: TaskStatus,
        result: Option<Params>,
        error: Option<String>,
    ) -> Result<(), EngineError>;

    /// Re-enqueue a failed attempt: Running -> Ready, claimable no
    /// earlier than `not_before`.
    async fn requeue_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        error: String,
        not_before: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Sweep a task that can never run (predecessor failed) to Failed
    /// without it ever being claimed.
    async fn fail_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        error: String,
    ) -> Result<(), EngineError>;

    /// Merge a share-data patch into the flow, last write per key wins.
    async fn update_share_data(&self, id: &FlowId, patch: ShareData) -> Result<(), EngineError>;

    /// Advance the flow status under the flow state machine.
    async fn set_flow_status(&self, id: &FlowId, status: FlowStatus) -> Result<(), EngineError>;

    /// Move the flow to Failed recording the reason.
    async fn fail_flow(&self, id: &FlowId, error: String) -> Result<(), EngineError>;

    /// Remove a flow and its tasks. The engine never calls this on its
    /// own; flow lifecycle is caller-driven.
    async fn delete_flow(&self, id: &FlowId) -> Result<(), EngineError>;
}

/// In-memory store for tests and local development.
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    struct FlowRecord {
        flow: Flow,
        tasks: Vec<Task>,
    }

    /// Dashmap-backed [`FlowStore`]. Each flow lives under one map entry,
    /// so per-flow mutations (claims included) are serialized by the
    /// entry lock, giving the same at-most-one-claim guarantee the
    /// relational store gets from a conditional UPDATE.
    pub struct MemoryFlowStore {
        flows: Arc<DashMap<String, FlowRecord>>,
    }

    impl MemoryFlowStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self {
                flows: Arc::new(DashMap::with_capacity(16)),
            }
        }

        fn with_record<R>(
            &self,
            id: &FlowId,
            f: impl FnOnce(&mut FlowRecord) -> Result<R, EngineError>,
        ) -> Result<R, EngineError> {
            let mut record = self
                .flows
                .get_mut(&id.0)
                .ok_or_else(|| EngineError::FlowNotFound(id.0.clone()))?;
            f(record.value_mut())
        }
    }

    impl Default for MemoryFlowStore {
        fn default() -> Self {
            Self::new()
        }
    }

    fn find_task<'a>(
        record: &'a mut FlowRecord,
        id: &FlowId,
        action_id: &ActionId,
    ) -> Result<&'a mut Task, EngineError> {
        record
            .tasks
            .iter_mut()
            .find(|t| &t.action_id == action_id)
            .ok_or_else(|| EngineError::TaskNotFound(format!("{}/{}", id, action_id)))
    }

    #[async_trait]
    impl FlowStore for MemoryFlowStore {
        async fn create_flow(&self, flow: Flow, tasks: Vec<Task>) -> Result<(), EngineError> {
            use dashmap::mapref::entry::Entry;
            match self.flows.entry(flow.id.0.clone()) {
                Entry::Occupied(_) => Err(EngineError::Store(format!(
                    "flow already exists: {}",
                    flow.id
                ))),
                Entry::Vacant(entry) => {
                    entry.insert(FlowRecord { flow, tasks });
                    Ok(())
                }
            }
        }

        async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError> {
            Ok(self.flows.get(&id.0).map(|r| r.flow.clone()))
        }

        async fn list_flows(
            &self,
            status: Option<FlowStatus>,
        ) -> Result<Vec<Flow>, EngineError> {
            Ok(self
                .flows
                .iter()
                .filter(|r| status.map_or(true, |s| r.flow.status == s))
                .map(|r| r.flow.clone())
                .collect())
        }

        async fn get_tasks(&self, id: &FlowId) -> Result<Vec<Task>, EngineError> {
            self.flows
                .get(&id.0)
                .map(|r| r.tasks.clone())
                .ok_or_else(|| EngineError::FlowNotFound(id.0.clone()))
        }

        async fn list_runnable(&self, limit: usize) -> Result<Vec<Flow>, EngineError> {
            Ok(self
                .flows
                .iter()
                .filter(|r| match r.flow.status {
                    FlowStatus::Pending => !r.flow.init_state,
                    FlowStatus::Scheduled | FlowStatus::Running | FlowStatus::Cancelling => true,
                    _ => false,
                })
                .take(limit)
                .map(|r| r.flow.clone())
                .collect())
        }

        async fn mark_ready(
            &self,
            id: &FlowId,
            action_ids: &[ActionId],
        ) -> Result<(), EngineError> {
            self.with_record(id, |record| {
                for task in record.tasks.iter_mut() {
                    if action_ids.contains(&task.action_id)
                        && task.status == TaskStatus::Pending
                    {
                        task.status = TaskStatus::Ready;
                        task.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        async fn claim_task(
            &self,
            id: &FlowId,
            action_id: &ActionId,
            worker: &str,
        ) -> Result<Task, EngineError> {
            self.with_record(id, |record| {
                if record.flow.status == FlowStatus::Cancelling
                    || record.flow.status.is_terminal()
                {
                    return Err(EngineError::ClaimLost(format!(
                        "{}/{}: flow is {:?}",
                        id, action_id, record.flow.status
                    )));
                }

                let task = find_task(record, id, action_id)?;
                let gated = task
                    .not_before
                    .is_some_and(|not_before| not_before > Utc::now());
                if task.status != TaskStatus::Ready || gated {
                    return Err(EngineError::ClaimLost(format!("{}/{}", id, action_id)));
                }

                task.status = TaskStatus::Running;
                task.attempt += 1;
                task.worker = Some(worker.to_string());
                task.not_before = None;
                task.updated_at = Utc::now();
                Ok(task.clone())
            })
        }

        async fn complete_task(
            &self,
            id: &FlowId,
            action_id: &ActionId,
            status: TaskStatus,
            result: Option<Params>,
            error: Option<String>,
        ) -> Result<(), EngineError> {
            if !status.is_terminal() {
                return Err(EngineError::InvalidTransition(format!(
                    "complete_task target must be terminal, got {:?}",
                    status
                )));
            }
            self.with_record(id, |record| {
                let task = find_task(record, id, action_id)?;
                if task.status != TaskStatus::Running {
                    return Err(EngineError::InvalidTransition(format!(
                        "{}/{}: complete from {:?}",
                        id, action_id, task.status
                    )));
                }
                task.status = status;
                task.result = result;
                task.error = error;
                task.worker = None;
                task.updated_at = Utc::now();
                Ok(())
            })
        }

        async fn requeue_task(
            &self,
            id: &FlowId,
            action_id: &ActionId,
            error: String,
            not_before: DateTime<Utc>,
        ) -> Result<(), EngineError> {
            self.with_record(id, |record| {
                let task = find_task(record, id, action_id)?;
                if task.status != TaskStatus::Running {
                    return Err(EngineError::InvalidTransition(format!(
                        "{}/{}: requeue from {:?}",
                        id, action_id, task.status
                    )));
                }
                task.status = TaskStatus::Ready;
                task.error = Some(error);
                task.worker = None;
                task.not_before = Some(not_before);
                task.updated_at = Utc::now();
                Ok(())
            })
        }

        async fn fail_task(
            &self,
            id: &FlowId,
            action_id: &ActionId,
            error: String,
        ) -> Result<(), EngineError> {
            self.with_record(id, |record| {
                let task = find_task(record, id, action_id)?;
                if task.status.is_terminal() || task.status == TaskStatus::Running {
                    return Err(EngineError::InvalidTransition(format!(
                        "{}/{}: sweep from {:?}",
                        id, action_id, task.status
                    )));
                }
                task.status = TaskStatus::Failed;
                task.error = Some(error);
                task.updated_at = Utc::now();
                Ok(())
            })
        }

        async fn update_share_data(
            &self,
            id: &FlowId,
            patch: ShareData,
        ) -> Result<(), EngineError> {
            self.with_record(id, |record| {
                record.flow.share_data.merge(patch);
                record.flow.touch();
                Ok(())
            })
        }

        async fn set_flow_status(
            &self,
            id: &FlowId,
            status: FlowStatus,
        ) -> Result<(), EngineError> {
            self.with_record(id, |record| record.flow.transition(status))
        }

        async fn fail_flow(&self, id: &FlowId, error: String) -> Result<(), EngineError> {
            self.with_record(id, |record| record.flow.fail(error))
        }

        async fn delete_flow(&self, id: &FlowId) -> Result<(), EngineError> {
            self.flows.remove(&id.0);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::domain::flow::FlowKind;
        use serde_json::json;

        async fn seed() -> (MemoryFlowStore, FlowId) {
            let store = MemoryFlowStore::new();
            let flow = Flow::new("seed", FlowKind::Custom, ShareData::new());
            let id = flow.id.clone();
            let tasks = vec![
                Task::new("a", "noop", vec![], Params::null(), None),
                Task::new("b", "noop", vec!["a".into()], Params::null(), None),
            ];
            store.create_flow(flow, tasks).await.unwrap();
            (store, id)
        }

        #[tokio::test]
        async fn test_create_and_get() {
            let (store, id) = seed().await;
            let flow = store.get_flow(&id).await.unwrap().unwrap();
            assert_eq!(flow.status, FlowStatus::Pending);
            assert_eq!(store.get_tasks(&id).await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_create_rejects_duplicate() {
            let (store, id) = seed().await;
            let mut dup = Flow::new("dup", FlowKind::Custom, ShareData::new());
            dup.id = id;
            let result = store.create_flow(dup, vec![]).await;
            assert!(matches!(result, Err(EngineError::Store(_))));
        }

        #[tokio::test]
        async fn test_claim_requires_ready() {
            let (store, id) = seed().await;
            let result = store.claim_task(&id, &"a".into(), "w1").await;
            assert!(result.unwrap_err().is_claim_lost());

            store.mark_ready(&id, &["a".into()]).await.unwrap();
            let task = store.claim_task(&id, &"a".into(), "w1").await.unwrap();
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(task.attempt, 1);
            assert_eq!(task.worker.as_deref(), Some("w1"));
        }

        #[tokio::test]
        async fn test_concurrent_claims_single_winner() {
            let (store, id) = seed().await;
            store.mark_ready(&id, &["a".into()]).await.unwrap();
            let store = Arc::new(store);

            let mut handles = Vec::new();
            for i in 0..16 {
                let store = store.clone();
                let id = id.clone();
                handles.push(tokio::spawn(async move {
                    store.claim_task(&id, &"a".into(), &format!("w{}", i)).await
                }));
            }

            let mut wins = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => wins += 1,
                    Err(e) => assert!(e.is_claim_lost()),
                }
            }
            assert_eq!(wins, 1);
        }

        #[tokio::test]
        async fn test_claim_respects_backoff_gate() {
            let (store, id) = seed().await;
            store.mark_ready(&id, &["a".into()]).await.unwrap();
            store.claim_task(&id, &"a".into(), "w1").await.unwrap();
            store
                .requeue_task(
                    &id,
                    &"a".into(),
                    "remote hiccup".to_string(),
                    Utc::now() + chrono::Duration::seconds(60),
                )
                .await
                .unwrap();

            let result = store.claim_task(&id, &"a".into(), "w1").await;
            assert!(result.unwrap_err().is_claim_lost());

            // Attempt counter survives the requeue
            let tasks = store.get_tasks(&id).await.unwrap();
            let a = tasks.iter().find(|t| t.action_id.0 == "a").unwrap();
            assert_eq!(a.attempt, 1);
            assert_eq!(a.status, TaskStatus::Ready);
            assert_eq!(a.error.as_deref(), Some("remote hiccup"));
        }

        #[tokio::test]
        async fn test_no_claim_for_cancelling_flow() {
            let (store, id) = seed().await;
            store.mark_ready(&id, &["a".into()]).await.unwrap();
            store.set_flow_status(&id, FlowStatus::Scheduled).await.unwrap();
            store
                .set_flow_status(&id, FlowStatus::Cancelling)
                .await
                .unwrap();

            let result = store.claim_task(&id, &"a".into(), "w1").await;
            assert!(result.unwrap_err().is_claim_lost());
        }

        #[tokio::test]
        async fn test_complete_task_records_result() {
            let (store, id) = seed().await;
            store.mark_ready(&id, &["a".into()]).await.unwrap();
            store.claim_task(&id, &"a".into(), "w1").await.unwrap();
            store
                .complete_task(
                    &id,
                    &"a".into(),
                    TaskStatus::Success,
                    Some(Params::new(json!({"eip_id": "eip-1"}))),
                    None,
                )
                .await
                .unwrap();

            let tasks = store.get_tasks(&id).await.unwrap();
            let a = tasks.iter().find(|t| t.action_id.0 == "a").unwrap();
            assert_eq!(a.status, TaskStatus::Success);
            assert!(a.worker.is_none());
            assert_eq!(
                a.result.as_ref().unwrap().get("eip_id").unwrap(),
                &json!("eip-1")
            );
        }

        #[tokio::test]
        async fn test_complete_task_requires_running() {
            let (store, id) = seed().await;
            let result = store
                .complete_task(&id, &"a".into(), TaskStatus::Success, None, None)
                .await;
            assert!(matches!(result, Err(EngineError::InvalidTransition(_))));
        }

        #[tokio::test]
        async fn test_share_data_patch() {
            let (store, id) = seed().await;
            let patch: ShareData = [("eip_id".to_string(), json!("eip-1"))]
                .into_iter()
                .collect();
            store.update_share_data(&id, patch).await.unwrap();

            let flow = store.get_flow(&id).await.unwrap().unwrap();
            assert_eq!(flow.share_data.get("eip_id").unwrap(), &json!("eip-1"));
        }

        #[tokio::test]
        async fn test_list_runnable_skips_gated_and_terminal() {
            let store = MemoryFlowStore::new();
            let gated = Flow::new("gated", FlowKind::Custom, ShareData::new())
                .with_init_state(true);
            let live = Flow::new("live", FlowKind::Custom, ShareData::new());
            let live_id = live.id.clone();
            let mut done = Flow::new("done", FlowKind::Custom, ShareData::new());
            done.transition(FlowStatus::Scheduled).unwrap();
            done.transition(FlowStatus::Running).unwrap();
            done.transition(FlowStatus::Success).unwrap();

            for flow in [gated, live, done] {
                store
                    .create_flow(flow, vec![Task::new("a", "noop", vec![], Params::null(), None)])
                    .await
                    .unwrap();
            }

            let runnable = store.list_runnable(10).await.unwrap();
            assert_eq!(runnable.len(), 1);
            assert_eq!(runnable[0].id, live_id);
        }

        #[tokio::test]
        async fn test_delete_flow() {
            let (store, id) = seed().await;
            store.delete_flow(&id).await.unwrap();
            assert!(store.get_flow(&id).await.unwrap().is_none());
        }
    }
}
