//! Scheduler/dispatcher: the concurrency core.
//!
//! One or more scheduler loops (potentially across processes) periodically
//! scan the store for runnable flows, claim ready tasks through the store's
//! atomic compare-and-set, and dispatch them into a semaphore-bounded
//! worker set. Dispatch is fire-and-forget: workers write their outcome
//! back to the store and the next pass folds it into flow state. All
//! cross-worker communication goes through the store; claim contention
//! between scheduler instances is expected and benign.

use crate::config::{EngineConfig, FailureMode};
use crate::domain::flow::{Flow, FlowId, FlowStatus};
use crate::domain::graph;
use crate::domain::store::FlowStore;
use crate::domain::task::{ActionId, Task, TaskStatus};
use crate::executor::ActionExecutor;
use crate::registry::ActionRegistry;
use crate::EngineError;
use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Periodically drives persisted flows toward a terminal status.
pub struct Scheduler {
    store: Arc<dyn FlowStore>,
    executor: Arc<ActionExecutor>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    worker_token: String,
    workers: Mutex<JoinSet<()>>,
}

impl Scheduler {
    /// Create a scheduler over a store and a registry.
    pub fn new(store: Arc<dyn FlowStore>, registry: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        let worker_token = format!("scheduler-{}", &Uuid::new_v4().to_string()[..8]);
        Self {
            store,
            executor: Arc::new(ActionExecutor::new(registry)),
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            worker_token,
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Token recorded on tasks claimed by this instance
    pub fn worker_token(&self) -> &str {
        &self.worker_token
    }

    /// Scheduling loop: tick, reap finished workers, sleep, repeat until
    /// cancelled; then drain in-flight workers. Handler failures never
    /// abort the loop; a store failure aborts one pass and is retried on
    /// the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.worker_token, "scheduler loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval()) => {
                    if let Err(err) = self.tick().await {
                        warn!(worker = %self.worker_token, error = %err, "scheduling pass aborted");
                    }
                    self.reap().await;
                }
            }
        }
        info!(worker = %self.worker_token, "scheduler stopping, draining workers");
        self.drain().await;
    }

    /// One scheduling pass over a bounded page of runnable flows.
    pub async fn tick(&self) -> Result<(), EngineError> {
        let flows = self.store.list_runnable(self.config.flow_page_size).await?;
        for flow in flows {
            let flow_id = flow.id.clone();
            if let Err(err) = self.process_flow(flow).await {
                if matches!(err, EngineError::Store(_)) {
                    return Err(err);
                }
                warn!(flow = %flow_id, error = %err, "flow pass error");
            }
        }
        Ok(())
    }

    /// Wait for every in-flight worker to finish.
    pub async fn drain(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "worker task panicked");
            }
        }
    }

    /// Collect already-finished workers without blocking.
    async fn reap(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(Some(result)) = workers.join_next().now_or_never() {
            if let Err(err) = result {
                error!(error = %err, "worker task panicked");
            }
        }
    }

    async fn process_flow(&self, flow: Flow) -> Result<(), EngineError> {
        let tasks = self.store.get_tasks(&flow.id).await?;

        // Cancel drain: claim nothing, finalize once no attempt is in flight
        if flow.status == FlowStatus::Cancelling {
            if !tasks.iter().any(|t| t.status == TaskStatus::Running) {
                info!(flow = %flow.id, "cancel drained, finalizing");
                self.advance_flow(&flow.id, FlowStatus::Cancelled).await?;
            }
            return Ok(());
        }

        let fail_fast = self.config.failure_mode == FailureMode::FailFast;
        let halted = fail_fast && graph::any_failed(&tasks);

        let mut flow = flow;
        if !halted && !graph::all_terminal(&tasks) {
            let newly_ready = graph::compute_ready(&tasks);
            if !newly_ready.is_empty() {
                self.store.mark_ready(&flow.id, &newly_ready).await?;
            }
            if flow.status == FlowStatus::Pending {
                self.advance_flow(&flow.id, FlowStatus::Scheduled).await?;
                flow.status = FlowStatus::Scheduled;
            }

            let tasks = self.store.get_tasks(&flow.id).await?;
            self.dispatch_ready(&mut flow, &tasks).await?;
        }

        // Aggregate over a fresh snapshot; workers may already have folded
        // completions back in
        let tasks = self.store.get_tasks(&flow.id).await?;
        if graph::all_terminal(&tasks) {
            return self.finalize(&flow, graph::any_failed(&tasks)).await;
        }

        if graph::any_failed(&tasks) {
            let running = tasks.iter().any(|t| t.status == TaskStatus::Running);

            // Tasks blocked on a failed predecessor can never run; sweep
            // them so the flow does not hang Running forever
            let doomed = graph::doomed(&tasks);
            self.sweep(&flow.id, &doomed, "predecessor failed").await?;

            if fail_fast && !running {
                let rest: Vec<ActionId> = tasks
                    .iter()
                    .filter(|t| {
                        !t.status.is_terminal()
                            && t.status != TaskStatus::Running
                            && !doomed.contains(&t.action_id)
                    })
                    .map(|t| t.action_id.clone())
                    .collect();
                self.sweep(&flow.id, &rest, "flow failed fast").await?;
            }

            let tasks = self.store.get_tasks(&flow.id).await?;
            if graph::all_terminal(&tasks) {
                return self.finalize(&flow, true).await;
            }
        }

        Ok(())
    }

    /// Claim every claimable task the admission budget allows and hand
    /// each to a worker. Claims lost to another scheduler are skipped.
    async fn dispatch_ready(&self, flow: &mut Flow, tasks: &[Task]) -> Result<(), EngineError> {
        let now = Utc::now();
        let running_in_flow = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        let mut flow_budget = if self.config.per_flow_workers == 0 {
            usize::MAX
        } else {
            self.config.per_flow_workers.saturating_sub(running_in_flow)
        };

        for task in tasks {
            if flow_budget == 0 {
                break;
            }
            if task.status != TaskStatus::Ready {
                continue;
            }
            if task.not_before.is_some_and(|not_before| not_before > now) {
                continue;
            }

            // Admission control: never claim without worker capacity
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(flow = %flow.id, "worker pool exhausted, deferring claims");
                    break;
                }
            };

            match self
                .store
                .claim_task(&flow.id, &task.action_id, &self.worker_token)
                .await
            {
                Ok(claimed) => {
                    flow_budget -= 1;
                    if flow.status != FlowStatus::Running {
                        self.advance_flow(&flow.id, FlowStatus::Running).await?;
                        flow.status = FlowStatus::Running;
                    }
                    self.spawn_worker(flow.id.clone(), claimed, permit).await;
                }
                Err(err) if err.is_claim_lost() => {
                    debug!(flow = %flow.id, task = %task.action_id, "claim lost, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Fire-and-forget execution of one claimed attempt. The worker owns
    /// its permit for the duration and folds the outcome straight into
    /// the store.
    async fn spawn_worker(
        &self,
        flow_id: FlowId,
        task: Task,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let store = self.store.clone();
        let executor = self.executor.clone();

        self.workers.lock().await.spawn(async move {
            let _permit = permit;

            // Freshest share-data snapshot at execution time
            let share = match store.get_flow(&flow_id).await {
                Ok(Some(flow)) => flow.share_data,
                Ok(None) => {
                    warn!(flow = %flow_id, "flow vanished before execution");
                    return;
                }
                Err(err) => {
                    warn!(flow = %flow_id, error = %err, "share-data fetch failed");
                    Default::default()
                }
            };

            let outcome = executor.execute(&task, share).await;
            match outcome.result {
                Ok(result) => {
                    if !outcome.share_patch.is_empty() {
                        if let Err(err) = store
                            .update_share_data(&flow_id, outcome.share_patch)
                            .await
                        {
                            error!(flow = %flow_id, task = %task.action_id, error = %err,
                                "share-data patch failed");
                        }
                    }
                    if let Err(err) = store
                        .complete_task(&flow_id, &task.action_id, TaskStatus::Success, result, None)
                        .await
                    {
                        error!(flow = %flow_id, task = %task.action_id, error = %err,
                            "completion write failed");
                    }
                }
                Err(err) if task.retry_eligible() => {
                    let delay = task.retry_delay();
                    let not_before = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(flow = %flow_id, task = %task.action_id, attempt = task.attempt,
                        error = %err, backoff_ms = delay.as_millis() as u64, "attempt failed, requeueing");
                    if let Err(err) = store
                        .requeue_task(&flow_id, &task.action_id, err.to_string(), not_before)
                        .await
                    {
                        error!(flow = %flow_id, task = %task.action_id, error = %err,
                            "requeue failed");
                    }
                }
                Err(err) => {
                    warn!(flow = %flow_id, task = %task.action_id, attempt = task.attempt,
                        error = %err, "attempts exhausted, task failed");
                    if let Err(err) = store
                        .complete_task(
                            &flow_id,
                            &task.action_id,
                            TaskStatus::Failed,
                            None,
                            Some(err.to_string()),
                        )
                        .await
                    {
                        error!(flow = %flow_id, task = %task.action_id, error = %err,
                            "failure write failed");
                    }
                }
            }
        });
    }

    /// Set the terminal flow status once every task is terminal.
    async fn finalize(&self, flow: &Flow, failed: bool) -> Result<(), EngineError> {
        if failed {
            match self
                .store
                .fail_flow(&flow.id, "one or more tasks failed".to_string())
                .await
            {
                Ok(()) => info!(flow = %flow.id, "flow failed"),
                Err(EngineError::InvalidTransition(_)) => {}
                Err(err) => return Err(err),
            }
        } else {
            self.advance_flow(&flow.id, FlowStatus::Success).await?;
            info!(flow = %flow.id, "flow succeeded");
        }
        Ok(())
    }

    /// Guarded status update; a concurrent scheduler winning the same
    /// transition is not an error.
    async fn advance_flow(&self, id: &FlowId, status: FlowStatus) -> Result<(), EngineError> {
        match self.store.set_flow_status(id, status).await {
            Ok(()) => Ok(()),
            Err(EngineError::InvalidTransition(msg)) => {
                debug!(flow = %id, "concurrent flow transition: {}", msg);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn sweep(
        &self,
        id: &FlowId,
        action_ids: &[ActionId],
        reason: &str,
    ) -> Result<(), EngineError> {
        for action_id in action_ids {
            match self.store.fail_task(id, action_id, reason.to_string()).await {
                Ok(()) => {
                    debug!(flow = %id, task = %action_id, reason, "task swept to failed");
                }
                // Another scheduler swept or claimed it first
                Err(EngineError::InvalidTransition(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
