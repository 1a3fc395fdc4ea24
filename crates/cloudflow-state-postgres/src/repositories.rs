//! PostgreSQL implementation of the core flow store.
//!
//! Claim semantics rely on single-statement conditional UPDATEs: the row
//! either matches the expected prior state and moves, or the statement
//! affects zero rows and the caller lost the race. No advisory locks, no
//! SELECT FOR UPDATE.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudflow_core::domain::flow::{Flow, FlowId, FlowStatus, ShareData};
use cloudflow_core::domain::store::FlowStore;
use cloudflow_core::domain::task::{ActionId, Task, TaskStatus};
use cloudflow_core::{EngineError, Params};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

/// Postgres-backed [`FlowStore`].
#[derive(Clone)]
pub struct PostgresFlowStore {
    pool: PgPool,
}

impl PostgresFlowStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError> {
        let row = sqlx::query("SELECT * FROM flows WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| flow_from_row(&r)).transpose()
    }

    /// Guarded flow update: transition validated in the domain model,
    /// written back only if no one moved the row since our read.
    async fn transition_flow(
        &self,
        id: &FlowId,
        apply: impl FnOnce(&mut Flow) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut flow = self
            .fetch_flow(id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(id.0.clone()))?;
        let prior = flow.status;
        apply(&mut flow)?;

        let result = sqlx::query(
            "UPDATE flows SET status = $3, init_state = $4, error = $5, updated_at = $6
             WHERE id = $1 AND status = $2",
        )
        .bind(&id.0)
        .bind(encode_enum(&prior)?)
        .bind(encode_enum(&flow.status)?)
        .bind(flow.init_state)
        .bind(&flow.error)
        .bind(flow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidTransition(format!(
                "{}: concurrent update from {:?}",
                id, prior
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStore for PostgresFlowStore {
    async fn create_flow(&self, flow: Flow, tasks: Vec<Task>) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO flows
                (id, name, kind, status, init_state, share_data, memo, error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&flow.id.0)
        .bind(&flow.name)
        .bind(encode_enum(&flow.kind)?)
        .bind(encode_enum(&flow.status)?)
        .bind(flow.init_state)
        .bind(serde_json::to_value(&flow.share_data)?)
        .bind(&flow.memo)
        .bind(&flow.error)
        .bind(flow.created_at)
        .bind(flow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(EngineError::Store(format!(
                "flow already exists: {}",
                flow.id
            )));
        }

        for (seq, task) in tasks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tasks
                    (flow_id, action_id, action_name, seq, depend_on, params, retry,
                     status, attempt, worker, not_before, result, error, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(&flow.id.0)
            .bind(&task.action_id.0)
            .bind(&task.action_name)
            .bind(seq as i32)
            .bind(serde_json::to_value(&task.depend_on)?)
            .bind(serde_json::to_value(&task.params)?)
            .bind(task.retry.as_ref().map(serde_json::to_value).transpose()?)
            .bind(encode_enum(&task.status)?)
            .bind(task.attempt as i32)
            .bind(&task.worker)
            .bind(task.not_before)
            .bind(task.result.as_ref().map(serde_json::to_value).transpose()?)
            .bind(&task.error)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(flow = %flow.id, tasks = tasks.len(), "flow persisted");
        Ok(())
    }

    async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, EngineError> {
        self.fetch_flow(id).await
    }

    async fn list_flows(&self, status: Option<FlowStatus>) -> Result<Vec<Flow>, EngineError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM flows WHERE status = $1 ORDER BY created_at")
                    .bind(encode_enum(&status)?)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM flows ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(flow_from_row).collect()
    }

    async fn get_tasks(&self, id: &FlowId) -> Result<Vec<Task>, EngineError> {
        if self.fetch_flow(id).await?.is_none() {
            return Err(EngineError::FlowNotFound(id.0.clone()));
        }
        let rows = sqlx::query("SELECT * FROM tasks WHERE flow_id = $1 ORDER BY seq")
            .bind(&id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_runnable(&self, limit: usize) -> Result<Vec<Flow>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM flows
             WHERE status IN ('scheduled', 'running', 'cancelling')
                OR (status = 'pending' AND NOT init_state)
             ORDER BY created_at
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(flow_from_row).collect()
    }

    async fn mark_ready(&self, id: &FlowId, action_ids: &[ActionId]) -> Result<(), EngineError> {
        let ids: Vec<String> = action_ids.iter().map(|a| a.0.clone()).collect();
        sqlx::query(
            "UPDATE tasks SET status = 'ready', updated_at = NOW()
             WHERE flow_id = $1 AND action_id = ANY($2) AND status = 'pending'",
        )
        .bind(&id.0)
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn claim_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        worker: &str,
    ) -> Result<Task, EngineError> {
        // The whole claim is one conditional UPDATE: it moves the row
        // only while the task is ready, ungated, and the flow is still
        // live. Zero rows means another claimer won or the flow left
        // the claimable states.
        let row = sqlx::query(
            "UPDATE tasks
             SET status = 'running', attempt = attempt + 1, worker = $3,
                 not_before = NULL, updated_at = NOW()
             WHERE flow_id = $1 AND action_id = $2 AND status = 'ready'
               AND (not_before IS NULL OR not_before <= NOW())
               AND EXISTS (
                   SELECT 1 FROM flows
                   WHERE id = $1 AND status IN ('pending', 'scheduled', 'running')
               )
             RETURNING *",
        )
        .bind(&id.0)
        .bind(&action_id.0)
        .bind(worker)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(EngineError::ClaimLost(format!("{}/{}", id, action_id))),
        }
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

        let updated = sqlx::query(
            "UPDATE tasks
             SET status = $3, result = $4, error = $5, worker = NULL, updated_at = NOW()
             WHERE flow_id = $1 AND action_id = $2 AND status = 'running'",
        )
        .bind(&id.0)
        .bind(&action_id.0)
        .bind(encode_enum(&status)?)
        .bind(result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.task_update_refusal(id, action_id, "complete").await);
        }
        Ok(())
    }

    async fn requeue_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        error: String,
        not_before: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = 'ready', error = $3, worker = NULL, not_before = $4, updated_at = NOW()
             WHERE flow_id = $1 AND action_id = $2 AND status = 'running'",
        )
        .bind(&id.0)
        .bind(&action_id.0)
        .bind(&error)
        .bind(not_before)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.task_update_refusal(id, action_id, "requeue").await);
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        id: &FlowId,
        action_id: &ActionId,
        error: String,
    ) -> Result<(), EngineError> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'failed', error = $3, updated_at = NOW()
             WHERE flow_id = $1 AND action_id = $2 AND status IN ('pending', 'ready')",
        )
        .bind(&id.0)
        .bind(&action_id.0)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.task_update_refusal(id, action_id, "sweep").await);
        }
        Ok(())
    }

    async fn update_share_data(&self, id: &FlowId, patch: ShareData) -> Result<(), EngineError> {
        // Last write wins at key granularity via jsonb concatenation
        let updated = sqlx::query(
            "UPDATE flows SET share_data = share_data || $2::jsonb, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(&id.0)
        .bind(serde_json::to_value(&patch)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::FlowNotFound(id.0.clone()));
        }
        Ok(())
    }

    async fn set_flow_status(&self, id: &FlowId, status: FlowStatus) -> Result<(), EngineError> {
        self.transition_flow(id, |flow| flow.transition(status)).await
    }

    async fn fail_flow(&self, id: &FlowId, error: String) -> Result<(), EngineError> {
        self.transition_flow(id, |flow| flow.fail(error)).await
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM flows WHERE id = $1")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

impl PostgresFlowStore {
    /// Classify a zero-row task update: unknown task or a state the
    /// operation refuses.
    async fn task_update_refusal(&self, id: &FlowId, action_id: &ActionId, op: &str) -> EngineError {
        let probe = sqlx::query("SELECT status FROM tasks WHERE flow_id = $1 AND action_id = $2")
            .bind(&id.0)
            .bind(&action_id.0)
            .fetch_optional(&self.pool)
            .await;

        match probe {
            Ok(Some(row)) => {
                let status: String = row.try_get("status").unwrap_or_default();
                EngineError::InvalidTransition(format!(
                    "{}/{}: {} from {}",
                    id, action_id, op, status
                ))
            }
            Ok(None) => EngineError::TaskNotFound(format!("{}/{}", id, action_id)),
            Err(e) => db_err(e),
        }
    }
}

fn db_err(e: sqlx::Error) -> EngineError {
    EngineError::Store(format!("database error: {}", e))
}

/// Serialize an enum to its snake_case wire string.
fn encode_enum<T: serde::Serialize>(value: &T) -> Result<String, EngineError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(EngineError::Serialization(format!(
            "expected string encoding, got {}",
            other
        ))),
    }
}

fn decode_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, EngineError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        s.to_string(),
    ))?)
}

fn flow_from_row(row: &PgRow) -> Result<Flow, EngineError> {
    let status: String = row.try_get("status").map_err(col_err)?;
    let kind: String = row.try_get("kind").map_err(col_err)?;
    let share_data: serde_json::Value = row.try_get("share_data").map_err(col_err)?;

    Ok(Flow {
        id: FlowId(row.try_get("id").map_err(col_err)?),
        name: row.try_get("name").map_err(col_err)?,
        kind: decode_enum(&kind)?,
        status: decode_enum(&status)?,
        init_state: row.try_get("init_state").map_err(col_err)?,
        share_data: serde_json::from_value(share_data)?,
        memo: row.try_get("memo").map_err(col_err)?,
        error: row.try_get("error").map_err(col_err)?,
        created_at: row.try_get("created_at").map_err(col_err)?,
        updated_at: row.try_get("updated_at").map_err(col_err)?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, EngineError> {
    let status: String = row.try_get("status").map_err(col_err)?;
    let depend_on: serde_json::Value = row.try_get("depend_on").map_err(col_err)?;
    let params: serde_json::Value = row.try_get("params").map_err(col_err)?;
    let retry: Option<serde_json::Value> = row.try_get("retry").map_err(col_err)?;
    let result: Option<serde_json::Value> = row.try_get("result").map_err(col_err)?;
    let attempt: i32 = row.try_get("attempt").map_err(col_err)?;

    Ok(Task {
        action_id: ActionId(row.try_get("action_id").map_err(col_err)?),
        action_name: row.try_get("action_name").map_err(col_err)?,
        depend_on: serde_json::from_value(depend_on)?,
        params: serde_json::from_value(params)?,
        retry: retry.map(serde_json::from_value).transpose()?,
        status: decode_enum(&status)?,
        attempt: attempt as u32,
        worker: row.try_get("worker").map_err(col_err)?,
        not_before: row.try_get("not_before").map_err(col_err)?,
        result: result.map(serde_json::from_value).transpose()?,
        error: row.try_get("error").map_err(col_err)?,
        updated_at: row.try_get("updated_at").map_err(col_err)?,
    })
}

fn col_err(e: sqlx::Error) -> EngineError {
    EngineError::Serialization(format!("row decode: {}", e))
}
