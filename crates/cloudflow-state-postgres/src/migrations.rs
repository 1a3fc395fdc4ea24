//! Embedded schema migrations.
//!
//! Applied migrations are tracked in `cloudflow_migrations`; each batch
//! runs once, inside its own transaction.

use cloudflow_core::EngineError;
use sqlx::PgPool;
use tracing::{debug, info};

/// Ordered schema migrations as `(name, sql)` batches.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![(
        "20250301000000_initial_schema",
        r#"
        -- Flow headers
        CREATE TABLE IF NOT EXISTS flows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            init_state BOOLEAN NOT NULL DEFAULT FALSE,
            share_data JSONB NOT NULL DEFAULT '{}'::jsonb,
            memo TEXT,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        );

        -- Scheduler scan: runnable flows by status
        CREATE INDEX IF NOT EXISTS idx_flows_status ON flows(status, init_state, created_at);

        -- Tasks, one row per (flow, action)
        CREATE TABLE IF NOT EXISTS tasks (
            flow_id TEXT NOT NULL,
            action_id TEXT NOT NULL,
            action_name TEXT NOT NULL,
            seq INT NOT NULL,
            depend_on JSONB NOT NULL DEFAULT '[]'::jsonb,
            params JSONB NOT NULL DEFAULT 'null'::jsonb,
            retry JSONB,
            status TEXT NOT NULL,
            attempt INT NOT NULL DEFAULT 0,
            worker TEXT,
            not_before TIMESTAMPTZ,
            result JSONB,
            error TEXT,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (flow_id, action_id),
            CONSTRAINT fk_task_flow FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(flow_id, status);
        "#,
    )]
}

/// Apply any migration batches not yet recorded as applied.
pub async fn run_migrations(pool: &PgPool) -> Result<(), EngineError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cloudflow_migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| EngineError::Store(format!("migration bookkeeping: {}", e)))?;

    for (name, sql) in generate_migrations() {
        let applied = sqlx::query("SELECT 1 FROM cloudflow_migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(|e| EngineError::Store(format!("migration lookup: {}", e)))?;
        if applied.is_some() {
            debug!(migration = name, "already applied");
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| EngineError::Store(format!("migration begin: {}", e)))?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Store(format!("migration {}: {}", name, e)))?;
        sqlx::query("INSERT INTO cloudflow_migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Store(format!("migration record {}: {}", name, e)))?;
        tx.commit()
            .await
            .map_err(|e| EngineError::Store(format!("migration commit {}: {}", name, e)))?;

        info!(migration = name, "applied");
    }

    Ok(())
}
