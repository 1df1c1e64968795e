//! PostgreSQL storage implementation
//!
//! Every entity is stored as a JSONB `data` document plus the indexed
//! columns the queries filter on. Transactions run at SERIALIZABLE; a
//! serialization failure surfaces as [`StoreError::Conflict`].

use super::traits::*;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use bpm_types::{
    CopyRecord, CopyRecordId, FlowDefinition, FlowDefinitionId, FlowInstance, FlowInstanceId,
    FlowLog, NodeId, ParallelBranchState, Task, TaskId, TaskStatus, UserId,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::time::Duration;

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and initialize schema
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flow_definitions (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                is_main BOOLEAN NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (code, version)
            );
            "#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS flow_definitions_main ON flow_definitions(code) WHERE is_main;"#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_instances (
                id TEXT PRIMARY KEY,
                initiator_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS flow_instances_initiator ON flow_instances(initiator_id, started_at DESC);"#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_tasks (
                seq BIGSERIAL,
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                assignee_id TEXT NOT NULL,
                status TEXT NOT NULL,
                due_at TIMESTAMPTZ,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS flow_tasks_instance_node ON flow_tasks(instance_id, node_id);"#,
            r#"CREATE INDEX IF NOT EXISTS flow_tasks_assignee ON flow_tasks(assignee_id);"#,
            r#"ALTER TABLE flow_tasks ADD COLUMN IF NOT EXISTS reminded_at TIMESTAMPTZ;"#,
            r#"ALTER TABLE flow_tasks ADD COLUMN IF NOT EXISTS escalated_at TIMESTAMPTZ;"#,
            r#"CREATE INDEX IF NOT EXISTS flow_tasks_due ON flow_tasks(due_at) WHERE due_at IS NOT NULL;"#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_logs (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                instance_id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS flow_logs_instance ON flow_logs(instance_id, seq);"#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_copies (
                seq BIGSERIAL,
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS flow_copies_recipient ON flow_copies(recipient_id);"#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_parallel_branches (
                instance_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (instance_id, node_id)
            );
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl FlowStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

fn query_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        // serialization_failure, deadlock_detected, unique_violation
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("23505")) {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Query(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::InvalidData(format!("json serialize error: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::InvalidData(format!("json deserialize error: {}", e)))
}

fn decode_row<T: serde::de::DeserializeOwned>(row: PgRow) -> StoreResult<T> {
    let data: Value = row
        .try_get("data")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    from_json(data)
}

fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<PgRow>) -> StoreResult<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

/// Wire name of a serde unit enum, for indexed status columns
fn enum_str<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    match to_json(value)? {
        Value::String(s) => Ok(s),
        other => Err(StoreError::InvalidData(format!("expected string enum, got {}", other))),
    }
}

impl PostgresTx {
    async fn fetch_one_data<T: serde::de::DeserializeOwned>(
        &mut self,
        sql: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.map(decode_row).transpose()
    }

    async fn fetch_all_data<T: serde::de::DeserializeOwned>(
        &mut self,
        sql: &str,
        key: &str,
    ) -> StoreResult<Vec<T>> {
        let rows = sqlx::query(sql)
            .bind(key)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_error)?;
        decode_rows(rows)
    }
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn get_definition(&mut self, id: &FlowDefinitionId) -> StoreResult<Option<FlowDefinition>> {
        self.fetch_one_data("SELECT data FROM flow_definitions WHERE id = $1", id.as_str())
            .await
    }

    async fn definitions_by_code(&mut self, code: &str) -> StoreResult<Vec<FlowDefinition>> {
        self.fetch_all_data(
            "SELECT data FROM flow_definitions WHERE code = $1 ORDER BY version",
            code,
        )
        .await
    }

    async fn list_definitions(&mut self) -> StoreResult<Vec<FlowDefinition>> {
        let rows = sqlx::query("SELECT data FROM flow_definitions ORDER BY code, version")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_error)?;
        decode_rows(rows)
    }

    async fn save_definition(&mut self, definition: &FlowDefinition) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_definitions (id, code, version, status, is_main, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                is_main = EXCLUDED.is_main,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(definition.id.as_str())
        .bind(&definition.code)
        .bind(definition.version as i32)
        .bind(enum_str(&definition.status)?)
        .bind(definition.is_main)
        .bind(to_json(definition)?)
        .bind(definition.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_instance(&mut self, id: &FlowInstanceId) -> StoreResult<Option<FlowInstance>> {
        self.fetch_one_data("SELECT data FROM flow_instances WHERE id = $1", id.as_str())
            .await
    }

    async fn instances_by_initiator(&mut self, user: &UserId) -> StoreResult<Vec<FlowInstance>> {
        self.fetch_all_data(
            "SELECT data FROM flow_instances WHERE initiator_id = $1 ORDER BY started_at DESC",
            user.as_str(),
        )
        .await
    }

    async fn save_instance(&mut self, instance: &FlowInstance) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_instances (id, initiator_id, status, data, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(instance.id.as_str())
        .bind(instance.initiator_id.as_str())
        .bind(instance.status.to_string())
        .bind(to_json(instance)?)
        .bind(instance.started_at)
        .bind(instance.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_task(&mut self, id: &TaskId) -> StoreResult<Option<Task>> {
        self.fetch_one_data("SELECT data FROM flow_tasks WHERE id = $1", id.as_str())
            .await
    }

    async fn tasks_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<Task>> {
        self.fetch_all_data(
            "SELECT data FROM flow_tasks WHERE instance_id = $1 ORDER BY seq",
            instance.as_str(),
        )
        .await
    }

    async fn tasks_at_node(
        &mut self,
        instance: &FlowInstanceId,
        node: &NodeId,
    ) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT data FROM flow_tasks WHERE instance_id = $1 AND node_id = $2 ORDER BY seq",
        )
        .bind(instance.as_str())
        .bind(node.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;
        decode_rows(rows)
    }

    async fn tasks_for_assignee(&mut self, user: &UserId) -> StoreResult<Vec<Task>> {
        self.fetch_all_data(
            "SELECT data FROM flow_tasks WHERE assignee_id = $1 ORDER BY seq",
            user.as_str(),
        )
        .await
    }

    async fn tasks_awaiting_timeout(
        &mut self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM flow_tasks
            WHERE status = $1 AND due_at IS NOT NULL AND due_at <= $3
              AND ((due_at <= $2 AND escalated_at IS NULL)
                OR (due_at > $2 AND reminded_at IS NULL))
            ORDER BY due_at
            LIMIT $4
            "#,
        )
        .bind(TaskStatus::Pending.to_string())
        .bind(now)
        .bind(until)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;
        decode_rows(rows)
    }

    async fn resolved_tasks_with_due(&mut self, limit: usize) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT data FROM flow_tasks WHERE status <> $1 AND due_at IS NOT NULL LIMIT $2",
        )
        .bind(TaskStatus::Pending.to_string())
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;
        decode_rows(rows)
    }

    async fn save_task(&mut self, task: &Task) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_tasks
                (id, instance_id, node_id, assignee_id, status, due_at, reminded_at, escalated_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                due_at = EXCLUDED.due_at,
                reminded_at = EXCLUDED.reminded_at,
                escalated_at = EXCLUDED.escalated_at,
                data = EXCLUDED.data
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.instance_id.as_str())
        .bind(task.node_id.as_str())
        .bind(task.assignee_id.as_str())
        .bind(task.status.to_string())
        .bind(task.due_at)
        .bind(task.reminded_at)
        .bind(task.escalated_at)
        .bind(to_json(task)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn append_log(&mut self, log: &FlowLog) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO flow_logs (id, instance_id, data, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(log.id.as_str())
        .bind(log.instance_id.as_str())
        .bind(to_json(log)?)
        .bind(log.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn logs_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<FlowLog>> {
        self.fetch_all_data(
            "SELECT data FROM flow_logs WHERE instance_id = $1 ORDER BY seq",
            instance.as_str(),
        )
        .await
    }

    async fn get_copy(&mut self, id: &CopyRecordId) -> StoreResult<Option<CopyRecord>> {
        self.fetch_one_data("SELECT data FROM flow_copies WHERE id = $1", id.as_str())
            .await
    }

    async fn copies_for_instance(
        &mut self,
        instance: &FlowInstanceId,
    ) -> StoreResult<Vec<CopyRecord>> {
        self.fetch_all_data(
            "SELECT data FROM flow_copies WHERE instance_id = $1 ORDER BY seq",
            instance.as_str(),
        )
        .await
    }

    async fn copies_for_recipient(&mut self, user: &UserId) -> StoreResult<Vec<CopyRecord>> {
        self.fetch_all_data(
            "SELECT data FROM flow_copies WHERE recipient_id = $1 ORDER BY seq",
            user.as_str(),
        )
        .await
    }

    async fn save_copy(&mut self, copy: &CopyRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_copies (id, instance_id, recipient_id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(copy.id.as_str())
        .bind(copy.instance_id.as_str())
        .bind(copy.recipient_id.as_str())
        .bind(to_json(copy)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_branch_state(
        &mut self,
        instance: &FlowInstanceId,
        node: &NodeId,
    ) -> StoreResult<Option<ParallelBranchState>> {
        let row = sqlx::query(
            "SELECT data FROM flow_parallel_branches WHERE instance_id = $1 AND node_id = $2",
        )
        .bind(instance.as_str())
        .bind(node.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(query_error)?;
        row.map(decode_row).transpose()
    }

    async fn save_branch_state(&mut self, state: &ParallelBranchState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_parallel_branches (instance_id, node_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, node_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(state.instance_id.as_str())
        .bind(state.node_id.as_str())
        .bind(to_json(state)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(query_error)
    }
}
