//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use super::{PlanStatus, PlanStatusRecord, RunState, StackStatus, Storage, StorageError};
use crate::core::stack::{Stack, StackPlan};
use crate::core::time::{millis_to_system_time, system_time_to_millis};
use crate::core::types::{PlanId, RunId, StackId};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_error)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_error)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn parse_lease(s: &str) -> Result<RunId, StorageError> {
    Uuid::parse_str(s)
        .map(RunId::from_uuid)
        .map_err(|e| StorageError::SerializationError(format!("invalid lease {}: {}", s, e)))
}

type StackRow = (String, String, String, i64, i64);

fn stack_from_row(row: StackRow) -> Result<Stack, StorageError> {
    let plans: Vec<StackPlan> = from_json(&row.1)?;
    let root_ids: Vec<PlanId> = from_json(&row.2)?;
    Ok(Stack {
        id: StackId::new(row.0),
        plans,
        root_ids,
        created_at: millis_to_system_time(row.3),
        updated_at: millis_to_system_time(row.4),
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_stack(&self, stack: Stack) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stacks (id, plans, root_ids, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(stack.id.as_str())
        .bind(to_json(&stack.plans)?)
        .bind(to_json(&stack.root_ids)?)
        .bind(system_time_to_millis(stack.created_at))
        .bind(system_time_to_millis(stack.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("stack: {}", stack.id)))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn update_stack(&self, stack: Stack) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE stacks
            SET plans = ?, root_ids = ?, created_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_json(&stack.plans)?)
        .bind(to_json(&stack.root_ids)?)
        .bind(system_time_to_millis(stack.created_at))
        .bind(system_time_to_millis(stack.updated_at))
        .bind(stack.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("stack: {}", stack.id)));
        }
        Ok(())
    }

    async fn get_stack(&self, id: &StackId) -> Result<Stack, StorageError> {
        let row: StackRow = sqlx::query_as(
            "SELECT id, plans, root_ids, created_at, updated_at FROM stacks WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| StorageError::NotFound(format!("stack: {}", id)))?;

        stack_from_row(row)
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>, StorageError> {
        let rows: Vec<StackRow> = sqlx::query_as(
            "SELECT id, plans, root_ids, created_at, updated_at FROM stacks ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(stack_from_row).collect()
    }

    async fn delete_stack(&self, id: &StackId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let result = sqlx::query("DELETE FROM stacks WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("stack: {}", id)));
        }

        sqlx::query("DELETE FROM plan_statuses WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM run_states WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn get_status(&self, id: &StackId) -> Result<StackStatus, StorageError> {
        let rows: Vec<(String, String, Option<i64>, Option<i64>, Option<String>, Option<i64>)> =
            sqlx::query_as(
                r#"
                SELECT plan_id, status, last_executed_at, duration_ms, error_message, exit_code
                FROM plan_statuses
                WHERE stack_id = ?
                "#,
            )
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut status = StackStatus::new(id.clone());
        for row in rows {
            let record = PlanStatusRecord {
                status: PlanStatus::from_str(&row.1)?,
                last_executed_at: row.2.map(millis_to_system_time),
                duration: row.3.map(|ms| Duration::from_millis(ms.max(0) as u64)),
                error_message: row.4,
                exit_code: row.5.map(|code| code as i32),
            };
            status.plans.insert(PlanId::new(row.0), record);
        }

        let run: Option<(bool, Option<i64>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT is_running, last_run_at, lease, lease_acquired_at FROM run_states WHERE stack_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some((is_running, last_run_at, lease, lease_acquired_at)) = run {
            status.run = RunState {
                is_running,
                last_run_at: last_run_at.map(millis_to_system_time),
                lease: lease.as_deref().map(parse_lease).transpose()?,
                lease_acquired_at: lease_acquired_at.map(millis_to_system_time),
            };
        }

        Ok(status)
    }

    async fn save_plan_status(
        &self,
        id: &StackId,
        plan_id: &PlanId,
        record: PlanStatusRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO plan_statuses
                (stack_id, plan_id, status, last_executed_at, duration_ms, error_message, exit_code)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(stack_id, plan_id) DO UPDATE SET
                status = excluded.status,
                last_executed_at = excluded.last_executed_at,
                duration_ms = excluded.duration_ms,
                error_message = excluded.error_message,
                exit_code = excluded.exit_code
            "#,
        )
        .bind(id.as_str())
        .bind(plan_id.as_str())
        .bind(record.status.as_str())
        .bind(record.last_executed_at.map(system_time_to_millis))
        .bind(record.duration.map(|d| d.as_millis() as i64))
        .bind(&record.error_message)
        .bind(record.exit_code.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn remove_plan_statuses(
        &self,
        id: &StackId,
        plan_ids: &[PlanId],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        for plan_id in plan_ids {
            sqlx::query("DELETE FROM plan_statuses WHERE stack_id = ? AND plan_id = ?")
                .bind(id.as_str())
                .bind(plan_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)
    }

    async fn reset_status(&self, id: &StackId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("DELETE FROM plan_statuses WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM run_states WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)
    }

    async fn try_acquire_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError> {
        sqlx::query(
            "INSERT INTO run_states (stack_id, is_running) VALUES (?, 0) ON CONFLICT(stack_id) DO NOTHING",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        // Single conditional update: only one caller can flip the flag.
        let result = sqlx::query(
            r#"
            UPDATE run_states
            SET is_running = 1, lease = ?, lease_acquired_at = ?
            WHERE stack_id = ? AND is_running = 0
            "#,
        )
        .bind(lease.to_string())
        .bind(system_time_to_millis(SystemTime::now()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE run_states
            SET is_running = 0, lease = NULL, lease_acquired_at = NULL, last_run_at = ?
            WHERE stack_id = ? AND lease = ?
            "#,
        )
        .bind(system_time_to_millis(SystemTime::now()))
        .bind(id.as_str())
        .bind(lease.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn force_release_run(&self, id: &StackId) -> Result<Option<RunId>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT lease FROM run_states WHERE stack_id = ? AND is_running = 1",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some((lease,)) = row else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE run_states
            SET is_running = 0, lease = NULL, lease_acquired_at = NULL, last_run_at = ?
            WHERE stack_id = ?
            "#,
        )
        .bind(system_time_to_millis(SystemTime::now()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        lease.as_deref().map(parse_lease).transpose()
    }
}
