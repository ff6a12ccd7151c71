//! Saga instance store.
//!
//! A single orchestrator consumer mutates any given instance (replies are
//! partitioned by saga id), so updates rewrite the row and its step
//! records wholesale rather than merging field-by-field.

use crate::storage_error;
use chrono::{DateTime, Utc};
use rushtix_core::repository::RepoFuture;
use rushtix_core::saga::{SagaStepRecord, StepOutcome};
use rushtix_core::{DomainError, SagaId, SagaInstance, SagaStatus, SagaStore};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// PostgreSQL-backed [`SagaStore`].
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Create the store over a shared pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_instance(row: &PgRow, steps: Vec<SagaStepRecord>) -> Result<SagaInstance, DomainError> {
        let status: String = row.get("status");
        #[allow(clippy::cast_sign_loss)]
        Ok(SagaInstance {
            id: SagaId::from_uuid(row.get("id")),
            name: row.get("name"),
            status: SagaStatus::parse(&status)
                .ok_or_else(|| DomainError::Internal(format!("unknown saga status: {status}")))?,
            current_step: row.get::<i32, _>("current_step") as u32,
            data: row.get("data"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error: row.get("error"),
            steps,
        })
    }

    fn row_to_step(row: &PgRow) -> Result<SagaStepRecord, DomainError> {
        let outcome: Option<serde_json::Value> = row.get("outcome");
        let outcome: Option<StepOutcome> = outcome
            .map(serde_json::from_value)
            .transpose()
            .map_err(DomainError::Serialization)?;
        #[allow(clippy::cast_sign_loss)]
        Ok(SagaStepRecord {
            step_index: row.get::<i32, _>("step_index") as u32,
            step_name: row.get("step_name"),
            started_at: row.get("started_at"),
            timeout_at: row.get("timeout_at"),
            finished_at: row.get("finished_at"),
            outcome,
            retry_count: row.get::<i32, _>("retry_count") as u32,
        })
    }

    async fn load_steps(&self, id: SagaId) -> Result<Vec<SagaStepRecord>, DomainError> {
        let rows = sqlx::query(
            "SELECT * FROM saga_steps WHERE saga_id = $1 ORDER BY step_index",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("failed to load saga steps", &e))?;
        rows.iter().map(Self::row_to_step).collect()
    }

    async fn write_steps(
        tx: &mut Transaction<'_, Postgres>,
        instance: &SagaInstance,
    ) -> Result<(), DomainError> {
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = $1")
            .bind(instance.id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| storage_error("failed to clear saga steps", &e))?;

        for step in &instance.steps {
            let outcome = step
                .outcome
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(DomainError::Serialization)?;

            sqlx::query(
                r"
                INSERT INTO saga_steps (
                    saga_id, step_index, step_name, started_at, timeout_at,
                    finished_at, outcome, retry_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(instance.id.as_uuid())
            .bind(i32::try_from(step.step_index).unwrap_or(i32::MAX))
            .bind(&step.step_name)
            .bind(step.started_at)
            .bind(step.timeout_at)
            .bind(step.finished_at)
            .bind(outcome)
            .bind(i32::try_from(step.retry_count).unwrap_or(i32::MAX))
            .execute(&mut **tx)
            .await
            .map_err(|e| storage_error("failed to insert saga step", &e))?;
        }

        Ok(())
    }

    async fn instances_for_rows(
        &self,
        rows: Vec<PgRow>,
    ) -> Result<Vec<SagaInstance>, DomainError> {
        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = SagaId::from_uuid(row.get("id"));
            let steps = self.load_steps(id).await?;
            instances.push(Self::row_to_instance(row, steps)?);
        }
        Ok(instances)
    }
}

impl SagaStore for PostgresSagaStore {
    fn insert(&self, instance: &SagaInstance) -> RepoFuture<'_, ()> {
        let instance = instance.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage_error("failed to begin transaction", &e))?;

            sqlx::query(
                r"
                INSERT INTO saga_instances (
                    id, name, status, current_step, data, started_at, completed_at, error
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(instance.id.as_uuid())
            .bind(&instance.name)
            .bind(instance.status.as_str())
            .bind(i32::try_from(instance.current_step).unwrap_or(i32::MAX))
            .bind(&instance.data)
            .bind(instance.started_at)
            .bind(instance.completed_at)
            .bind(&instance.error)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("failed to insert saga instance", &e))?;

            Self::write_steps(&mut tx, &instance).await?;

            tx.commit()
                .await
                .map_err(|e| storage_error("failed to commit saga insert", &e))?;

            metrics::counter!("saga.started", "name" => instance.name.clone()).increment(1);
            Ok(())
        })
    }

    fn get(&self, id: SagaId) -> RepoFuture<'_, Option<SagaInstance>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM saga_instances WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error("failed to fetch saga instance", &e))?;

            match row {
                Some(row) => {
                    let steps = self.load_steps(id).await?;
                    Ok(Some(Self::row_to_instance(&row, steps)?))
                }
                None => Ok(None),
            }
        })
    }

    fn update(&self, instance: &SagaInstance) -> RepoFuture<'_, ()> {
        let instance = instance.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage_error("failed to begin transaction", &e))?;

            sqlx::query(
                r"
                UPDATE saga_instances
                SET status = $2,
                    current_step = $3,
                    data = $4,
                    completed_at = $5,
                    error = $6
                WHERE id = $1
                ",
            )
            .bind(instance.id.as_uuid())
            .bind(instance.status.as_str())
            .bind(i32::try_from(instance.current_step).unwrap_or(i32::MAX))
            .bind(&instance.data)
            .bind(instance.completed_at)
            .bind(&instance.error)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("failed to update saga instance", &e))?;

            Self::write_steps(&mut tx, &instance).await?;

            tx.commit()
                .await
                .map_err(|e| storage_error("failed to commit saga update", &e))?;
            Ok(())
        })
    }

    fn find_in_flight(&self, limit: u32) -> RepoFuture<'_, Vec<SagaInstance>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT * FROM saga_instances
                WHERE status IN ('running', 'compensating')
                ORDER BY started_at
                LIMIT $1
                ",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("failed to scan in-flight sagas", &e))?;
            self.instances_for_rows(rows).await
        })
    }

    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepoFuture<'_, Vec<SagaInstance>> {
        Box::pin(async move {
            // The current step's record carries the deadline.
            let rows = sqlx::query(
                r"
                SELECT i.* FROM saga_instances i
                JOIN saga_steps s
                  ON s.saga_id = i.id AND s.step_index = i.current_step
                WHERE i.status IN ('running', 'compensating')
                  AND s.finished_at IS NULL
                  AND s.timeout_at < $1
                ORDER BY s.timeout_at
                LIMIT $2
                ",
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("failed to scan timed-out sagas", &e))?;
            self.instances_for_rows(rows).await
        })
    }
}
