// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::ledger::{close_record, guard_overwrite, EscalationRecord, Ledger, LedgerError};
use crate::domain::lifecycle::{InstanceId, LifecycleInstance, TerminationReason};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS lifecycle_instances (
        id UUID PRIMARY KEY,
        state TEXT NOT NULL,
        resource_handle TEXT UNIQUE,
        termination_reason TEXT,
        record JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_lifecycle_instances_state ON lifecycle_instances (state)",
    r#"
    CREATE TABLE IF NOT EXISTS lifecycle_escalations (
        id BIGSERIAL PRIMARY KEY,
        instance_id UUID NOT NULL,
        resource_handle TEXT,
        attempts INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        record JSONB NOT NULL,
        escalated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| LedgerError::Database(format!("Failed to apply ledger schema: {}", e)))?;
        }
        Ok(())
    }
}

fn map_write_error(e: sqlx::Error) -> LedgerError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LedgerError::Conflict(format!("resource handle already bound: {}", db.message()))
        }
        _ => LedgerError::Database(format!("Failed to save instance: {}", e)),
    }
}

fn decode(value: serde_json::Value) -> Result<LifecycleInstance, LedgerError> {
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Serialization(format!("Failed to deserialize instance: {}", e)))
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn put(&self, instance: &LifecycleInstance) -> Result<(), LedgerError> {
        let record = serde_json::to_value(instance)?;

        // Terminal rows are never rewritten by this statement.
        let result = sqlx::query(
            r#"
            INSERT INTO lifecycle_instances (
                id, state, resource_handle, termination_reason, record, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                resource_handle = COALESCE(lifecycle_instances.resource_handle, EXCLUDED.resource_handle),
                termination_reason = EXCLUDED.termination_reason,
                record = EXCLUDED.record,
                updated_at = NOW()
            WHERE lifecycle_instances.state NOT IN ('TERMINATED', 'FAILED')
            "#,
        )
        .bind(instance.id.0)
        .bind(instance.state().as_str())
        .bind(instance.resource_handle().map(|h| h.as_str().to_string()))
        .bind(instance.termination_reason().map(|r| r.as_str()))
        .bind(record)
        .bind(instance.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            // Only an identical re-put of a terminal record is acceptable.
            if let Some(stored) = self.get(instance.id).await? {
                guard_overwrite(&stored, instance)?;
            }
        }
        Ok(())
    }

    async fn get(&self, id: InstanceId) -> Result<Option<LifecycleInstance>, LedgerError> {
        let row = sqlx::query("SELECT record FROM lifecycle_instances WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode(r.get("record"))).transpose()
    }

    async fn list_non_terminal(&self) -> Result<Vec<LifecycleInstance>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM lifecycle_instances
            WHERE state NOT IN ('TERMINATED', 'FAILED')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| decode(r.get("record"))).collect()
    }

    async fn mark_terminal(
        &self,
        id: InstanceId,
        reason: TerminationReason,
    ) -> Result<LifecycleInstance, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT record FROM lifecycle_instances WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        let closed = close_record(decode(row.get("record"))?, reason)?;

        sqlx::query(
            r#"
            UPDATE lifecycle_instances
            SET state = $2, termination_reason = $3, record = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(closed.state().as_str())
        .bind(closed.termination_reason().map(|r| r.as_str()))
        .bind(serde_json::to_value(&closed)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(closed)
    }

    async fn record_escalation(&self, record: &EscalationRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_escalations (
                instance_id, resource_handle, attempts, last_error, record, escalated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.instance_id.0)
        .bind(record.resource_handle.as_ref().map(|h| h.as_str().to_string()))
        .bind(record.attempts as i32)
        .bind(&record.last_error)
        .bind(serde_json::to_value(record)?)
        .bind(record.escalated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(format!("Failed to record escalation: {}", e)))?;
        Ok(())
    }

    async fn list_escalations(&self) -> Result<Vec<EscalationRecord>, LedgerError> {
        let rows = sqlx::query("SELECT record FROM lifecycle_escalations ORDER BY escalated_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let value: serde_json::Value = r.get("record");
                serde_json::from_value(value).map_err(LedgerError::from)
            })
            .collect()
    }
}
