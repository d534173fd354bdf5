// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lifecycle Ledger Interface
//!
//! Durable record of every lifecycle instance, and the source of truth for
//! restart recovery. The controller writes each transition here *before* it
//! acts on the outside world, so a crash between "decided to tear down" and
//! "tore down" is always visible on the next start.
//!
//! | Backend | Implementation | Durability |
//! |---------|----------------|------------|
//! | `InMemory` | `InMemoryLedger` | process lifetime (tests, dev) |
//! | `Sled` | `SledLedger` | local disk, flushed per write |
//! | `PostgreSQL` | `PostgresLedger` | external database |
//!
//! Implementations must allow concurrent writes for different instance ids
//! without a global lock, and must refuse to bind one resource handle to two
//! instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::lifecycle::{
    InstanceId, LifecycleInstance, ResourceHandle, TargetAccountRef, TerminationReason,
};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum LedgerBackend {
    InMemory,
    Sled(SledConfig),
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct SledConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// Durable "needs manual intervention" record written when teardown could
/// not be confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub instance_id: InstanceId,
    pub target_account_ref: TargetAccountRef,
    #[serde(default)]
    pub resource_handle: Option<ResourceHandle>,
    pub attempts: u32,
    pub last_error: String,
    pub escalated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create or update the full instance record (write-ahead).
    async fn put(&self, instance: &LifecycleInstance) -> Result<(), LedgerError>;

    async fn get(&self, id: InstanceId) -> Result<Option<LifecycleInstance>, LedgerError>;

    /// Every instance without a TERMINATED/FAILED record.
    async fn list_non_terminal(&self) -> Result<Vec<LifecycleInstance>, LedgerError>;

    /// Close the stored record and return it in its terminal form.
    async fn mark_terminal(
        &self,
        id: InstanceId,
        reason: TerminationReason,
    ) -> Result<LifecycleInstance, LedgerError>;

    async fn record_escalation(&self, record: &EscalationRecord) -> Result<(), LedgerError>;

    async fn list_escalations(&self) -> Result<Vec<EscalationRecord>, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Ledger conflict: {0}")]
    Conflict(String),

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

/// Terminal records are immutable; only the exact same record may be re-put.
pub(crate) fn guard_overwrite(
    stored: &LifecycleInstance,
    incoming: &LifecycleInstance,
) -> Result<(), LedgerError> {
    if stored.is_terminal() && incoming.history().len() != stored.history().len() {
        return Err(LedgerError::Conflict(format!(
            "instance {} is already {}",
            stored.id,
            stored.state()
        )));
    }
    if let (Some(existing), Some(incoming_handle)) = (stored.resource_handle(), incoming.resource_handle()) {
        if existing != incoming_handle {
            return Err(LedgerError::Conflict(format!(
                "instance {} is bound to {}; refusing {}",
                stored.id, existing, incoming_handle
            )));
        }
    }
    Ok(())
}

pub(crate) fn close_record(
    mut instance: LifecycleInstance,
    reason: TerminationReason,
) -> Result<LifecycleInstance, LedgerError> {
    if instance.is_terminal() {
        return Ok(instance);
    }
    instance
        .begin_teardown(reason)
        .and_then(|_| instance.finish(reason))
        .map_err(|e| LedgerError::InvalidState(e.to_string()))?;
    Ok(instance)
}
