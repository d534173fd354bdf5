// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedded on-disk ledger backed by `sled`.
//!
//! Trees:
//! - `instances`: instance id (16 bytes) → JSON `LifecycleInstance`
//! - `handles`: resource handle → owning instance id
//! - `escalations`: instance id ++ big-endian timestamp → JSON `EscalationRecord`
//!
//! Every mutating call flushes before returning, so an acknowledged write
//! survives a crash.

use async_trait::async_trait;
use std::path::Path;

use crate::domain::ledger::{close_record, guard_overwrite, EscalationRecord, Ledger, LedgerError};
use crate::domain::lifecycle::{InstanceId, LifecycleInstance, TerminationReason};

pub struct SledLedger {
    db: sled::Db,
    instances: sled::Tree,
    handles: sled::Tree,
    escalations: sled::Tree,
}

impl SledLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, LedgerError> {
        Ok(Self {
            instances: db.open_tree("instances")?,
            handles: db.open_tree("handles")?,
            escalations: db.open_tree("escalations")?,
            db,
        })
    }

    fn load(&self, id: InstanceId) -> Result<Option<LifecycleInstance>, LedgerError> {
        match self.instances.get(id.0.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for SledLedger {
    async fn put(&self, instance: &LifecycleInstance) -> Result<(), LedgerError> {
        let key = instance.id.0.as_bytes();

        if let Some(stored) = self.load(instance.id)? {
            guard_overwrite(&stored, instance)?;
        }

        if let Some(handle) = instance.resource_handle() {
            let claimed = self
                .handles
                .compare_and_swap(handle.as_str().as_bytes(), None::<&[u8]>, Some(key.to_vec()))?;
            if let Err(current) = claimed {
                if current.current.as_deref() != Some(&key[..]) {
                    return Err(LedgerError::Conflict(format!(
                        "resource handle {} already belongs to another instance",
                        handle
                    )));
                }
            }
        }

        self.instances.insert(key, serde_json::to_vec(instance)?)?;
        self.flush().await
    }

    async fn get(&self, id: InstanceId) -> Result<Option<LifecycleInstance>, LedgerError> {
        self.load(id)
    }

    async fn list_non_terminal(&self) -> Result<Vec<LifecycleInstance>, LedgerError> {
        let mut open = Vec::new();
        for entry in self.instances.iter() {
            let (_, bytes) = entry?;
            let instance: LifecycleInstance = serde_json::from_slice(&bytes)?;
            if !instance.is_terminal() {
                open.push(instance);
            }
        }
        open.sort_by_key(|i| i.created_at);
        Ok(open)
    }

    async fn mark_terminal(
        &self,
        id: InstanceId,
        reason: TerminationReason,
    ) -> Result<LifecycleInstance, LedgerError> {
        let stored = self.load(id)?.ok_or(LedgerError::NotFound(id))?;
        let closed = close_record(stored, reason)?;
        self.instances.insert(id.0.as_bytes(), serde_json::to_vec(&closed)?)?;
        self.flush().await?;
        Ok(closed)
    }

    async fn record_escalation(&self, record: &EscalationRecord) -> Result<(), LedgerError> {
        let mut key = record.instance_id.0.as_bytes().to_vec();
        key.extend_from_slice(&record.escalated_at.timestamp_micros().to_be_bytes());
        self.escalations.insert(key, serde_json::to_vec(record)?)?;
        self.flush().await
    }

    async fn list_escalations(&self) -> Result<Vec<EscalationRecord>, LedgerError> {
        let mut records = Vec::new();
        for entry in self.escalations.iter() {
            let (_, bytes) = entry?;
            records.push(serde_json::from_slice::<EscalationRecord>(&bytes)?);
        }
        records.sort_by_key(|r| r.escalated_at);
        Ok(records)
    }
}
