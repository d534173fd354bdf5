// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ledger Implementations
//!
//! Infrastructure implementations of the `Ledger` abstraction defined in the
//! domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve lifecycle instances
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresLedger** - external database, JSONB record per instance
//! - **SledLedger** - embedded on-disk store for single-node deployments
//! - **InMemoryLedger** - `DashMap`-backed, for tests and development
//!
//! All three enforce the same rules: a resource handle belongs to at most one
//! instance, terminal records are immutable, and writes for different
//! instances never contend on a shared lock.

pub mod postgres_ledger;
pub mod sled_ledger;

pub use postgres_ledger::PostgresLedger;
pub use sled_ledger::SledLedger;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::ledger::{close_record, guard_overwrite, EscalationRecord, Ledger, LedgerError};
use crate::domain::lifecycle::{InstanceId, LifecycleInstance, ResourceHandle, TerminationReason};

#[derive(Default)]
pub struct InMemoryLedger {
    instances: DashMap<InstanceId, LifecycleInstance>,
    handles: DashMap<ResourceHandle, InstanceId>,
    escalations: RwLock<Vec<EscalationRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn put(&self, instance: &LifecycleInstance) -> Result<(), LedgerError> {
        // Lock order: instance entry, then handle entry.
        let entry = self.instances.entry(instance.id);
        if let Entry::Occupied(stored) = &entry {
            guard_overwrite(stored.get(), instance)?;
        }

        if let Some(handle) = instance.resource_handle() {
            match self.handles.entry(handle.clone()) {
                Entry::Occupied(owner) if *owner.get() != instance.id => {
                    return Err(LedgerError::Conflict(format!(
                        "resource handle {} already belongs to instance {}",
                        handle,
                        owner.get()
                    )));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(instance.id);
                }
            }
        }

        entry.insert(instance.clone());
        Ok(())
    }

    async fn get(&self, id: InstanceId) -> Result<Option<LifecycleInstance>, LedgerError> {
        Ok(self.instances.get(&id).map(|r| r.value().clone()))
    }

    async fn list_non_terminal(&self) -> Result<Vec<LifecycleInstance>, LedgerError> {
        let mut open: Vec<_> = self
            .instances
            .iter()
            .filter(|r| !r.value().is_terminal())
            .map(|r| r.value().clone())
            .collect();
        open.sort_by_key(|i| i.created_at);
        Ok(open)
    }

    async fn mark_terminal(
        &self,
        id: InstanceId,
        reason: TerminationReason,
    ) -> Result<LifecycleInstance, LedgerError> {
        let mut stored = self.instances.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        let closed = close_record(stored.value().clone(), reason)?;
        *stored.value_mut() = closed.clone();
        Ok(closed)
    }

    async fn record_escalation(&self, record: &EscalationRecord) -> Result<(), LedgerError> {
        self.escalations.write().push(record.clone());
        Ok(())
    }

    async fn list_escalations(&self) -> Result<Vec<EscalationRecord>, LedgerError> {
        Ok(self.escalations.read().clone())
    }
}
