// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lifecycle::{
    InstanceCondition, InstanceId, LifecycleState, ResourceHandle, TerminationReason,
};

/// Push notifications for lifecycle progress.
///
/// Published after the corresponding ledger write has succeeded, so a
/// subscriber never observes a state the ledger does not yet hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    InstanceCreated {
        instance_id: InstanceId,
        created_at: DateTime<Utc>,
    },
    StateChanged {
        instance_id: InstanceId,
        from: LifecycleState,
        to: LifecycleState,
        changed_at: DateTime<Utc>,
    },
    ResourceBound {
        instance_id: InstanceId,
        resource_handle: ResourceHandle,
        bound_at: DateTime<Utc>,
    },
    TeardownConfirmed {
        instance_id: InstanceId,
        resource_handle: Option<ResourceHandle>,
        confirmed_at: DateTime<Utc>,
    },
    TeardownEscalated {
        instance_id: InstanceId,
        resource_handle: Option<ResourceHandle>,
        attempts: u32,
        last_error: String,
        escalated_at: DateTime<Utc>,
    },
    InstanceFinished {
        instance_id: InstanceId,
        state: LifecycleState,
        condition: InstanceCondition,
        reason: TerminationReason,
        finished_at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            LifecycleEvent::InstanceCreated { instance_id, .. }
            | LifecycleEvent::StateChanged { instance_id, .. }
            | LifecycleEvent::ResourceBound { instance_id, .. }
            | LifecycleEvent::TeardownConfirmed { instance_id, .. }
            | LifecycleEvent::TeardownEscalated { instance_id, .. }
            | LifecycleEvent::InstanceFinished { instance_id, .. } => *instance_id,
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::InstanceCreated { .. } => "instance_created",
            LifecycleEvent::StateChanged { .. } => "state_changed",
            LifecycleEvent::ResourceBound { .. } => "resource_bound",
            LifecycleEvent::TeardownConfirmed { .. } => "teardown_confirmed",
            LifecycleEvent::TeardownEscalated { .. } => "teardown_escalated",
            LifecycleEvent::InstanceFinished { .. } => "instance_finished",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, LifecycleEvent::InstanceFinished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changed_serialization() {
        let id = InstanceId::new();
        let event = LifecycleEvent::StateChanged {
            instance_id: id,
            from: LifecycleState::AwaitingReady,
            to: LifecycleState::Ready,
            changed_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("StateChanged"));
        assert!(json.contains("AWAITING_READY"));

        let deserialized: LifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.instance_id(), id);
        assert_eq!(deserialized.kind(), "state_changed");
    }

    #[test]
    fn test_escalation_carries_last_error() {
        let event = LifecycleEvent::TeardownEscalated {
            instance_id: InstanceId::new(),
            resource_handle: Some(ResourceHandle::new("i-0abc")),
            attempts: 8,
            last_error: "provider unavailable".to_string(),
            escalated_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("provider unavailable"));
        assert!(!event.is_final());
    }
}
