// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lifecycle Instance Aggregate
//!
//! A `LifecycleInstance` is one ephemeral-agent run: exactly one compute unit,
//! provisioned in a foreign trust domain, handed exactly one job, and torn
//! down. The aggregate owns the invariants that every other component relies
//! on:
//!
//! - states only move forward (`PENDING` → … → `TEARING_DOWN` → terminal);
//! - `TERMINATED` and `FAILED` are absorbing and only reachable from
//!   `TEARING_DOWN`;
//! - at most one `ResourceHandle` is ever bound to an instance;
//! - the `ResourceSpec` is fixed at construction.
//!
//! The full transition path is kept in `history` so the ledger record alone
//! explains how an instance ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Label under which the provisioned agent registers with the
    /// work-receiving system.
    pub fn agent_label(&self) -> String {
        format!("ember-{}", self.0.simple())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque reference to the trust domain (role) the orchestrator assumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAccountRef {
    pub role_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl TargetAccountRef {
    pub fn new(role_ref: impl Into<String>) -> Self {
        Self {
            role_ref: role_ref.into(),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Largest custom CPU allocation accepted (256 cores).
pub const MAX_CUSTOM_CPU_MILLIS: u32 = 256_000;
/// Largest custom memory allocation accepted (4 TiB).
pub const MAX_CUSTOM_MEMORY_MB: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    Xlarge,
    Custom { cpu_millis: u32, memory_mb: u64 },
}

impl SizeClass {
    pub fn cpu_millis(&self) -> u32 {
        match self {
            SizeClass::Small => 1_000,
            SizeClass::Medium => 2_000,
            SizeClass::Large => 4_000,
            SizeClass::Xlarge => 8_000,
            SizeClass::Custom { cpu_millis, .. } => *cpu_millis,
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        const GIB: u64 = 1024 * 1024 * 1024;
        match self {
            SizeClass::Small => 2 * GIB,
            SizeClass::Medium => 4 * GIB,
            SizeClass::Large => 8 * GIB,
            SizeClass::Xlarge => 16 * GIB,
            SizeClass::Custom { memory_mb, .. } => memory_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Immutable description of the compute unit to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Image reference (machine image id or container image)
    pub image: String,
    pub size: SizeClass,
    /// Identity/profile attached to the compute unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_profile: Option<String>,
    /// Network placement (subnet, docker network, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl ResourceSpec {
    pub fn new(image: impl Into<String>, size: SizeClass) -> Self {
        Self {
            image: image.into(),
            size,
            identity_profile: None,
            network: None,
        }
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.image.trim().is_empty() {
            return Err(LifecycleError::InvalidSpec("image reference cannot be empty".to_string()));
        }
        if let SizeClass::Custom { cpu_millis, memory_mb } = self.size {
            if cpu_millis == 0 || memory_mb == 0 {
                return Err(LifecycleError::InvalidSpec(
                    "custom size class needs non-zero cpu and memory".to_string(),
                ));
            }
            if cpu_millis > MAX_CUSTOM_CPU_MILLIS || memory_mb > MAX_CUSTOM_MEMORY_MB {
                return Err(LifecycleError::InvalidSpec(format!(
                    "custom size class exceeds {} cpu millis or {} MiB",
                    MAX_CUSTOM_CPU_MILLIS, MAX_CUSTOM_MEMORY_MB
                )));
            }
        }
        Ok(())
    }
}

/// Provider-issued identifier of a provisioned compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle(pub String);

impl ResourceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Pending,
    Provisioning,
    AwaitingReady,
    Ready,
    InUse,
    TearingDown,
    Terminated,
    Failed,
}

impl LifecycleState {
    fn rank(self) -> u8 {
        match self {
            LifecycleState::Pending => 0,
            LifecycleState::Provisioning => 1,
            LifecycleState::AwaitingReady => 2,
            LifecycleState::Ready => 3,
            LifecycleState::InUse => 4,
            LifecycleState::TearingDown => 5,
            LifecycleState::Terminated | LifecycleState::Failed => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Pending => "PENDING",
            LifecycleState::Provisioning => "PROVISIONING",
            LifecycleState::AwaitingReady => "AWAITING_READY",
            LifecycleState::Ready => "READY",
            LifecycleState::InUse => "IN_USE",
            LifecycleState::TearingDown => "TEARING_DOWN",
            LifecycleState::Terminated => "TERMINATED",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => LifecycleState::Pending,
            "PROVISIONING" => LifecycleState::Provisioning,
            "AWAITING_READY" => LifecycleState::AwaitingReady,
            "READY" => LifecycleState::Ready,
            "IN_USE" => LifecycleState::InUse,
            "TEARING_DOWN" => LifecycleState::TearingDown,
            "TERMINATED" => LifecycleState::Terminated,
            "FAILED" => LifecycleState::Failed,
            other => return Err(LifecycleError::UnknownState(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Timeout,
    ProvisionError,
    CallerCancelled,
    OrchestratorRecovery,
}

impl TerminationReason {
    /// Terminal state reached when teardown is confirmed for this reason.
    pub fn terminal_state(self) -> LifecycleState {
        match self {
            TerminationReason::Completed | TerminationReason::CallerCancelled => LifecycleState::Terminated,
            TerminationReason::Timeout
            | TerminationReason::ProvisionError
            | TerminationReason::OrchestratorRecovery => LifecycleState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::Timeout => "timeout",
            TerminationReason::ProvisionError => "provision_error",
            TerminationReason::CallerCancelled => "caller_cancelled",
            TerminationReason::OrchestratorRecovery => "orchestrator_recovery",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion signal delivered by the work-receiving system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobOutcome {
    pub fn succeeded() -> Self {
        Self { success: true, detail: None }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: LifecycleState, to: LifecycleState },
    #[error("Instance is already terminal ({0})")]
    AlreadyTerminal(LifecycleState),
    #[error("Resource handle already bound ({existing}); refusing to bind {attempted}")]
    HandleAlreadyBound { existing: ResourceHandle, attempted: ResourceHandle },
    #[error("Resource handles can only be bound while PROVISIONING (state: {0})")]
    BindOutsideProvisioning(LifecycleState),
    #[error("Invalid resource spec: {0}")]
    InvalidSpec(String),
    #[error("Unknown lifecycle state: {0}")]
    UnknownState(String),
}

/// Reportable condition surfaced by `getStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceCondition {
    Active,
    Terminated,
    Failed,
    /// Teardown could not be confirmed; an operator must intervene.
    OrphanRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub state: LifecycleState,
    pub condition: InstanceCondition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_handle: Option<ResourceHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_outcome: Option<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleInstance {
    pub id: InstanceId,
    pub target_account_ref: TargetAccountRef,
    resource_spec: ResourceSpec,
    state: LifecycleState,
    resource_handle: Option<ResourceHandle>,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    termination_reason: Option<TerminationReason>,
    #[serde(with = "humantime_serde")]
    pub ready_deadline: Duration,
    #[serde(default, with = "humantime_serde")]
    pub job_deadline: Option<Duration>,
    /// Set once the instance entered PROVISIONING; from then on teardown is owed.
    provision_attempted: bool,
    orphan_risk: bool,
    failure: Option<String>,
    job_outcome: Option<JobOutcome>,
    history: Vec<StateTransition>,
}

impl LifecycleInstance {
    pub fn new(
        resource_spec: ResourceSpec,
        target_account_ref: TargetAccountRef,
        ready_deadline: Duration,
        job_deadline: Option<Duration>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            target_account_ref,
            resource_spec,
            state: LifecycleState::Pending,
            resource_handle: None,
            created_at: Utc::now(),
            ready_at: None,
            terminated_at: None,
            termination_reason: None,
            ready_deadline,
            job_deadline,
            provision_attempted: false,
            orphan_risk: false,
            failure: None,
            job_outcome: None,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn resource_spec(&self) -> &ResourceSpec {
        &self.resource_spec
    }

    pub fn resource_handle(&self) -> Option<&ResourceHandle> {
        self.resource_handle.as_ref()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn orphan_risk(&self) -> bool {
        self.orphan_risk
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn job_outcome(&self) -> Option<&JobOutcome> {
        self.job_outcome.as_ref()
    }

    /// True once the instance has ever reached PROVISIONING.
    pub fn requires_teardown(&self) -> bool {
        self.provision_attempted
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move forward to a non-terminal state.
    pub fn transition_to(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        if self.state.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal(self.state));
        }
        if next.is_terminal() || next.rank() <= self.state.rank() {
            return Err(LifecycleError::InvalidTransition { from: self.state, to: next });
        }

        let now = Utc::now();
        match next {
            LifecycleState::Provisioning => self.provision_attempted = true,
            LifecycleState::Ready => self.ready_at = Some(now),
            _ => {}
        }
        self.record(next, now);
        Ok(())
    }

    pub fn bind_resource(&mut self, handle: ResourceHandle) -> Result<(), LifecycleError> {
        if let Some(existing) = &self.resource_handle {
            return Err(LifecycleError::HandleAlreadyBound {
                existing: existing.clone(),
                attempted: handle,
            });
        }
        if self.state != LifecycleState::Provisioning {
            return Err(LifecycleError::BindOutsideProvisioning(self.state));
        }
        self.resource_handle = Some(handle);
        Ok(())
    }

    /// Enter TEARING_DOWN. Re-entering keeps the reason recorded first.
    pub fn begin_teardown(&mut self, reason: TerminationReason) -> Result<(), LifecycleError> {
        if self.state == LifecycleState::TearingDown {
            return Ok(());
        }
        self.transition_to(LifecycleState::TearingDown)?;
        self.termination_reason.get_or_insert(reason);
        Ok(())
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failure.get_or_insert(message.into());
    }

    pub fn record_job_outcome(&mut self, outcome: JobOutcome) {
        self.job_outcome = Some(outcome);
    }

    pub fn flag_orphan_risk(&mut self) {
        self.orphan_risk = true;
    }

    /// Close the lifecycle once teardown has been confirmed or escalated.
    pub fn finish(&mut self, reason: TerminationReason) -> Result<LifecycleState, LifecycleError> {
        if self.state.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal(self.state));
        }
        if self.state != LifecycleState::TearingDown {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: reason.terminal_state(),
            });
        }
        let reason = *self.termination_reason.get_or_insert(reason);
        let terminal = if self.orphan_risk {
            LifecycleState::Failed
        } else {
            reason.terminal_state()
        };
        let now = Utc::now();
        self.terminated_at = Some(now);
        self.record(terminal, now);
        Ok(terminal)
    }

    fn record(&mut self, next: LifecycleState, at: DateTime<Utc>) {
        self.history.push(StateTransition { from: self.state, to: next, at });
        self.state = next;
    }

    pub fn condition(&self) -> InstanceCondition {
        if self.orphan_risk {
            return InstanceCondition::OrphanRisk;
        }
        match self.state {
            LifecycleState::Terminated => InstanceCondition::Terminated,
            LifecycleState::Failed => InstanceCondition::Failed,
            _ => InstanceCondition::Active,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            state: self.state,
            condition: self.condition(),
            termination_reason: self.termination_reason,
            resource_handle: self.resource_handle.clone(),
            job_outcome: self.job_outcome.clone(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            ready_at: self.ready_at,
            terminated_at: self.terminated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> LifecycleInstance {
        LifecycleInstance::new(
            ResourceSpec::new("ghcr.io/acme/runner:1.4", SizeClass::Medium),
            TargetAccountRef::new("arn:aws:iam::123456789012:role/ci-ephemeral"),
            Duration::from_secs(30),
            None,
        )
    }

    #[test]
    fn test_forward_path_is_recorded() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        inst.bind_resource(ResourceHandle::new("i-0abc")).unwrap();
        inst.transition_to(LifecycleState::AwaitingReady).unwrap();
        inst.transition_to(LifecycleState::Ready).unwrap();
        inst.transition_to(LifecycleState::InUse).unwrap();
        inst.begin_teardown(TerminationReason::Completed).unwrap();
        let terminal = inst.finish(TerminationReason::Completed).unwrap();

        assert_eq!(terminal, LifecycleState::Terminated);
        let path: Vec<_> = inst.history().iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                LifecycleState::Provisioning,
                LifecycleState::AwaitingReady,
                LifecycleState::Ready,
                LifecycleState::InUse,
                LifecycleState::TearingDown,
                LifecycleState::Terminated,
            ]
        );
        assert!(inst.ready_at.is_some());
        assert!(inst.terminated_at.is_some());
    }

    #[test]
    fn test_states_never_move_backwards() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        inst.transition_to(LifecycleState::AwaitingReady).unwrap();

        let err = inst.transition_to(LifecycleState::Provisioning).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert!(inst.transition_to(LifecycleState::AwaitingReady).is_err());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut inst = instance();
        inst.begin_teardown(TerminationReason::CallerCancelled).unwrap();
        inst.finish(TerminationReason::CallerCancelled).unwrap();

        assert_eq!(
            inst.transition_to(LifecycleState::TearingDown),
            Err(LifecycleError::AlreadyTerminal(LifecycleState::Terminated))
        );
        assert!(inst.finish(TerminationReason::Timeout).is_err());
        assert!(!inst.requires_teardown());
    }

    #[test]
    fn test_terminal_only_reachable_from_teardown() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        assert!(inst.transition_to(LifecycleState::Failed).is_err());
        assert!(inst.finish(TerminationReason::ProvisionError).is_err());
    }

    #[test]
    fn test_rebinding_is_forbidden() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        inst.bind_resource(ResourceHandle::new("i-first")).unwrap();

        let err = inst.bind_resource(ResourceHandle::new("i-second")).unwrap_err();
        assert!(matches!(err, LifecycleError::HandleAlreadyBound { .. }));
        assert_eq!(inst.resource_handle().unwrap().as_str(), "i-first");
    }

    #[test]
    fn test_first_teardown_reason_wins() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        inst.begin_teardown(TerminationReason::Timeout).unwrap();
        inst.begin_teardown(TerminationReason::OrchestratorRecovery).unwrap();

        assert_eq!(inst.finish(TerminationReason::OrchestratorRecovery).unwrap(), LifecycleState::Failed);
        assert_eq!(inst.termination_reason(), Some(TerminationReason::Timeout));
    }

    #[test]
    fn test_orphan_risk_forces_failed_condition() {
        let mut inst = instance();
        inst.transition_to(LifecycleState::Provisioning).unwrap();
        inst.begin_teardown(TerminationReason::Completed).unwrap();
        inst.flag_orphan_risk();

        assert_eq!(inst.finish(TerminationReason::Completed).unwrap(), LifecycleState::Failed);
        assert_eq!(inst.status().condition, InstanceCondition::OrphanRisk);
    }

    #[test]
    fn test_state_names_match_wire_format() {
        let json = serde_json::to_string(&LifecycleState::AwaitingReady).unwrap();
        assert_eq!(json, "\"AWAITING_READY\"");
        let reason = serde_json::to_string(&TerminationReason::CallerCancelled).unwrap();
        assert_eq!(reason, "\"caller_cancelled\"");
        assert_eq!("IN_USE".parse::<LifecycleState>().unwrap(), LifecycleState::InUse);
    }

    #[test]
    fn test_spec_validation() {
        assert!(ResourceSpec::new("", SizeClass::Small).validate().is_err());
        assert!(ResourceSpec::new("img", SizeClass::Custom { cpu_millis: 0, memory_mb: 512 })
            .validate()
            .is_err());
        assert!(ResourceSpec::new("img", SizeClass::Large).validate().is_ok());
    }

    #[test]
    fn test_oversized_custom_class_is_rejected() {
        let huge = SizeClass::Custom {
            cpu_millis: 1,
            memory_mb: u64::MAX / 1024,
        };
        assert!(ResourceSpec::new("img", huge.clone()).validate().is_err());
        assert_eq!(huge.memory_bytes(), u64::MAX);

        let too_many_cpus = SizeClass::Custom {
            cpu_millis: MAX_CUSTOM_CPU_MILLIS + 1,
            memory_mb: 512,
        };
        assert!(ResourceSpec::new("img", too_many_cpus).validate().is_err());

        let largest = SizeClass::Custom {
            cpu_millis: MAX_CUSTOM_CPU_MILLIS,
            memory_mb: MAX_CUSTOM_MEMORY_MB,
        };
        assert_eq!(largest.memory_bytes(), 4 * 1024 * 1024 * 1024 * 1024);
        assert!(ResourceSpec::new("img", largest).validate().is_ok());
    }
}
