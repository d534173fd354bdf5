// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-process compute provider.
//!
//! Keeps resources in memory, enforces a live-resource quota, and emulates a
//! server-side idempotency token (one live resource per correlation id).
//! Faults can be queued to exercise ambiguous creates, providers without
//! idempotency, resources that never started and flaky teardown.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::compute::{BootConfig, ComputeError, ComputeProvider, ResourceStatus, ResourceTags};
use crate::domain::credentials::ScopedCredential;
use crate::domain::lifecycle::{InstanceId, ResourceHandle, ResourceSpec};

#[derive(Debug, Clone)]
pub enum CreateFault {
    /// Fail without creating anything.
    Fail(ComputeError),
    /// Create the resource, then report a timeout to the caller.
    CreateThenTimeout,
    /// Create two resources for one correlation id, then report a timeout.
    CreateDuplicateThenTimeout,
    /// Create the resource but leave it unstarted, then report the failure.
    CreateWithoutStart,
}

#[derive(Debug, Clone)]
struct SimulatedResource {
    correlation_id: InstanceId,
    agent_label: String,
    status: ResourceStatus,
    created_at: Instant,
}

#[derive(Default)]
struct SimulatedState {
    resources: HashMap<ResourceHandle, SimulatedResource>,
    create_faults: VecDeque<CreateFault>,
    terminate_faults: VecDeque<ComputeError>,
    terminate_outage: bool,
    terminate_calls: HashMap<ResourceHandle, u32>,
}

pub struct SimulatedComputeProvider {
    quota: usize,
    state: Mutex<SimulatedState>,
    next_id: AtomicU64,
    create_calls: AtomicU32,
    find_calls: AtomicU32,
    latency: Duration,
}

impl SimulatedComputeProvider {
    pub fn new(quota: usize) -> Self {
        Self {
            quota,
            state: Mutex::new(SimulatedState::default()),
            next_id: AtomicU64::new(1),
            create_calls: AtomicU32::new(0),
            find_calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Delay applied to every create and terminate call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn inject_create_fault(&self, fault: CreateFault) {
        self.state.lock().create_faults.push_back(fault);
    }

    pub fn inject_terminate_fault(&self, error: ComputeError) {
        self.state.lock().terminate_faults.push_back(error);
    }

    /// While set, every terminate call fails transiently.
    pub fn set_terminate_outage(&self, outage: bool) {
        self.state.lock().terminate_outage = outage;
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> u32 {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.state.lock().terminate_calls.values().sum()
    }

    pub fn terminate_calls_for(&self, handle: &ResourceHandle) -> u32 {
        self.state.lock().terminate_calls.get(handle).copied().unwrap_or(0)
    }

    pub fn live_resources(&self) -> Vec<ResourceHandle> {
        let state = self.state.lock();
        let mut live: Vec<_> = state
            .resources
            .iter()
            .filter(|(_, r)| r.status != ResourceStatus::Terminated)
            .map(|(h, _)| h.clone())
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    pub fn live_resources_for(&self, correlation_id: InstanceId) -> Vec<ResourceHandle> {
        let state = self.state.lock();
        Self::live_for(&state, correlation_id)
    }

    pub fn live_count(&self) -> usize {
        self.live_resources().len()
    }

    /// When the live resource carrying `agent_label` was created.
    pub fn booted_at(&self, agent_label: &str) -> Option<Instant> {
        self.state
            .lock()
            .resources
            .values()
            .find(|r| r.agent_label == agent_label && r.status == ResourceStatus::Running)
            .map(|r| r.created_at)
    }

    fn live_for(state: &SimulatedState, correlation_id: InstanceId) -> Vec<ResourceHandle> {
        let mut handles: Vec<_> = state
            .resources
            .iter()
            .filter(|(_, r)| r.correlation_id == correlation_id && r.status != ResourceStatus::Terminated)
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    fn insert(&self, state: &mut SimulatedState, tags: &ResourceTags, status: ResourceStatus) -> ResourceHandle {
        let handle = ResourceHandle::new(format!("sim-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        state.resources.insert(
            handle.clone(),
            SimulatedResource {
                correlation_id: tags.correlation_id,
                agent_label: tags.agent_label.clone(),
                status,
                created_at: Instant::now(),
            },
        );
        handle
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ComputeProvider for SimulatedComputeProvider {
    async fn create_resource(
        &self,
        _credential: &ScopedCredential,
        _spec: &ResourceSpec,
        tags: &ResourceTags,
        _boot: &BootConfig,
    ) -> Result<ResourceHandle, ComputeError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock();
        let fault = state.create_faults.pop_front();
        if let Some(CreateFault::Fail(error)) = &fault {
            return Err(error.clone());
        }

        let duplicate = matches!(fault, Some(CreateFault::CreateDuplicateThenTimeout));
        if !duplicate && !Self::live_for(&state, tags.correlation_id).is_empty() {
            return Err(ComputeError::Conflict(tags.idempotency_token()));
        }
        let live = state
            .resources
            .values()
            .filter(|r| r.status != ResourceStatus::Terminated)
            .count();
        if live >= self.quota {
            return Err(ComputeError::QuotaExhausted(format!(
                "{} of {} compute units in use",
                live, self.quota
            )));
        }

        let status = match fault {
            Some(CreateFault::CreateWithoutStart) => ResourceStatus::Creating,
            _ => ResourceStatus::Running,
        };
        let handle = self.insert(&mut state, tags, status);
        if duplicate {
            self.insert(&mut state, tags, status);
        }

        match fault {
            Some(CreateFault::CreateThenTimeout) | Some(CreateFault::CreateDuplicateThenTimeout) => {
                Err(ComputeError::Ambiguous("create request timed out".to_string()))
            }
            Some(CreateFault::CreateWithoutStart) => {
                Err(ComputeError::Ambiguous("container created but failed to start".to_string()))
            }
            _ => Ok(handle),
        }
    }

    async fn start_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        match state.resources.get_mut(handle) {
            Some(resource) if resource.status == ResourceStatus::Creating => {
                resource.status = ResourceStatus::Running;
                resource.created_at = Instant::now();
                Ok(())
            }
            Some(resource) if resource.status == ResourceStatus::Running => Ok(()),
            Some(resource) => Err(ComputeError::Rejected(format!(
                "{} cannot be started while {:?}",
                handle, resource.status
            ))),
            None => Err(ComputeError::NotFound(handle.to_string())),
        }
    }

    async fn describe_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<ResourceStatus, ComputeError> {
        self.state
            .lock()
            .resources
            .get(handle)
            .map(|r| r.status)
            .ok_or_else(|| ComputeError::NotFound(handle.to_string()))
    }

    async fn terminate_resource(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<(), ComputeError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        *state.terminate_calls.entry(handle.clone()).or_insert(0) += 1;

        if state.terminate_outage {
            return Err(ComputeError::Transient("provider unavailable".to_string()));
        }
        if let Some(error) = state.terminate_faults.pop_front() {
            return Err(error);
        }

        match state.resources.get_mut(handle) {
            Some(resource) if resource.status != ResourceStatus::Terminated => {
                resource.status = ResourceStatus::Terminated;
                Ok(())
            }
            _ => Err(ComputeError::NotFound(handle.to_string())),
        }
    }

    async fn wait_terminated(
        &self,
        _credential: &ScopedCredential,
        handle: &ResourceHandle,
        _timeout: Duration,
    ) -> Result<(), ComputeError> {
        match self.state.lock().resources.get(handle) {
            Some(resource) if resource.status != ResourceStatus::Terminated => {
                Err(ComputeError::Transient(format!("{} is still {:?}", handle, resource.status)))
            }
            _ => Ok(()),
        }
    }

    async fn find_by_correlation(
        &self,
        _credential: &ScopedCredential,
        correlation_id: InstanceId,
    ) -> Result<Vec<ResourceHandle>, ComputeError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::live_for(&self.state.lock(), correlation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credentials::IssuedCredentials;
    use crate::domain::lifecycle::{SizeClass, TargetAccountRef};
    use chrono::Utc;

    fn credential() -> ScopedCredential {
        ScopedCredential::new(
            TargetAccountRef::new("role/ci"),
            "test",
            IssuedCredentials {
                access_key: "AKIA".into(),
                secret: "s".into(),
                session_token: "t".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        )
    }

    async fn create(compute: &SimulatedComputeProvider, id: InstanceId) -> Result<ResourceHandle, ComputeError> {
        let tags = ResourceTags::for_instance(id);
        let boot = BootConfig {
            agent_label: tags.agent_label.clone(),
            registration_token: None,
        };
        compute
            .create_resource(&credential(), &ResourceSpec::new("img", SizeClass::Small), &tags, &boot)
            .await
    }

    #[tokio::test]
    async fn test_quota_counts_live_resources_only() {
        let compute = SimulatedComputeProvider::new(1);
        let first = create(&compute, InstanceId::new()).await.unwrap();
        assert!(matches!(
            create(&compute, InstanceId::new()).await,
            Err(ComputeError::QuotaExhausted(_))
        ));

        compute.terminate_resource(&credential(), &first).await.unwrap();
        assert!(create(&compute, InstanceId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_correlation_id_acts_as_idempotency_token() {
        let compute = SimulatedComputeProvider::new(5);
        let id = InstanceId::new();
        create(&compute, id).await.unwrap();

        assert!(matches!(create(&compute, id).await, Err(ComputeError::Conflict(_))));
        assert_eq!(compute.live_resources_for(id).len(), 1);
    }

    #[tokio::test]
    async fn test_unstarted_resource_runs_once_started() {
        let compute = SimulatedComputeProvider::new(5);
        let id = InstanceId::new();
        compute.inject_create_fault(CreateFault::CreateWithoutStart);
        assert!(matches!(create(&compute, id).await, Err(ComputeError::Ambiguous(_))));

        let handle = compute.live_resources_for(id).remove(0);
        assert_eq!(
            compute.describe_resource(&credential(), &handle).await.unwrap(),
            ResourceStatus::Creating
        );
        assert!(compute.booted_at(&id.agent_label()).is_none());

        compute.start_resource(&credential(), &handle).await.unwrap();
        compute.start_resource(&credential(), &handle).await.unwrap();
        assert!(compute.booted_at(&id.agent_label()).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_fault_bypasses_idempotency() {
        let compute = SimulatedComputeProvider::new(5);
        let id = InstanceId::new();
        compute.inject_create_fault(CreateFault::CreateDuplicateThenTimeout);

        assert!(matches!(create(&compute, id).await, Err(ComputeError::Ambiguous(_))));
        assert_eq!(compute.live_resources_for(id).len(), 2);
    }

    #[tokio::test]
    async fn test_terminated_resources_report_not_found() {
        let compute = SimulatedComputeProvider::new(5);
        let handle = create(&compute, InstanceId::new()).await.unwrap();

        compute.terminate_resource(&credential(), &handle).await.unwrap();
        assert!(matches!(
            compute.terminate_resource(&credential(), &handle).await,
            Err(ComputeError::NotFound(_))
        ));
        assert_eq!(compute.terminate_calls_for(&handle), 2);
        assert_eq!(
            compute.describe_resource(&credential(), &handle).await.unwrap(),
            ResourceStatus::Terminated
        );
    }
}
