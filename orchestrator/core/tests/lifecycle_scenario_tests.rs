// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end lifecycle scenarios against the simulated compute provider and
//! agent registry.
//!
//! All tests run on a paused tokio clock, so deadlines of minutes complete
//! instantly and timings are exact.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use ember_core::application::credential_broker::CredentialBroker;
use ember_core::application::lifecycle::{
    ControllerComponents, ControllerSettings, CreateInstanceRequest, LifecycleController,
};
use ember_core::application::provisioner::ResourceProvisioner;
use ember_core::application::readiness::ReadinessWatcher;
use ember_core::application::reaper::Reaper;
use ember_core::domain::compute::ComputeError;
use ember_core::domain::credentials::{IdentityError, IdentityProvider, IssuedCredentials};
use ember_core::domain::events::LifecycleEvent;
use ember_core::domain::ledger::Ledger;
use ember_core::domain::lifecycle::{
    InstanceCondition, InstanceId, JobOutcome, LifecycleState, ResourceSpec, SizeClass, TargetAccountRef,
    TerminationReason,
};
use ember_core::domain::retry::RetryPolicy;
use ember_core::infrastructure::agent_registry::SimulatedAgentRegistry;
use ember_core::infrastructure::compute::{CreateFault, SimulatedComputeProvider};
use ember_core::infrastructure::event_bus::{EventBus, EventReceiver};
use ember_core::infrastructure::identity::StaticIdentityProvider;
use ember_core::infrastructure::repositories::InMemoryLedger;

const NEVER: Duration = Duration::from_secs(24 * 3600);

struct Harness {
    controller: LifecycleController,
    compute: Arc<SimulatedComputeProvider>,
    ledger: Arc<InMemoryLedger>,
}

fn harness(quota: usize, boot_delay: Duration) -> Harness {
    harness_with_identity(quota, boot_delay, Arc::new(StaticIdentityProvider::new(Duration::from_secs(3600))))
}

fn harness_with_identity(quota: usize, boot_delay: Duration, identity: Arc<dyn IdentityProvider>) -> Harness {
    let compute = Arc::new(SimulatedComputeProvider::new(quota));
    let registry = Arc::new(SimulatedAgentRegistry::new(compute.clone(), boot_delay));
    let ledger = Arc::new(InMemoryLedger::new());
    let retry = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5));

    let controller = LifecycleController::new(
        ControllerComponents {
            ledger: ledger.clone(),
            broker: Arc::new(CredentialBroker::new(identity, retry.clone(), Duration::from_secs(300))),
            provisioner: Arc::new(ResourceProvisioner::new(compute.clone(), retry.clone(), None)),
            watcher: Arc::new(ReadinessWatcher::new(
                registry.clone(),
                Duration::from_secs(5),
                Duration::ZERO,
            )),
            handoff: registry,
            reaper: Arc::new(Reaper::new(compute.clone(), retry, Duration::from_secs(60))),
            event_bus: EventBus::with_default_capacity(),
        },
        ControllerSettings::default(),
    );

    Harness {
        controller,
        compute,
        ledger,
    }
}

fn request(ready_deadline: Duration) -> CreateInstanceRequest {
    CreateInstanceRequest::new(
        ResourceSpec::new("ghcr.io/acme/ci-runner:2.3", SizeClass::Medium),
        TargetAccountRef::new("arn:aws:iam::123456789012:role/ephemeral-ci").with_external_id("acme-ci"),
    )
    .with_ready_deadline(ready_deadline)
}

/// Wait for `id` to enter `state`; returns the moment it was announced.
async fn wait_for_state(events: &mut EventReceiver, id: InstanceId, state: LifecycleState) -> Instant {
    loop {
        match events.recv().await.unwrap() {
            LifecycleEvent::StateChanged { instance_id, to, .. } if instance_id == id && to == state => {
                return Instant::now();
            }
            _ => {}
        }
    }
}

/// Poll until the instance is IN_USE or terminal.
async fn settle(controller: &LifecycleController, id: InstanceId) -> LifecycleState {
    loop {
        let state = controller.get_status(id).await.unwrap().state;
        if state == LifecycleState::InUse || state.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_ready_at_45s_completed_at_300s() {
    let h = harness(10, Duration::from_secs(45));
    let mut events = h.controller.event_bus().subscribe();
    let started = Instant::now();

    let id = h.controller.create_instance(request(Duration::from_secs(120))).await.unwrap();

    let ready_at = wait_for_state(&mut events, id, LifecycleState::Ready).await;
    assert!(ready_at - started >= Duration::from_secs(45));
    assert!(ready_at - started < Duration::from_secs(50));
    wait_for_state(&mut events, id, LifecycleState::InUse).await;

    tokio::time::sleep_until(started + Duration::from_secs(300)).await;
    h.controller.signal_completion(id, JobOutcome::succeeded()).await.unwrap();

    let status = h.controller.await_terminal(id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Terminated);
    assert_eq!(status.condition, InstanceCondition::Terminated);
    assert_eq!(status.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(status.job_outcome, Some(JobOutcome::succeeded()));

    // One contiguous forward path in the ledger.
    let record = h.ledger.get(id).await.unwrap().unwrap();
    let path: Vec<_> = record.history().iter().map(|t| t.to).collect();
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
    assert_eq!(record.history()[0].from, LifecycleState::Pending);
    for pair in record.history().windows(2) {
        assert_eq!(pair[0].to, pair[1].from);
    }

    let handle = status.resource_handle.unwrap();
    assert_eq!(h.compute.terminate_calls_for(&handle), 1);
    assert_eq!(h.compute.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_tears_down_exactly_once() {
    let h = harness(10, NEVER);
    let started = Instant::now();

    let id = h.controller.create_instance(request(Duration::from_secs(30))).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.condition, InstanceCondition::Failed);
    assert_eq!(status.termination_reason, Some(TerminationReason::Timeout));
    assert!(Instant::now() - started >= Duration::from_secs(30));

    let handle = status.resource_handle.unwrap();
    assert_eq!(h.compute.terminate_calls_for(&handle), 1);
    assert_eq!(h.compute.terminate_calls(), 1);
    assert_eq!(h.compute.live_count(), 0);

    let record = h.ledger.get(id).await.unwrap().unwrap();
    assert!(!record.history().iter().any(|t| t.to == LifecycleState::Ready));
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhausted_fails_and_still_reaps() {
    let h = harness(0, Duration::from_secs(10));
    let mut events = h.controller.event_bus().subscribe();

    let id = h.controller.create_instance(request(Duration::from_secs(60))).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.termination_reason, Some(TerminationReason::ProvisionError));
    assert!(status.failure.unwrap().starts_with("quota_exhausted"));
    assert!(status.resource_handle.is_none());

    // The reaper ran (sweeping by correlation id) and confirmed nothing was left.
    let mut confirmed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            LifecycleEvent::TeardownConfirmed { instance_id, resource_handle, .. } if instance_id == id => {
                assert!(resource_handle.is_none());
                confirmed = true;
            }
            LifecycleEvent::TeardownEscalated { .. } => panic!("unexpected escalation"),
            _ => {}
        }
    }
    assert!(confirmed);
    assert!(h.compute.find_calls() >= 1);
    assert!(h.ledger.list_escalations().await.unwrap().is_empty());
}

struct DenyingIdentity;

#[async_trait]
impl IdentityProvider for DenyingIdentity {
    async fn assume_role(
        &self,
        _role_ref: &str,
        _session_label: &str,
        _external_id: Option<&str>,
    ) -> Result<IssuedCredentials, IdentityError> {
        Err(IdentityError::Denied("principal not trusted".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_denied_credentials_never_provision_or_reap() {
    let h = harness_with_identity(10, Duration::from_secs(10), Arc::new(DenyingIdentity));

    let id = h.controller.create_instance(request(Duration::from_secs(60))).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.termination_reason, Some(TerminationReason::ProvisionError));
    assert!(status.failure.unwrap().contains("AuthDenied"));

    let record = h.ledger.get(id).await.unwrap().unwrap();
    assert!(!record.history().iter().any(|t| t.to == LifecycleState::Provisioning));
    assert_eq!(h.compute.create_calls(), 0);
    assert_eq!(h.compute.find_calls(), 0);
    assert_eq!(h.compute.terminate_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_awaiting_ready_routes_through_teardown() {
    let h = harness(10, NEVER);
    let mut events = h.controller.event_bus().subscribe();

    let id = h.controller.create_instance(request(Duration::from_secs(600))).await.unwrap();
    wait_for_state(&mut events, id, LifecycleState::AwaitingReady).await;

    h.controller.cancel(id).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Terminated);
    assert_eq!(status.termination_reason, Some(TerminationReason::CallerCancelled));
    let record = h.ledger.get(id).await.unwrap().unwrap();
    assert!(record.history().iter().any(|t| t.to == LifecycleState::TearingDown));
    assert_eq!(h.compute.terminate_calls_for(&status.resource_handle.unwrap()), 1);
    assert_eq!(h.compute.live_count(), 0);

    // Cancelling again is refused; the record is closed.
    assert!(h.controller.cancel(id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_completion_signals_are_harmless() {
    let h = harness(10, Duration::from_secs(5));
    let mut events = h.controller.event_bus().subscribe();

    let id = h.controller.create_instance(request(Duration::from_secs(60))).await.unwrap();
    wait_for_state(&mut events, id, LifecycleState::InUse).await;

    h.controller
        .signal_completion(id, JobOutcome::failed("exit code 2"))
        .await
        .unwrap();
    // Second signal may land before the run leaves IN_USE.
    let _ = h.controller.signal_completion(id, JobOutcome::succeeded()).await;

    let status = h.controller.await_terminal(id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Terminated);
    assert_eq!(status.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(status.job_outcome, Some(JobOutcome::failed("exit code 2")));
    assert_eq!(h.compute.terminate_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_teardown_escalates_to_orphan_risk() {
    let h = harness(10, NEVER);
    h.compute.set_terminate_outage(true);

    let id = h.controller.create_instance(request(Duration::from_secs(30))).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.condition, InstanceCondition::OrphanRisk);
    assert_eq!(status.termination_reason, Some(TerminationReason::Timeout));
    assert!(status.failure.is_some());

    let escalations = h.controller.list_escalations().await.unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].instance_id, id);
    assert_eq!(escalations[0].resource_handle, status.resource_handle);
    assert_eq!(escalations[0].attempts, 3);
    // The resource really is still there.
    assert_eq!(h.compute.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_resources_for_one_instance_are_all_torn_down() {
    let h = harness(10, Duration::from_secs(10));
    h.compute.inject_create_fault(CreateFault::CreateDuplicateThenTimeout);
    // The provisioner's early attempt to remove the duplicate fails.
    h.compute.inject_terminate_fault(ComputeError::Transient("throttled".into()));

    let id = h.controller.create_instance(request(Duration::from_secs(120))).await.unwrap();
    assert_eq!(settle(&h.controller, id).await, LifecycleState::InUse);

    let bound = h.controller.get_status(id).await.unwrap().resource_handle.unwrap();
    let live = h.compute.live_resources_for(id);
    assert_eq!(live.len(), 2);
    let duplicate = live.into_iter().find(|handle| *handle != bound).unwrap();

    h.controller.signal_completion(id, JobOutcome::succeeded()).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Terminated);
    assert_eq!(status.condition, InstanceCondition::Terminated);
    assert_eq!(h.compute.terminate_calls_for(&bound), 1);
    assert_eq!(h.compute.terminate_calls_for(&duplicate), 2);
    assert_eq!(h.compute.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_created_but_unstarted_resource_is_started_and_used() {
    let h = harness(10, Duration::from_secs(30));
    h.compute.inject_create_fault(CreateFault::CreateWithoutStart);

    let id = h.controller.create_instance(request(Duration::from_secs(120))).await.unwrap();
    assert_eq!(settle(&h.controller, id).await, LifecycleState::InUse);
    assert_eq!(h.compute.create_calls(), 1);

    h.controller.signal_completion(id, JobOutcome::succeeded()).await.unwrap();
    let status = h.controller.await_terminal(id).await.unwrap();

    assert_eq!(status.state, LifecycleState::Terminated);
    assert_eq!(status.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(h.compute.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fifty_instances_against_quota_of_ten() {
    let h = harness(10, Duration::from_secs(20));

    let mut ids = Vec::new();
    for _ in 0..50 {
        ids.push(h.controller.create_instance(request(Duration::from_secs(120))).await.unwrap());
    }

    let mut in_use = Vec::new();
    let mut failed = Vec::new();
    for id in &ids {
        match settle(&h.controller, *id).await {
            LifecycleState::InUse => in_use.push(*id),
            LifecycleState::Failed => failed.push(*id),
            other => panic!("unexpected state {}", other),
        }
    }
    assert_eq!(in_use.len(), 10);
    assert_eq!(failed.len(), 40);
    assert_eq!(h.compute.live_count(), 10);

    for id in &failed {
        let status = h.controller.get_status(*id).await.unwrap();
        assert_eq!(status.termination_reason, Some(TerminationReason::ProvisionError));
        assert!(status.failure.unwrap().starts_with("quota_exhausted"));
    }

    for id in &in_use {
        h.controller.signal_completion(*id, JobOutcome::succeeded()).await.unwrap();
    }

    let mut handles = HashSet::new();
    let mut reached_ready = 0;
    for id in &ids {
        let status = h.controller.await_terminal(*id).await.unwrap();
        if let Some(handle) = status.resource_handle {
            assert!(handles.insert(handle), "resource handle bound twice");
        }
        let record = h.ledger.get(*id).await.unwrap().unwrap();
        if record.history().iter().any(|t| t.to == LifecycleState::Ready) {
            reached_ready += 1;
        }
    }

    assert_eq!(reached_ready, 10);
    assert_eq!(handles.len(), 10);
    assert_eq!(h.compute.live_count(), 0);
    assert_eq!(h.controller.in_flight(), 0);
    assert!(h.ledger.list_non_terminal().await.unwrap().is_empty());
}
