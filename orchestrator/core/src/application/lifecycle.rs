// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lifecycle Controller
//!
//! Drives each lifecycle instance through
//! `PENDING → PROVISIONING → AWAITING_READY → READY → IN_USE → TEARING_DOWN → TERMINATED|FAILED`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Per-instance state machine with write-ahead persistence
//! - **Collaborators:** CredentialBroker, ResourceProvisioner, ReadinessWatcher,
//!   WorkHandoff, Reaper, Ledger, EventBus
//!
//! Every instance runs on its own spawned task and suspends only on its own
//! I/O. Each transition is written to the ledger before the next external
//! call is made and before it is announced on the event bus. Every exit path
//! (completion, timeout, cancellation, provisioning failure) funnels into the
//! same teardown routine, so an instance that ever reached PROVISIONING always
//! gets a Reaper invocation. Teardown that cannot be confirmed becomes a
//! durable escalation record and an `orphan_risk` status.
//!
//! Instances left non-terminal by a previous process are picked up by
//! [`LifecycleController::recover`] and torn down.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::credential_broker::CredentialBroker;
use crate::application::provisioner::ResourceProvisioner;
use crate::application::readiness::{ReadinessOutcome, ReadinessWatcher};
use crate::application::reaper::{Reaper, TeardownError};
use crate::domain::agent_registry::{HandoffRequest, WorkHandoff};
use crate::domain::credentials::ScopedCredential;
use crate::domain::events::LifecycleEvent;
use crate::domain::ledger::{EscalationRecord, Ledger, LedgerError};
use crate::domain::lifecycle::{
    InstanceId, InstanceStatus, JobOutcome, LifecycleError, LifecycleInstance, LifecycleState,
    ResourceSpec, TargetAccountRef, TerminationReason,
};
use crate::infrastructure::event_bus::{EventBus, EventBusError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),
    #[error("Instance {id} is already terminal ({state})")]
    AlreadyTerminal { id: InstanceId, state: LifecycleState },
    #[error("Instance {id} is not in use ({state})")]
    NotInUse { id: InstanceId, state: LifecycleState },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Event stream closed")]
    EventsClosed,
}

/// Caller-facing `createInstance` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub resource_spec: ResourceSpec,
    pub target_account_ref: TargetAccountRef,
    /// Overrides the configured readiness deadline
    #[serde(default, with = "humantime_serde")]
    pub ready_deadline: Option<Duration>,
    /// Maximum time spent IN_USE
    #[serde(default, with = "humantime_serde")]
    pub job_deadline: Option<Duration>,
}

impl CreateInstanceRequest {
    pub fn new(resource_spec: ResourceSpec, target_account_ref: TargetAccountRef) -> Self {
        Self {
            resource_spec,
            target_account_ref,
            ready_deadline: None,
            job_deadline: None,
        }
    }

    pub fn with_ready_deadline(mut self, deadline: Duration) -> Self {
        self.ready_deadline = Some(deadline);
        self
    }

    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub ready_deadline: Duration,
    pub job_deadline: Option<Duration>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            ready_deadline: Duration::from_secs(600),
            job_deadline: None,
        }
    }
}

/// Collaborators wired into a controller.
pub struct ControllerComponents {
    pub ledger: Arc<dyn Ledger>,
    pub broker: Arc<CredentialBroker>,
    pub provisioner: Arc<ResourceProvisioner>,
    pub watcher: Arc<ReadinessWatcher>,
    pub handoff: Arc<dyn WorkHandoff>,
    pub reaper: Arc<Reaper>,
    pub event_bus: EventBus,
}

struct RunHandle {
    cancel: CancellationToken,
    /// Absent for instances that are only being torn down.
    completion: Option<mpsc::Sender<JobOutcome>>,
}

/// Why a run left the forward path early.
struct Abort {
    reason: TerminationReason,
    detail: Option<String>,
}

impl Abort {
    fn cancelled() -> Self {
        Self {
            reason: TerminationReason::CallerCancelled,
            detail: None,
        }
    }

    fn new(reason: TerminationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
        }
    }
}

struct ControllerInner {
    ledger: Arc<dyn Ledger>,
    broker: Arc<CredentialBroker>,
    provisioner: Arc<ResourceProvisioner>,
    watcher: Arc<ReadinessWatcher>,
    handoff: Arc<dyn WorkHandoff>,
    reaper: Arc<Reaper>,
    events: EventBus,
    settings: ControllerSettings,
    runs: DashMap<InstanceId, RunHandle>,
}

#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

impl LifecycleController {
    pub fn new(components: ControllerComponents, settings: ControllerSettings) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                ledger: components.ledger,
                broker: components.broker,
                provisioner: components.provisioner,
                watcher: components.watcher,
                handoff: components.handoff,
                reaper: components.reaper,
                events: components.event_bus,
                settings,
                runs: DashMap::new(),
            }),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    /// Number of instances with a live driver or teardown task.
    pub fn in_flight(&self) -> usize {
        self.inner.runs.len()
    }

    /// Record a new instance as PENDING and start driving it. Returns as soon
    /// as the PENDING record is durable.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<InstanceId, ControllerError> {
        request
            .resource_spec
            .validate()
            .map_err(|e| ControllerError::InvalidRequest(e.to_string()))?;
        if request.target_account_ref.role_ref.trim().is_empty() {
            return Err(ControllerError::InvalidRequest("target role reference cannot be empty".to_string()));
        }

        let ready_deadline = request.ready_deadline.unwrap_or(self.inner.settings.ready_deadline);
        if ready_deadline.is_zero() {
            return Err(ControllerError::InvalidRequest("ready deadline must be positive".to_string()));
        }
        let job_deadline = request.job_deadline.or(self.inner.settings.job_deadline);
        if job_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ControllerError::InvalidRequest("job deadline must be positive".to_string()));
        }

        let instance = LifecycleInstance::new(
            request.resource_spec,
            request.target_account_ref,
            ready_deadline,
            job_deadline,
        );
        let id = instance.id;

        // Registered before the record exists so recovery never mistakes it for a leftover.
        let (completion_tx, completion_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        self.inner.runs.insert(
            id,
            RunHandle {
                cancel: cancel.clone(),
                completion: Some(completion_tx),
            },
        );
        if let Err(e) = self.inner.ledger.put(&instance).await {
            self.inner.runs.remove(&id);
            return Err(e.into());
        }

        metrics::counter!("ember_instances_created_total").increment(1);
        metrics::gauge!("ember_active_instances").increment(1.0);
        self.inner.events.publish(LifecycleEvent::InstanceCreated {
            instance_id: id,
            created_at: instance.created_at,
        });

        info!(
            instance_id = %id,
            image = %instance.resource_spec().image,
            role = %instance.target_account_ref.role_ref,
            ?ready_deadline,
            "Lifecycle instance created"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(instance, cancel, completion_rx).await;
        });

        Ok(id)
    }

    pub async fn get_status(&self, id: InstanceId) -> Result<InstanceStatus, ControllerError> {
        Ok(self.load(id).await?.status())
    }

    /// Request teardown. Cancellation never short-circuits teardown: the
    /// instance always passes through TEARING_DOWN.
    pub async fn cancel(&self, id: InstanceId) -> Result<(), ControllerError> {
        let instance = self.load(id).await?;
        if instance.is_terminal() {
            return Err(ControllerError::AlreadyTerminal {
                id,
                state: instance.state(),
            });
        }
        if instance.state() == LifecycleState::TearingDown {
            debug!(instance_id = %id, "Cancel ignored, teardown already in progress");
            return Ok(());
        }

        let token = self.inner.runs.get(&id).map(|run| run.cancel.clone());
        match token {
            Some(token) => {
                info!(instance_id = %id, state = %instance.state(), "Cancellation requested");
                token.cancel();
                Ok(())
            }
            None => {
                // No driver in this process (left over from an earlier run).
                warn!(instance_id = %id, state = %instance.state(), "Cancelling instance without an active driver");
                self.resume_teardown(instance, TerminationReason::CallerCancelled).await
            }
        }
    }

    /// Deliver the completion signal from the work-receiving system.
    pub async fn signal_completion(&self, id: InstanceId, outcome: JobOutcome) -> Result<(), ControllerError> {
        let instance = self.load(id).await?;
        if instance.is_terminal() {
            return Err(ControllerError::AlreadyTerminal {
                id,
                state: instance.state(),
            });
        }
        if instance.state() != LifecycleState::InUse {
            return Err(ControllerError::NotInUse {
                id,
                state: instance.state(),
            });
        }

        let sender = self.inner.runs.get(&id).and_then(|run| run.completion.clone());
        let Some(sender) = sender else {
            return Err(ControllerError::NotInUse {
                id,
                state: instance.state(),
            });
        };

        match sender.try_send(outcome) {
            Ok(()) => {
                info!(instance_id = %id, "Completion signal received");
                Ok(())
            }
            // A completion is already queued, or the run has just ended.
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                debug!(instance_id = %id, "Duplicate completion signal ignored");
                Ok(())
            }
        }
    }

    /// Wait until the instance reaches TERMINATED or FAILED.
    pub async fn await_terminal(&self, id: InstanceId) -> Result<InstanceStatus, ControllerError> {
        // Subscribe before reading the ledger so the final event cannot slip
        // between the two.
        let mut events = self.inner.events.subscribe_instance(id);
        loop {
            let instance = self.load(id).await?;
            if instance.is_terminal() {
                return Ok(instance.status());
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.is_final() => break,
                    Ok(_) => {}
                    Err(EventBusError::Lagged(_)) => break,
                    Err(_) => return Err(ControllerError::EventsClosed),
                }
            }
        }
    }

    pub async fn list_escalations(&self) -> Result<Vec<EscalationRecord>, ControllerError> {
        Ok(self.inner.ledger.list_escalations().await?)
    }

    /// Tear down every instance the ledger still holds as non-terminal and
    /// that has no driver in this process. Each returned instance is durably
    /// TEARING_DOWN by the time this returns; reaping continues in the
    /// background.
    pub async fn recover(&self) -> Result<Vec<InstanceId>, ControllerError> {
        let open = self.inner.ledger.list_non_terminal().await?;
        let mut resumed = Vec::new();

        for instance in open {
            if self.inner.runs.contains_key(&instance.id) {
                continue;
            }
            let id = instance.id;
            warn!(
                instance_id = %id,
                state = %instance.state(),
                handle = ?instance.resource_handle(),
                "Recovering instance left open by a previous run"
            );
            self.resume_teardown(instance, TerminationReason::OrchestratorRecovery).await?;
            resumed.push(id);
        }

        if !resumed.is_empty() {
            info!(count = resumed.len(), "Recovery teardown started");
        }
        Ok(resumed)
    }

    async fn load(&self, id: InstanceId) -> Result<LifecycleInstance, ControllerError> {
        self.inner
            .ledger
            .get(id)
            .await?
            .ok_or(ControllerError::NotFound(id))
    }

    async fn resume_teardown(&self, mut instance: LifecycleInstance, reason: TerminationReason) -> Result<(), ControllerError> {
        let id = instance.id;
        match self.inner.runs.entry(id) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    cancel: CancellationToken::new(),
                    completion: None,
                });
            }
        }

        if let Err(e) = self.inner.enter_teardown(&mut instance, reason).await {
            self.inner.runs.remove(&id);
            return Err(e);
        }

        metrics::gauge!("ember_active_instances").increment(1.0);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.complete_teardown(instance, None).await;
            inner.runs.remove(&id);
            metrics::gauge!("ember_active_instances").decrement(1.0);
        });
        Ok(())
    }
}

impl ControllerInner {
    async fn drive(
        self: Arc<Self>,
        mut instance: LifecycleInstance,
        cancel: CancellationToken,
        mut completion: mpsc::Receiver<JobOutcome>,
    ) {
        let id = instance.id;
        let mut credential = None;

        let reason = match self.run(&mut instance, &cancel, &mut completion, &mut credential).await {
            Ok(reason) => reason,
            Err(abort) => {
                if let Some(detail) = abort.detail {
                    warn!(instance_id = %id, state = %instance.state(), reason = %abort.reason, "{}", detail);
                    instance.record_failure(detail);
                }
                abort.reason
            }
        };

        if let Err(e) = self.enter_teardown(&mut instance, reason).await {
            // The in-memory record still owes teardown; carry on.
            error!(instance_id = %id, "Failed to record TEARING_DOWN: {}", e);
        }
        self.complete_teardown(instance, credential).await;

        self.runs.remove(&id);
        metrics::gauge!("ember_active_instances").decrement(1.0);
    }

    /// The forward path. Returns the termination reason once the job is done.
    async fn run(
        &self,
        instance: &mut LifecycleInstance,
        cancel: &CancellationToken,
        completion: &mut mpsc::Receiver<JobOutcome>,
        credential_slot: &mut Option<ScopedCredential>,
    ) -> Result<TerminationReason, Abort> {
        let id = instance.id;
        let agent_label = id.agent_label();

        if cancel.is_cancelled() {
            return Err(Abort::cancelled());
        }
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Abort::cancelled()),
            result = self.broker.acquire(&instance.target_account_ref, &agent_label) => result,
        };
        let credential = acquired.map_err(|e| Abort::new(TerminationReason::ProvisionError, e.to_string()))?;
        *credential_slot = Some(credential.clone());

        self.transition(instance, LifecycleState::Provisioning).await?;

        // Not cancellable: an abandoned create could leave an untracked resource.
        let handle = self
            .provisioner
            .provision(&credential, instance.resource_spec(), id)
            .await
            .map_err(|e| Abort::new(TerminationReason::ProvisionError, e.to_string()))?;

        instance
            .bind_resource(handle.clone())
            .map_err(|e| Abort::new(TerminationReason::ProvisionError, e.to_string()))?;
        self.transition(instance, LifecycleState::AwaitingReady).await?;
        self.events.publish(LifecycleEvent::ResourceBound {
            instance_id: id,
            resource_handle: handle.clone(),
            bound_at: Utc::now(),
        });

        if cancel.is_cancelled() {
            return Err(Abort::cancelled());
        }
        let deadline = Instant::now() + instance.ready_deadline;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Abort::cancelled()),
            outcome = self.watcher.await_ready(&handle, &agent_label, deadline) => outcome,
        };
        match outcome {
            ReadinessOutcome::Ready(signal) => {
                debug!(instance_id = %id, polls = signal.polls, "Readiness observed");
            }
            ReadinessOutcome::TimedOut { polls } => {
                return Err(Abort::new(
                    TerminationReason::Timeout,
                    format!(
                        "agent {} did not register within {:?} ({} polls)",
                        agent_label, instance.ready_deadline, polls
                    ),
                ));
            }
        }

        self.transition(instance, LifecycleState::Ready).await?;
        if let Some(ready_at) = instance.ready_at {
            let latency = (ready_at - instance.created_at).to_std().unwrap_or_default();
            metrics::histogram!("ember_ready_latency_seconds").record(latency.as_secs_f64());
        }

        let request = HandoffRequest {
            instance_id: id,
            agent_label: agent_label.clone(),
            resource_handle: handle.clone(),
        };
        let handed_off = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Abort::cancelled()),
            result = self.handoff.hand_off(&request) => result,
        };
        let ack = handed_off.map_err(|e| Abort::new(TerminationReason::ProvisionError, e.to_string()))?;
        info!(instance_id = %id, handle = %handle, assignment_id = ?ack.assignment_id, "Work handed off");

        self.transition(instance, LifecycleState::InUse).await?;

        let job_deadline = instance.job_deadline;
        let job_timer = async move {
            match job_deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Abort::cancelled()),
            signal = completion.recv() => match signal {
                Some(outcome) => {
                    info!(instance_id = %id, success = outcome.success, "Job finished");
                    instance.record_job_outcome(outcome);
                    Ok(TerminationReason::Completed)
                }
                None => Err(Abort::new(TerminationReason::ProvisionError, "completion channel closed")),
            },
            _ = job_timer => Err(Abort::new(
                TerminationReason::Timeout,
                format!("job exceeded its deadline of {:?}", job_deadline.unwrap_or_default()),
            )),
        }
    }

    /// Apply a forward transition, persist it, then announce it.
    async fn transition(&self, instance: &mut LifecycleInstance, next: LifecycleState) -> Result<(), Abort> {
        let from = instance.state();
        instance
            .transition_to(next)
            .map_err(|e| Abort::new(TerminationReason::ProvisionError, e.to_string()))?;
        self.ledger.put(instance).await.map_err(|e| {
            Abort::new(
                TerminationReason::ProvisionError,
                format!("ledger write for {} failed: {}", next, e),
            )
        })?;

        info!(instance_id = %instance.id, from = %from, to = %next, "State transition");
        self.events.publish(LifecycleEvent::StateChanged {
            instance_id: instance.id,
            from,
            to: next,
            changed_at: Utc::now(),
        });
        Ok(())
    }

    async fn enter_teardown(&self, instance: &mut LifecycleInstance, reason: TerminationReason) -> Result<(), ControllerError> {
        let from = instance.state();
        instance.begin_teardown(reason)?;
        if from == LifecycleState::TearingDown {
            return Ok(());
        }
        self.ledger.put(instance).await?;

        info!(instance_id = %instance.id, from = %from, reason = %reason, "Tearing down");
        self.events.publish(LifecycleEvent::StateChanged {
            instance_id: instance.id,
            from,
            to: LifecycleState::TearingDown,
            changed_at: Utc::now(),
        });
        Ok(())
    }

    /// Reap (if anything was ever provisioned), escalate on failure, and
    /// close the ledger record.
    async fn complete_teardown(&self, mut instance: LifecycleInstance, credential: Option<ScopedCredential>) {
        let id = instance.id;

        if instance.requires_teardown() {
            match self.reap(&instance, credential).await {
                Ok(()) => {
                    self.events.publish(LifecycleEvent::TeardownConfirmed {
                        instance_id: id,
                        resource_handle: instance.resource_handle().cloned(),
                        confirmed_at: Utc::now(),
                    });
                }
                Err(e) => self.escalate(&mut instance, e).await,
            }
        } else {
            debug!(instance_id = %id, "Nothing was provisioned, skipping reaper");
        }

        let reason = instance
            .termination_reason()
            .unwrap_or(TerminationReason::ProvisionError);
        if let Err(e) = self.ledger.put(&instance).await {
            error!(instance_id = %id, "Failed to persist teardown outcome: {}", e);
        }
        let closed = match self.ledger.mark_terminal(id, reason).await {
            Ok(closed) => closed,
            Err(e) => {
                // Left non-terminal on purpose: the next recovery repeats teardown.
                error!(instance_id = %id, "Failed to mark instance terminal: {}", e);
                return;
            }
        };

        metrics::counter!(
            "ember_instances_terminal_total",
            "state" => closed.state().as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);

        info!(
            instance_id = %id,
            state = %closed.state(),
            reason = %reason,
            orphan_risk = closed.orphan_risk(),
            "Lifecycle instance finished"
        );
        self.events.publish(LifecycleEvent::InstanceFinished {
            instance_id: id,
            state: closed.state(),
            condition: closed.condition(),
            reason,
            finished_at: closed.terminated_at.unwrap_or_else(Utc::now),
        });
    }

    async fn reap(&self, instance: &LifecycleInstance, credential: Option<ScopedCredential>) -> Result<(), TeardownError> {
        let credential = match credential {
            Some(credential) => self.broker.ensure_valid(credential).await,
            None => {
                self.broker
                    .acquire(&instance.target_account_ref, &instance.id.agent_label())
                    .await
            }
        }
        .map_err(|e| TeardownError::Unconfirmed {
            attempts: 0,
            last_error: format!("no credentials for teardown: {}", e),
        })?;

        if let Some(handle) = instance.resource_handle() {
            self.reaper.terminate(&credential, handle).await?;
        }
        // Catches partial creates when no handle was bound, and duplicates
        // carrying this correlation id when one was.
        let swept = self.reaper.sweep(&credential, instance.id).await?;
        if instance.resource_handle().is_some() && !swept.is_empty() {
            warn!(instance_id = %instance.id, count = swept.len(), "Swept resources beyond the bound handle");
        }
        Ok(())
    }

    async fn escalate(&self, instance: &mut LifecycleInstance, failure: TeardownError) {
        let id = instance.id;
        error!(
            instance_id = %id,
            handle = ?instance.resource_handle(),
            attempts = failure.attempts(),
            "Teardown unconfirmed, resource may be orphaned: {}",
            failure.last_error()
        );

        instance.flag_orphan_risk();
        instance.record_failure(failure.to_string());

        let record = EscalationRecord {
            instance_id: id,
            target_account_ref: instance.target_account_ref.clone(),
            resource_handle: instance.resource_handle().cloned(),
            attempts: failure.attempts(),
            last_error: failure.last_error().to_string(),
            escalated_at: Utc::now(),
        };
        if let Err(e) = self.ledger.record_escalation(&record).await {
            error!(instance_id = %id, "Failed to record escalation: {}", e);
        }

        metrics::counter!("ember_teardown_escalations_total").increment(1);
        self.events.publish(LifecycleEvent::TeardownEscalated {
            instance_id: id,
            resource_handle: record.resource_handle,
            attempts: record.attempts,
            last_error: record.last_error,
            escalated_at: record.escalated_at,
        });
    }
}
