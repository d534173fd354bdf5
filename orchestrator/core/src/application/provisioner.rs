// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Provisioner
//!
//! Requests exactly one compute unit per lifecycle instance. Every request is
//! tagged with the instance id and carries an idempotency token derived from
//! it. A create call is never blindly repeated: after an ambiguous failure the
//! provisioner first asks the provider for resources carrying the correlation
//! id, adopts one if it exists, and only re-issues the create once absence is
//! confirmed. An adopted resource that was created but never started is
//! started before its handle is returned. If the provider reports more than
//! one resource for the correlation id, the extras are terminated on a best
//! effort basis; the reaper's correlation sweep at teardown catches any that
//! survive.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Safe, non-duplicating resource creation

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::compute::{BootConfig, ComputeError, ComputeProvider, ResourceStatus, ResourceTags};
use crate::domain::credentials::ScopedCredential;
use crate::domain::lifecycle::{InstanceId, ResourceHandle, ResourceSpec};
use crate::domain::retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("quota_exhausted: {0}")]
    QuotaExhausted(String),
    #[error("invalid_image: {0}")]
    InvalidImage(String),
    #[error("invalid_profile: {0}")]
    InvalidProfile(String),
    #[error("rejected: {0}")]
    Rejected(String),
    /// Neither success nor absence could be established within the budget.
    #[error("unconfirmed after {attempts} attempts: {message}")]
    Unconfirmed { attempts: u32, message: String },
}

impl ProvisionError {
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::QuotaExhausted(_) => "quota_exhausted",
            ProvisionError::InvalidImage(_) => "invalid_image",
            ProvisionError::InvalidProfile(_) => "invalid_profile",
            ProvisionError::Rejected(_) => "rejected",
            ProvisionError::Unconfirmed { .. } => "unconfirmed",
        }
    }
}

pub struct ResourceProvisioner {
    compute: Arc<dyn ComputeProvider>,
    retry: RetryPolicy,
    registration_secret: Option<String>,
}

impl ResourceProvisioner {
    pub fn new(compute: Arc<dyn ComputeProvider>, retry: RetryPolicy, registration_secret: Option<String>) -> Self {
        Self {
            compute,
            retry,
            registration_secret,
        }
    }

    pub async fn provision(
        &self,
        credential: &ScopedCredential,
        spec: &ResourceSpec,
        correlation_id: InstanceId,
    ) -> Result<ResourceHandle, ProvisionError> {
        let tags = ResourceTags::for_instance(correlation_id);
        let boot = BootConfig {
            agent_label: tags.agent_label.clone(),
            registration_token: self.registration_secret.clone(),
        };

        let mut attempt = 0;
        let mut last_error = String::new();
        loop {
            attempt += 1;

            if attempt > 1 {
                tokio::time::sleep(self.retry.backoff(attempt - 1)).await;

                // An earlier create may have landed; never issue a second one blindly.
                match self.reconcile(credential, correlation_id).await {
                    Ok(Some(handle)) => return Ok(handle),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(instance_id = %correlation_id, attempt, "Could not confirm absence: {}", e);
                        last_error = e.to_string();
                        if !self.retry.should_retry(attempt) {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.compute.create_resource(credential, spec, &tags, &boot).await {
                Ok(handle) => {
                    info!(instance_id = %correlation_id, handle = %handle, "Resource created");
                    return Ok(handle);
                }
                Err(ComputeError::QuotaExhausted(m)) => return Err(ProvisionError::QuotaExhausted(m)),
                Err(ComputeError::InvalidImage(m)) => return Err(ProvisionError::InvalidImage(m)),
                Err(ComputeError::InvalidProfile(m)) => return Err(ProvisionError::InvalidProfile(m)),
                Err(ComputeError::Rejected(m)) | Err(ComputeError::NotFound(m)) => {
                    return Err(ProvisionError::Rejected(m))
                }
                Err(ComputeError::Conflict(m)) => {
                    // The idempotency token is taken: the resource already exists.
                    match self.reconcile(credential, correlation_id).await {
                        Ok(Some(handle)) => return Ok(handle),
                        Ok(None) => last_error = m,
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Err(e @ ComputeError::Ambiguous(_)) | Err(e @ ComputeError::Transient(_)) => {
                    warn!(instance_id = %correlation_id, attempt, "Create outcome unknown: {}", e);
                    last_error = e.to_string();
                }
            }

            if !self.retry.should_retry(attempt) {
                break;
            }
        }

        Err(ProvisionError::Unconfirmed {
            attempts: attempt,
            message: last_error,
        })
    }

    /// Look for resources an earlier create left behind and make one of them
    /// usable. `Ok(None)` means nothing usable exists and a create may be
    /// issued.
    async fn reconcile(
        &self,
        credential: &ScopedCredential,
        correlation_id: InstanceId,
    ) -> Result<Option<ResourceHandle>, ComputeError> {
        let mut existing = self.compute.find_by_correlation(credential, correlation_id).await?;
        if existing.is_empty() {
            return Ok(None);
        }
        existing.sort_by(|a, b| a.0.cmp(&b.0));
        let handle = existing.remove(0);

        for extra in &existing {
            warn!(instance_id = %correlation_id, handle = %extra, "Terminating duplicate resource");
            if let Err(e) = self.compute.terminate_resource(credential, extra).await {
                warn!(instance_id = %correlation_id, handle = %extra, "Duplicate left to the teardown sweep: {}", e);
            }
        }

        match self.compute.describe_resource(credential, &handle).await {
            Ok(ResourceStatus::Running) => {}
            Ok(ResourceStatus::Creating) => {
                info!(instance_id = %correlation_id, handle = %handle, "Starting resource that never started");
                self.compute.start_resource(credential, &handle).await?;
            }
            Ok(status) => {
                // Stopped or on its way out: it cannot host the agent.
                warn!(instance_id = %correlation_id, handle = %handle, ?status, "Discarding unusable resource");
                match self.compute.terminate_resource(credential, &handle).await {
                    Ok(()) | Err(ComputeError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            Err(ComputeError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        info!(instance_id = %correlation_id, handle = %handle, "Adopting existing resource");
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credentials::IssuedCredentials;
    use crate::domain::lifecycle::{SizeClass, TargetAccountRef};
    use crate::infrastructure::compute::simulated::{CreateFault, SimulatedComputeProvider};
    use chrono::Utc;
    use std::time::Duration;

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

    fn provisioner(compute: Arc<SimulatedComputeProvider>) -> ResourceProvisioner {
        ResourceProvisioner::new(
            compute,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
            Some("registration".into()),
        )
    }

    fn spec() -> ResourceSpec {
        ResourceSpec::new("ghcr.io/acme/runner:1.4", SizeClass::Small)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_create_adopts_landed_resource() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        compute.inject_create_fault(CreateFault::CreateThenTimeout);
        let id = InstanceId::new();

        let handle = provisioner(compute.clone()).provision(&credential(), &spec(), id).await.unwrap();

        assert_eq!(compute.create_calls(), 1);
        assert_eq!(compute.live_resources_for(id), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_create_retries_after_confirming_absence() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        compute.inject_create_fault(CreateFault::Fail(ComputeError::Ambiguous("timeout".into())));
        let id = InstanceId::new();

        let handle = provisioner(compute.clone()).provision(&credential(), &spec(), id).await.unwrap();

        assert_eq!(compute.create_calls(), 2);
        assert!(compute.find_calls() >= 1);
        assert_eq!(compute.live_resources_for(id), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_terminated_when_adopting() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        compute.inject_create_fault(CreateFault::CreateDuplicateThenTimeout);
        let id = InstanceId::new();

        let handle = provisioner(compute.clone()).provision(&credential(), &spec(), id).await.unwrap();

        assert_eq!(compute.create_calls(), 1);
        assert_eq!(compute.terminate_calls(), 1);
        assert_eq!(compute.terminate_calls_for(&handle), 0);
        assert_eq!(compute.live_resources_for(id), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopted_resource_that_never_started_is_started() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        compute.inject_create_fault(CreateFault::CreateWithoutStart);
        let id = InstanceId::new();

        let handle = provisioner(compute.clone()).provision(&credential(), &spec(), id).await.unwrap();

        assert_eq!(compute.create_calls(), 1);
        assert_eq!(
            compute.describe_resource(&credential(), &handle).await.unwrap(),
            ResourceStatus::Running
        );
        assert_eq!(compute.live_resources_for(id), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_image_is_not_retried() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        compute.inject_create_fault(CreateFault::Fail(ComputeError::InvalidImage("ghcr.io/acme/nope".into())));

        let err = provisioner(compute.clone())
            .provision(&credential(), &spec(), InstanceId::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "invalid_image");
        assert_eq!(compute.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_is_not_retried() {
        let compute = Arc::new(SimulatedComputeProvider::new(0));
        let err = provisioner(compute.clone())
            .provision(&credential(), &spec(), InstanceId::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "quota_exhausted");
        assert_eq!(compute.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_ambiguity_is_bounded() {
        let compute = Arc::new(SimulatedComputeProvider::new(10));
        for _ in 0..5 {
            compute.inject_create_fault(CreateFault::Fail(ComputeError::Transient("503".into())));
        }
        let err = provisioner(compute.clone())
            .provision(&credential(), &spec(), InstanceId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Unconfirmed { attempts: 3, .. }));
        assert_eq!(compute.create_calls(), 3);
        assert_eq!(compute.live_count(), 0);
    }
}
