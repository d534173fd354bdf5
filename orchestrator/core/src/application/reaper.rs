// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reaper
//!
//! Terminates a compute unit and blocks until the provider confirms it is
//! gone. A resource that is already gone counts as confirmed, so teardown can
//! be repeated safely (crash recovery relies on this). Transient provider
//! failures are retried with bounded backoff; when the budget runs out the
//! caller receives `TeardownError::Unconfirmed` and must escalate.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::compute::{ComputeError, ComputeProvider};
use crate::domain::credentials::ScopedCredential;
use crate::domain::lifecycle::{InstanceId, ResourceHandle};
use crate::domain::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub attempts: u32,
    /// The provider no longer knew the resource when termination was requested.
    pub already_gone: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TeardownError {
    #[error("teardown unconfirmed after {attempts} attempts: {last_error}")]
    Unconfirmed { attempts: u32, last_error: String },
}

impl TeardownError {
    pub fn attempts(&self) -> u32 {
        match self {
            TeardownError::Unconfirmed { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &str {
        match self {
            TeardownError::Unconfirmed { last_error, .. } => last_error,
        }
    }
}

pub struct Reaper {
    compute: Arc<dyn ComputeProvider>,
    retry: RetryPolicy,
    wait_timeout: Duration,
}

impl Reaper {
    pub fn new(compute: Arc<dyn ComputeProvider>, retry: RetryPolicy, wait_timeout: Duration) -> Self {
        Self {
            compute,
            retry,
            wait_timeout,
        }
    }

    pub async fn terminate(
        &self,
        credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<Confirmed, TeardownError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.compute.terminate_resource(credential, handle).await {
                Ok(()) => self
                    .compute
                    .wait_terminated(credential, handle, self.wait_timeout)
                    .await
                    .map(|_| false),
                Err(e) => Err(e),
            };

            match result {
                Ok(already_gone) => {
                    info!(handle = %handle, attempts = attempt, "Teardown confirmed");
                    return Ok(Confirmed {
                        attempts: attempt,
                        already_gone,
                    });
                }
                Err(ComputeError::NotFound(_)) => {
                    info!(handle = %handle, attempts = attempt, "Resource already gone");
                    return Ok(Confirmed {
                        attempts: attempt,
                        already_gone: true,
                    });
                }
                Err(e) => self.back_off_or_give_up(attempt, &e, handle.as_str()).await?,
            }
        }
    }

    /// Terminate every live resource tagged with `correlation_id`.
    ///
    /// Used when provisioning was attempted but no handle was ever bound: a
    /// partially created resource may still exist.
    pub async fn sweep(
        &self,
        credential: &ScopedCredential,
        correlation_id: InstanceId,
    ) -> Result<Vec<ResourceHandle>, TeardownError> {
        let mut attempt = 0;
        let handles = loop {
            attempt += 1;
            match self.compute.find_by_correlation(credential, correlation_id).await {
                Ok(handles) => break handles,
                Err(e) => {
                    self.back_off_or_give_up(attempt, &e, &correlation_id.to_string())
                        .await?
                }
            }
        };

        if handles.is_empty() {
            info!(instance_id = %correlation_id, "Nothing to tear down");
        }
        for handle in &handles {
            warn!(instance_id = %correlation_id, handle = %handle, "Sweeping unbound resource");
            self.terminate(credential, handle).await?;
        }
        Ok(handles)
    }

    async fn back_off_or_give_up(&self, attempt: u32, error: &ComputeError, target: &str) -> Result<(), TeardownError> {
        if !error.is_transient() || !self.retry.should_retry(attempt) {
            warn!(resource = target, attempts = attempt, "Teardown could not be confirmed: {}", error);
            return Err(TeardownError::Unconfirmed {
                attempts: attempt,
                last_error: error.to_string(),
            });
        }
        let delay = self.retry.backoff(attempt);
        warn!(resource = target, attempt, ?delay, "Transient teardown failure, retrying: {}", error);
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::compute::{BootConfig, ResourceTags};
    use crate::domain::credentials::IssuedCredentials;
    use crate::domain::lifecycle::{ResourceSpec, SizeClass, TargetAccountRef};
    use crate::infrastructure::compute::simulated::SimulatedComputeProvider;
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

    fn reaper(compute: Arc<SimulatedComputeProvider>) -> Reaper {
        Reaper::new(
            compute,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
            Duration::from_secs(5),
        )
    }

    async fn create(compute: &SimulatedComputeProvider, id: InstanceId) -> ResourceHandle {
        let tags = ResourceTags::for_instance(id);
        let boot = BootConfig {
            agent_label: tags.agent_label.clone(),
            registration_token: None,
        };
        compute
            .create_resource(&credential(), &ResourceSpec::new("img", SizeClass::Small), &tags, &boot)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_twice_confirms_both_times() {
        let compute = Arc::new(SimulatedComputeProvider::new(5));
        let handle = create(&compute, InstanceId::new()).await;
        let reaper = reaper(compute.clone());

        let first = reaper.terminate(&credential(), &handle).await.unwrap();
        let second = reaper.terminate(&credential(), &handle).await.unwrap();

        assert!(!first.already_gone);
        assert!(second.already_gone);
        assert_eq!(compute.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let compute = Arc::new(SimulatedComputeProvider::new(5));
        let handle = create(&compute, InstanceId::new()).await;
        compute.inject_terminate_fault(ComputeError::Transient("throttled".into()));

        let confirmed = reaper(compute.clone()).terminate(&credential(), &handle).await.unwrap();

        assert_eq!(confirmed.attempts, 2);
        assert_eq!(compute.terminate_calls_for(&handle), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_unconfirmed() {
        let compute = Arc::new(SimulatedComputeProvider::new(5));
        let handle = create(&compute, InstanceId::new()).await;
        compute.set_terminate_outage(true);

        let err = reaper(compute.clone()).terminate(&credential(), &handle).await.unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(compute.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_finds_unbound_resources() {
        let compute = Arc::new(SimulatedComputeProvider::new(5));
        let id = InstanceId::new();
        let orphan = create(&compute, id).await;
        let unrelated = create(&compute, InstanceId::new()).await;

        let swept = reaper(compute.clone()).sweep(&credential(), id).await.unwrap();

        assert_eq!(swept, vec![orphan]);
        assert_eq!(compute.live_resources(), vec![unrelated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_with_nothing_to_do_confirms() {
        let compute = Arc::new(SimulatedComputeProvider::new(5));
        let swept = reaper(compute.clone()).sweep(&credential(), InstanceId::new()).await.unwrap();
        assert!(swept.is_empty());
        assert_eq!(compute.terminate_calls(), 0);
    }
}
