// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Credential Broker
//!
//! Obtains short-lived credentials for a target trust domain and refreshes
//! them before they expire. `AuthDenied` is a configuration fault and is
//! surfaced on the first occurrence; throttling and network failures are
//! retried with bounded exponential backoff.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Wraps `IdentityProvider` with retry and expiry handling

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::credentials::{CredentialError, IdentityError, IdentityProvider, ScopedCredential};
use crate::domain::lifecycle::TargetAccountRef;
use crate::domain::retry::RetryPolicy;

pub struct CredentialBroker {
    provider: Arc<dyn IdentityProvider>,
    retry: RetryPolicy,
    grace_window: Duration,
}

impl CredentialBroker {
    pub fn new(provider: Arc<dyn IdentityProvider>, retry: RetryPolicy, grace_window: Duration) -> Self {
        Self {
            provider,
            retry,
            grace_window,
        }
    }

    pub async fn acquire(
        &self,
        target: &TargetAccountRef,
        session_label: &str,
    ) -> Result<ScopedCredential, CredentialError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .provider
                .assume_role(&target.role_ref, session_label, target.external_id.as_deref())
                .await;

            match result {
                Ok(material) => {
                    debug!(role = %target.role_ref, session = session_label, expires_at = %material.expires_at, "Assumed role");
                    return Ok(ScopedCredential::new(target.clone(), session_label, material));
                }
                Err(IdentityError::Denied(message)) => {
                    warn!(role = %target.role_ref, "Role assumption denied: {}", message);
                    return Err(CredentialError::AuthDenied(message));
                }
                Err(e) => {
                    if !self.retry.should_retry(attempt) {
                        warn!(role = %target.role_ref, attempts = attempt, "Giving up on role assumption: {}", e);
                        return Err(CredentialError::AuthTransient {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(role = %target.role_ref, attempt, ?delay, "Transient identity error, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns `credential` unchanged unless it expires within the grace window.
    pub async fn ensure_valid(&self, credential: ScopedCredential) -> Result<ScopedCredential, CredentialError> {
        let grace = chrono::Duration::from_std(self.grace_window).unwrap_or_else(|_| chrono::Duration::zero());
        if !credential.is_expired_at(Utc::now() + grace) {
            return Ok(credential);
        }
        debug!(session = %credential.session_label, "Refreshing credentials inside grace window");
        self.acquire(&credential.target, &credential.session_label).await
    }
}
