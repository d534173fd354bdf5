// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cross-Account Credentials
//!
//! Short-lived, scoped credentials for the target trust domain. They live in
//! memory for the lifetime of one lifecycle instance and are deliberately not
//! `Serialize`: nothing in this crate can write them to the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::domain::lifecycle::TargetAccountRef;

/// Raw credential material returned by the identity provider.
#[derive(Clone)]
pub struct IssuedCredentials {
    pub access_key: String,
    pub secret: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct ScopedCredential {
    pub target: TargetAccountRef,
    pub session_label: String,
    material: IssuedCredentials,
}

impl ScopedCredential {
    pub fn new(target: TargetAccountRef, session_label: impl Into<String>, material: IssuedCredentials) -> Self {
        Self {
            target,
            session_label: session_label.into(),
            material,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.material.expires_at
    }

    pub fn access_key(&self) -> &str {
        &self.material.access_key
    }

    pub fn secret(&self) -> &str {
        &self.material.secret
    }

    pub fn session_token(&self) -> &str {
        &self.material.session_token
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.material.expires_at <= now
    }
}

impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("target", &self.target.role_ref)
            .field("session_label", &self.session_label)
            .field("material", &self.material)
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The trust relationship rejected the assumption.
    #[error("Role assumption denied: {0}")]
    Denied(String),
    #[error("Identity provider throttled the request: {0}")]
    Throttled(String),
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

impl IdentityError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, IdentityError::Denied(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// Configuration fault; never retried.
    #[error("AuthDenied: {0}")]
    AuthDenied(String),
    /// Throttling or network failure that survived the retry budget.
    #[error("AuthTransient after {attempts} attempts: {message}")]
    AuthTransient { attempts: u32, message: String },
}

/// Identity provider interface consumed by the credential broker.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn assume_role(
        &self,
        role_ref: &str,
        session_label: &str,
        external_id: Option<&str>,
    ) -> Result<IssuedCredentials, IdentityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret_material() {
        let credential = ScopedCredential::new(
            TargetAccountRef::new("role/ci"),
            "ember-test",
            IssuedCredentials {
                access_key: "AKIAEXAMPLE".to_string(),
                secret: "super-secret".to_string(),
                session_token: "token-value".to_string(),
                expires_at: Utc::now(),
            },
        );
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("token-value"));
    }

    #[test]
    fn test_denied_is_not_transient() {
        assert!(!IdentityError::Denied("no trust".into()).is_transient());
        assert!(IdentityError::Throttled("slow down".into()).is_transient());
        assert!(IdentityError::Unavailable("dns".into()).is_transient());
    }
}
