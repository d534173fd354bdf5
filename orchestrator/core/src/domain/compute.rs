// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Compute Provider Interface
//!
//! The seam between the orchestrator and whatever actually runs the ephemeral
//! agent (a Docker daemon, a cloud compute API, the in-process simulator).
//! Every resource created through this trait carries the owning instance id
//! as metadata so that `find_by_correlation` can always map a live resource
//! back to its lifecycle instance, including after an orchestrator restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::credentials::ScopedCredential;
use crate::domain::lifecycle::{InstanceId, ResourceHandle, ResourceSpec};

/// Metadata key carrying the owning lifecycle instance id.
pub const LIFECYCLE_TAG: &str = "ember.lifecycle-id";
/// Metadata key carrying the label the agent registers under.
pub const AGENT_LABEL_TAG: &str = "ember.agent-label";
/// Marks resources created by this orchestrator.
pub const MANAGED_TAG: &str = "ember.managed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTags {
    pub correlation_id: InstanceId,
    pub agent_label: String,
}

impl ResourceTags {
    pub fn for_instance(id: InstanceId) -> Self {
        Self {
            correlation_id: id,
            agent_label: id.agent_label(),
        }
    }

    /// Idempotency token scoped to the correlation id.
    pub fn idempotency_token(&self) -> String {
        format!("ember-agent-{}", self.correlation_id.0.simple())
    }

    pub fn to_labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (LIFECYCLE_TAG.to_string(), self.correlation_id.to_string()),
            (AGENT_LABEL_TAG.to_string(), self.agent_label.clone()),
            (MANAGED_TAG.to_string(), "true".to_string()),
        ])
    }
}

/// Boot-time configuration the agent uses to self-register.
#[derive(Clone)]
pub struct BootConfig {
    pub agent_label: String,
    pub registration_token: Option<String>,
}

impl std::fmt::Debug for BootConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootConfig")
            .field("agent_label", &self.agent_label)
            .field("registration_token", &self.registration_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Creating,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid identity profile: {0}")]
    InvalidProfile(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    /// A resource already holds this idempotency token.
    #[error("resource conflict: {0}")]
    Conflict(String),
    /// The request may or may not have taken effect (e.g. timed out).
    #[error("outcome unknown: {0}")]
    Ambiguous(String),
    #[error("transient provider error: {0}")]
    Transient(String),
}

impl ComputeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_) | ComputeError::Ambiguous(_))
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn create_resource(
        &self,
        credential: &ScopedCredential,
        spec: &ResourceSpec,
        tags: &ResourceTags,
        boot: &BootConfig,
    ) -> Result<ResourceHandle, ComputeError>;

    /// Start a resource that was created but never started. Starting one
    /// that is already running succeeds.
    async fn start_resource(&self, credential: &ScopedCredential, handle: &ResourceHandle) -> Result<(), ComputeError>;

    async fn describe_resource(
        &self,
        credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<ResourceStatus, ComputeError>;

    async fn terminate_resource(
        &self,
        credential: &ScopedCredential,
        handle: &ResourceHandle,
    ) -> Result<(), ComputeError>;

    /// Block until the provider reports the resource gone or `timeout` elapses.
    async fn wait_terminated(
        &self,
        credential: &ScopedCredential,
        handle: &ResourceHandle,
        timeout: Duration,
    ) -> Result<(), ComputeError>;

    /// All live resources tagged with this correlation id.
    async fn find_by_correlation(
        &self,
        credential: &ScopedCredential,
        correlation_id: InstanceId,
    ) -> Result<Vec<ResourceHandle>, ComputeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_carry_correlation_id() {
        let id = InstanceId::new();
        let tags = ResourceTags::for_instance(id);
        let labels = tags.to_labels();

        assert_eq!(labels.get(LIFECYCLE_TAG), Some(&id.to_string()));
        assert_eq!(labels.get(AGENT_LABEL_TAG), Some(&id.agent_label()));
        assert!(tags.idempotency_token().ends_with(&id.0.simple().to_string()));
    }

    #[test]
    fn test_only_transient_classes_retry() {
        assert!(ComputeError::Transient("503".into()).is_transient());
        assert!(ComputeError::Ambiguous("timeout".into()).is_transient());
        assert!(!ComputeError::QuotaExhausted("vcpu".into()).is_transient());
        assert!(!ComputeError::NotFound("i-1".into()).is_transient());
    }
}
