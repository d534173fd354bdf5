// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work-Receiving System Interfaces
//!
//! The job runner that eventually executes work on the ephemeral agent. The
//! orchestrator never talks to the agent itself: the agent registers outbound
//! with the runner, the orchestrator observes that registration, asks the
//! runner to route exactly one job to the agent, and then waits for the
//! completion signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::lifecycle::{InstanceId, ResourceHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent registry unavailable: {0}")]
    Unavailable(String),
    #[error("agent registry rejected credentials: {0}")]
    Unauthorized(String),
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn describe_status(&self, agent_label: &str) -> Result<AgentStatus, RegistryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub instance_id: InstanceId,
    pub agent_label: String,
    pub resource_handle: ResourceHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffAck {
    #[serde(default)]
    pub assignment_id: Option<String>,
    pub acknowledged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("handoff rejected: {0}")]
    Rejected(String),
    #[error("work-receiving system unavailable: {0}")]
    Unavailable(String),
}

/// Hands exactly one unit of work to a ready agent.
#[async_trait]
pub trait WorkHandoff: Send + Sync {
    async fn hand_off(&self, request: &HandoffRequest) -> Result<HandoffAck, HandoffError>;
}
