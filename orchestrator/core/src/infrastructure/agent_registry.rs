// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Work-Receiving System Clients
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Observe agent registration and route one job to a ready agent
//! - **Integration:** Readiness watcher / controller → job-runner HTTP API
//!
//! Endpoints used by `HttpAgentRegistry`:
//!
//! ```text
//! GET  {endpoint}/v1/agents/{label}              → { "status": "online" | "offline" }
//! POST {endpoint}/v1/agents/{label}/assignments  → { "assignment_id": "...", "acknowledged_at": "..." }
//! ```
//!
//! A 404 on the status lookup means the agent has not registered yet.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::agent_registry::{
    AgentRegistry, AgentStatus, HandoffAck, HandoffError, HandoffRequest, RegistryError, WorkHandoff,
};
use crate::infrastructure::compute::SimulatedComputeProvider;

#[derive(Deserialize)]
struct AgentStatusResponse {
    status: AgentStatus,
}

pub struct HttpAgentRegistry {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAgentRegistry {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl AgentRegistry for HttpAgentRegistry {
    async fn describe_status(&self, agent_label: &str) -> Result<AgentStatus, RegistryError> {
        let url = format!("{}/v1/agents/{}", self.base_url, agent_label);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("GET {} failed: {}", url, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(AgentStatus::Offline),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RegistryError::Unauthorized(response.status().to_string()))
            }
            status if status.is_success() => {
                let body: AgentStatusResponse = response
                    .json()
                    .await
                    .map_err(|e| RegistryError::Unavailable(format!("Malformed agent status: {}", e)))?;
                Ok(body.status)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Unavailable(format!("{}: {}", status, body)))
            }
        }
    }
}

#[async_trait]
impl WorkHandoff for HttpAgentRegistry {
    async fn hand_off(&self, request: &HandoffRequest) -> Result<HandoffAck, HandoffError> {
        let url = format!("{}/v1/agents/{}/assignments", self.base_url, request.agent_label);
        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| HandoffError::Unavailable(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| HandoffError::Unavailable(format!("Malformed handoff acknowledgement: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(HandoffError::Rejected(format!("{}: {}", status, body)))
        } else {
            Err(HandoffError::Unavailable(format!("{}: {}", status, body)))
        }
    }
}

/// Registry paired with `SimulatedComputeProvider`: an agent comes online a
/// fixed delay after its resource was created and goes away with it.
pub struct SimulatedAgentRegistry {
    compute: Arc<SimulatedComputeProvider>,
    boot_delay: Duration,
    handoffs: AtomicU32,
}

impl SimulatedAgentRegistry {
    pub fn new(compute: Arc<SimulatedComputeProvider>, boot_delay: Duration) -> Self {
        Self {
            compute,
            boot_delay,
            handoffs: AtomicU32::new(0),
        }
    }

    pub fn handoff_count(&self) -> u32 {
        self.handoffs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRegistry for SimulatedAgentRegistry {
    async fn describe_status(&self, agent_label: &str) -> Result<AgentStatus, RegistryError> {
        match self.compute.booted_at(agent_label) {
            Some(created_at) if created_at + self.boot_delay <= tokio::time::Instant::now() => {
                Ok(AgentStatus::Online)
            }
            _ => Ok(AgentStatus::Offline),
        }
    }
}

#[async_trait]
impl WorkHandoff for SimulatedAgentRegistry {
    async fn hand_off(&self, request: &HandoffRequest) -> Result<HandoffAck, HandoffError> {
        if self.compute.booted_at(&request.agent_label).is_none() {
            return Err(HandoffError::Rejected(format!(
                "agent {} is not registered",
                request.agent_label
            )));
        }
        let n = self.handoffs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(HandoffAck {
            assignment_id: Some(format!("sim-assignment-{}", n)),
            acknowledged_at: Utc::now(),
        })
    }
}
