// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with daemon API

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio_stream::StreamExt;

use ember_core::domain::ledger::EscalationRecord;
use ember_core::domain::lifecycle::{InstanceId, InstanceStatus, JobOutcome};

use super::base_url;

/// One server-sent event from `/v1/instances/{id}/events`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedEvent {
    pub kind: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            // No global timeout: event streams are long-lived
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    /// `request` is the JSON body of `POST /v1/instances`.
    pub async fn create_instance(&self, request: &serde_json::Value) -> Result<InstanceId> {
        let response = self
            .client
            .post(format!("{}/v1/instances", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to create instance")?;
        let response = ensure_success(response, "Failed to create instance").await?;

        #[derive(Deserialize)]
        struct CreateResponse {
            instance_id: InstanceId,
        }

        let created: CreateResponse = response
            .json()
            .await
            .context("Failed to parse create response")?;

        Ok(created.instance_id)
    }

    pub async fn get_status(&self, id: InstanceId) -> Result<InstanceStatus> {
        let response = self
            .client
            .get(format!("{}/v1/instances/{}", self.base_url, id))
            .send()
            .await
            .context("Failed to get instance status")?;
        let response = ensure_success(response, "Failed to get instance status").await?;

        response
            .json()
            .await
            .context("Failed to parse status response")
    }

    pub async fn cancel(&self, id: InstanceId) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/instances/{}/cancel", self.base_url, id))
            .send()
            .await
            .context("Failed to cancel instance")?;
        ensure_success(response, "Failed to cancel instance").await?;
        Ok(())
    }

    pub async fn complete(&self, id: InstanceId, outcome: &JobOutcome) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/instances/{}/complete", self.base_url, id))
            .json(outcome)
            .send()
            .await
            .context("Failed to signal completion")?;
        ensure_success(response, "Failed to signal completion").await?;
        Ok(())
    }

    pub async fn list_escalations(&self) -> Result<Vec<EscalationRecord>> {
        let response = self
            .client
            .get(format!("{}/v1/escalations", self.base_url))
            .send()
            .await
            .context("Failed to list escalations")?;
        let response = ensure_success(response, "Failed to list escalations").await?;

        response
            .json()
            .await
            .context("Failed to parse escalations response")
    }

    /// Follow an instance's event stream until the daemon closes it.
    pub async fn watch<F>(&self, id: InstanceId, mut on_event: F) -> Result<()>
    where
        F: FnMut(StreamedEvent),
    {
        let response = self
            .client
            .get(format!("{}/v1/instances/{}/events", self.base_url, id))
            .send()
            .await
            .context("Failed to connect to event stream")?;
        let response = ensure_success(response, "Failed to stream events").await?;

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read event stream chunk")?;
            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                on_event(event);
            }
        }

        Ok(())
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(body);
    anyhow::bail!("{} ({}): {}", what, status, message)
}

/// Incremental `text/event-stream` decoder; chunks may split lines.
#[derive(Default)]
struct SseParser {
    buffer: String,
    kind: Option<String>,
    data: String,
}

impl SseParser {
    fn push(&mut self, chunk: &str) -> Vec<StreamedEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    if let Ok(data) = serde_json::from_str(&self.data) {
                        events.push(StreamedEvent {
                            kind: self.kind.take().unwrap_or_else(|| "message".to_string()),
                            data,
                        });
                    }
                }
                self.kind = None;
                self.data.clear();
            } else if let Some(kind) = line.strip_prefix("event:") {
                self.kind = Some(kind.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
            // Comments (keep-alives) and unknown fields are ignored
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::ServerGuard) -> DaemonClient {
        let address = server.host_with_port();
        let (host, port) = address.rsplit_once(':').unwrap();
        DaemonClient::new(host, port.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_create_instance() {
        let id = InstanceId::new();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/instances")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "resource_spec": { "image": "runner:latest" }
            })))
            .with_status(202)
            .with_body(format!(r#"{{"instance_id":"{}"}}"#, id))
            .create_async()
            .await;

        let created = client(&server)
            .create_instance(&serde_json::json!({
                "resource_spec": { "image": "runner:latest", "size": "small" },
                "target_account_ref": { "role_ref": "role/ci" }
            }))
            .await
            .unwrap();

        assert_eq!(created, id);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let id = InstanceId::new();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/v1/instances/{}/cancel", id).as_str())
            .with_status(409)
            .with_body(r#"{"error":"instance is already terminated"}"#)
            .create_async()
            .await;

        let err = client(&server).cancel(id).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("409"));
        assert!(message.contains("already terminated"));
    }

    #[test]
    fn test_sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push("event: status\ndata: {\"state\":").is_empty());
        let events = parser.push("\"in_use\"}\n\n: keep-alive\n\nevent: instance_finished\ndata: {}\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "status");
        assert_eq!(events[0].data["state"], "in_use");
        assert_eq!(events[1].kind, "instance_finished");
    }
}
