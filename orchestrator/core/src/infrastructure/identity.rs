// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identity Provider Clients
//!
//! Adapters behind the `IdentityProvider` trait consumed by the credential
//! broker.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Exchange a role reference for short-lived credentials
//! - **Integration:** Credential broker → HTTP STS-style endpoint
//!
//! `HttpIdentityProvider` talks to an STS-compatible service:
//!
//! ```text
//! POST {endpoint}/v1/assume-role
//! { "role_ref": "...", "session_label": "...", "external_id": "...", "duration_seconds": 3600 }
//! ```
//!
//! `StaticIdentityProvider` issues fixed local credentials and pairs with the
//! Docker and simulated compute backends, which need no cloud identity.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::domain::credentials::{IdentityError, IdentityProvider, IssuedCredentials};

#[derive(Serialize)]
struct AssumeRoleRequest<'a> {
    role_ref: &'a str,
    session_label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
    duration_seconds: u64,
}

#[derive(Deserialize)]
struct AssumeRoleResponse {
    access_key: String,
    secret: String,
    session_token: String,
    expires_at: DateTime<Utc>,
}

pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
    session_duration: Duration,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>, session_duration: Duration) -> Result<Self, IdentityError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IdentityError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            session_duration,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn assume_role(
        &self,
        role_ref: &str,
        session_label: &str,
        external_id: Option<&str>,
    ) -> Result<IssuedCredentials, IdentityError> {
        let url = format!("{}/v1/assume-role", self.base_url);
        let mut request = self.client.post(&url).json(&AssumeRoleRequest {
            role_ref,
            session_label,
            external_id,
            duration_seconds: self.session_duration.as_secs(),
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
                    IdentityError::Denied(format!("{}: {}", status, body))
                }
                StatusCode::TOO_MANY_REQUESTS => IdentityError::Throttled(body),
                _ => IdentityError::Unavailable(format!("{}: {}", status, body)),
            });
        }

        let issued: AssumeRoleResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("Malformed assume-role response: {}", e)))?;

        debug!(role_ref, session_label, expires_at = %issued.expires_at, "Assumed role");
        Ok(IssuedCredentials {
            access_key: issued.access_key,
            secret: issued.secret,
            session_token: issued.session_token,
            expires_at: issued.expires_at,
        })
    }
}

/// Issues locally generated credentials with a fixed lifetime.
pub struct StaticIdentityProvider {
    ttl: Duration,
}

impl StaticIdentityProvider {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn assume_role(
        &self,
        role_ref: &str,
        session_label: &str,
        _external_id: Option<&str>,
    ) -> Result<IssuedCredentials, IdentityError> {
        if role_ref.trim().is_empty() {
            return Err(IdentityError::Denied("empty role reference".to_string()));
        }
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        Ok(IssuedCredentials {
            access_key: format!("local-{}", session_label),
            secret: Uuid::new_v4().simple().to_string(),
            session_token: Uuid::new_v4().simple().to_string(),
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(server: &mockito::ServerGuard) -> HttpIdentityProvider {
        HttpIdentityProvider::new(server.url(), Some("sts-token".into()), Duration::from_secs(900)).unwrap()
    }

    #[tokio::test]
    async fn test_assume_role_parses_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/assume-role")
            .match_header("authorization", "Bearer sts-token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "role_ref": "role/ci",
                "session_label": "ember-abc",
                "external_id": "ext-1",
                "duration_seconds": 900
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_key":"AK","secret":"S","session_token":"T","expires_at":"2030-01-01T00:00:00Z"}"#,
            )
            .create_async()
            .await;

        let issued = provider(&server)
            .assume_role("role/ci", "ember-abc", Some("ext-1"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(issued.access_key, "AK");
        assert_eq!(issued.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_denied() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/assume-role")
            .with_status(403)
            .with_body("trust policy does not allow this principal")
            .create_async()
            .await;

        let err = provider(&server).assume_role("role/ci", "s", None).await.unwrap_err();
        assert!(matches!(err, IdentityError::Denied(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_throttling_and_outage_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/assume-role")
            .with_status(429)
            .create_async()
            .await;
        let err = provider(&server).assume_role("role/ci", "s", None).await.unwrap_err();
        assert!(matches!(err, IdentityError::Throttled(_)));

        let mut down = mockito::Server::new_async().await;
        down.mock("POST", "/v1/assume-role")
            .with_status(503)
            .create_async()
            .await;
        let err = provider(&down).assume_role("role/ci", "s", None).await.unwrap_err();
        assert!(matches!(err, IdentityError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_static_provider_issues_expiring_credentials() {
        let issued = StaticIdentityProvider::new(Duration::from_secs(60))
            .assume_role("local", "ember-1", None)
            .await
            .unwrap();
        assert!(issued.expires_at > Utc::now());
        assert!(issued.expires_at <= Utc::now() + ChronoDuration::seconds(61));

        let err = StaticIdentityProvider::new(Duration::from_secs(60))
            .assume_role(" ", "ember-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Denied(_)));
    }
}
