// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Caller-facing HTTP API.
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | GET | `/health` | liveness |
//! | POST | `/v1/instances` | create an instance |
//! | GET | `/v1/instances/{id}` | status |
//! | POST | `/v1/instances/{id}/cancel` | cancel |
//! | POST | `/v1/instances/{id}/complete` | completion signal |
//! | GET | `/v1/instances/{id}/events` | SSE lifecycle events |
//! | GET | `/v1/escalations` | manual-intervention records |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::lifecycle::{ControllerError, CreateInstanceRequest, LifecycleController};
use crate::domain::lifecycle::{InstanceId, JobOutcome};
use crate::infrastructure::event_bus::{EventBusError, InstanceEventReceiver};

pub struct AppState {
    pub controller: LifecycleController,
    pub start_time: Instant,
}

pub fn app(controller: LifecycleController) -> Router {
    let state = Arc::new(AppState {
        controller,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/instances", post(create_instance_handler))
        .route("/v1/instances/{id}", get(get_status_handler))
        .route("/v1/instances/{id}/cancel", post(cancel_handler))
        .route("/v1/instances/{id}/complete", post(complete_handler))
        .route("/v1/instances/{id}/events", get(stream_events_handler))
        .route("/v1/escalations", get(list_escalations_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::AlreadyTerminal { .. } | ControllerError::NotInUse { .. } => StatusCode::CONFLICT,
            ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ControllerError::Lifecycle(_) | ControllerError::Ledger(_) | ControllerError::EventsClosed => {
                error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(ControllerError::InvalidRequest(format!("invalid instance id: {}", raw))))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "in_flight": state.controller.in_flight(),
    }))
}

async fn create_instance_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.controller.create_instance(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "instance_id": id }))))
}

async fn get_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.controller.get_status(parse_id(&id)?).await?;
    Ok(Json(status))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state.controller.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "instance_id": id, "cancelled": true }))))
}

async fn complete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(outcome): Json<JobOutcome>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state.controller.signal_completion(id, outcome).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "instance_id": id, "completed": true }))))
}

async fn list_escalations_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.list_escalations().await?))
}

async fn stream_events_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let receiver = state.controller.event_bus().subscribe_instance(id);
    // Unknown ids are rejected before the stream opens.
    let current = state.controller.get_status(id).await?;

    // The current status goes first so late subscribers know where the instance is.
    let snapshot = Event::default()
        .event("status")
        .data(serde_json::to_string(&current).unwrap_or_default());
    let finished = current.state.is_terminal();

    let events = stream::unfold(
        (receiver, finished),
        |(mut receiver, finished): (InstanceEventReceiver, bool)| async move {
            if finished {
                return None;
            }
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let done = event.is_final();
                        let sse = Event::default()
                            .event(event.kind())
                            .data(serde_json::to_string(&event).unwrap_or_default());
                        return Some((Ok(sse), (receiver, done)));
                    }
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        },
    );

    let stream = stream::once(async move { Ok(snapshot) }).chain(events);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::credential_broker::CredentialBroker;
    use crate::application::lifecycle::{ControllerComponents, ControllerSettings};
    use crate::application::provisioner::ResourceProvisioner;
    use crate::application::readiness::ReadinessWatcher;
    use crate::application::reaper::Reaper;
    use crate::domain::retry::RetryPolicy;
    use crate::infrastructure::agent_registry::SimulatedAgentRegistry;
    use crate::infrastructure::compute::SimulatedComputeProvider;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::identity::StaticIdentityProvider;
    use crate::infrastructure::repositories::InMemoryLedger;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> Router {
        let compute = Arc::new(SimulatedComputeProvider::new(2));
        let registry = Arc::new(SimulatedAgentRegistry::new(compute.clone(), Duration::from_secs(1)));
        let retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10));
        let controller = LifecycleController::new(
            ControllerComponents {
                ledger: Arc::new(InMemoryLedger::new()),
                broker: Arc::new(CredentialBroker::new(
                    Arc::new(StaticIdentityProvider::new(Duration::from_secs(3600))),
                    retry.clone(),
                    Duration::from_secs(60),
                )),
                provisioner: Arc::new(ResourceProvisioner::new(compute.clone(), retry.clone(), None)),
                watcher: Arc::new(ReadinessWatcher::new(
                    registry.clone(),
                    Duration::from_secs(1),
                    Duration::ZERO,
                )),
                handoff: registry,
                reaper: Arc::new(Reaper::new(compute, retry, Duration::from_secs(5))),
                event_bus: EventBus::new(64),
            },
            ControllerSettings::default(),
        );
        app(controller)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_create_then_get_status() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/instances",
                json!({
                    "resource_spec": { "image": "runner:latest", "size": "small" },
                    "target_account_ref": { "role_ref": "role/ci" },
                    "ready_deadline": "30s"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = body_json(response).await["instance_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/instances/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["id"], id);
        assert_eq!(status["condition"], "active");
    }

    #[tokio::test]
    async fn test_invalid_spec_is_bad_request() {
        let response = router()
            .oneshot(post_json(
                "/v1/instances",
                json!({
                    "resource_spec": { "image": "", "size": "small" },
                    "target_account_ref": { "role_ref": "role/ci" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("image"));
    }

    #[tokio::test]
    async fn test_oversized_custom_size_is_bad_request() {
        let response = router()
            .oneshot(post_json(
                "/v1/instances",
                json!({
                    "resource_spec": {
                        "image": "ghcr.io/acme/runner:1.4",
                        "size": { "custom": { "cpu_millis": 1, "memory_mb": u64::MAX / 1024 } }
                    },
                    "target_account_ref": { "role_ref": "role/ci" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("custom size"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_a_finished_instance_conflicts() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/instances",
                json!({
                    "resource_spec": { "image": "runner:latest", "size": "small" },
                    "target_account_ref": { "role_ref": "role/ci" }
                }),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["instance_id"].as_str().unwrap().to_string();
        let cancel = format!("/v1/instances/{}/cancel", id);

        let response = app.clone().oneshot(post_json(&cancel, json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        loop {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/v1/instances/{}", id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            if body_json(response).await["condition"] != "active" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let response = app.oneshot(post_json(&cancel, json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let app = router();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/instances/{}", InstanceId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json("/v1/instances/not-a-uuid/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_escalations_start_empty() {
        let response = router()
            .oneshot(Request::builder().uri("/v1/escalations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }
}
