//! HTTP route handlers.
//!
//! Agent endpoints stay open until the session is resolved. Dropping the
//! request (client disconnect) drops the wait and disarms the session.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use headlock_core::{
    AgentReply, ContinueRequest, EnterRequest, InstructRequest, ReattachRequest, SessionFilter,
    SessionState, SessionSummary,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::state::AppState;
use crate::{mcp, ws};

/// Build the router with every endpoint and permissive CORS.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/headlock/enter-headlock", post(enter_headlock))
        .route("/headlock/continue-headlock", post(continue_headlock))
        .route("/headlock/reattach", post(reattach))
        .route("/sessions", get(list_sessions))
        .route("/sessions/waiting", get(list_waiting_sessions))
        .route("/sessions/{session_id}", get(get_session).delete(delete_session))
        .route("/sessions/{session_id}/instruct", post(instruct))
        .route("/sessions/{session_id}/tap-out", post(tap_out))
        .route("/sessions/{session_id}/complete", post(complete))
        .route("/mcp", post(mcp::handle))
        .route("/ws", get(ws::global_socket))
        .route("/ws/{session_id}", get(ws::session_socket))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
    mcp: &'static str,
    health: &'static str,
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "headlock",
        mcp: "/mcp",
        health: "/health",
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    waiting_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.coordinator.stats();
    Json(HealthResponse {
        status: "healthy",
        active_sessions: stats.total,
        waiting_sessions: stats.waiting,
    })
}

// ---------------------------------------------------------------------------
// Agent endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    timeout_secs: Option<u64>,
}

/// POST /headlock/enter-headlock
async fn enter_headlock(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<EnterRequest>,
) -> Result<Json<AgentReply>, ApiError> {
    let outcome = state
        .coordinator
        .enter(
            request.session_id,
            request.context,
            state.wait_options(query.timeout_secs),
        )
        .await?;
    Ok(Json(outcome.into_result()?))
}

/// POST /headlock/continue-headlock
async fn continue_headlock(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<ContinueRequest>,
) -> Result<Json<AgentReply>, ApiError> {
    let outcome = state
        .coordinator
        .continue_session(
            &request.session_id,
            request.context,
            state.wait_options(query.timeout_secs),
        )
        .await?;
    Ok(Json(outcome.into_result()?))
}

/// POST /headlock/reattach
async fn reattach(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<ReattachRequest>,
) -> Result<Json<AgentReply>, ApiError> {
    let outcome = state
        .coordinator
        .reattach(&request.session_id, state.wait_options(query.timeout_secs))
        .await?;
    Ok(Json(outcome.into_result()?))
}

// ---------------------------------------------------------------------------
// Controller endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    state: Option<String>,
}

/// GET /sessions[?state=waiting]
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let filter = match query.state.as_deref() {
        Some(raw) => SessionFilter::state(
            raw.parse::<SessionState>()
                .map_err(|_| ApiError::BadRequest(format!("Unknown session state: {}", raw)))?,
        ),
        None => SessionFilter::all(),
    };
    Ok(Json(state.coordinator.list_sessions(filter).to_vec()))
}

/// GET /sessions/waiting
async fn list_waiting_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .coordinator
            .list_sessions(SessionFilter::waiting())
            .to_vec(),
    )
}

/// GET /sessions/{session_id}
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.coordinator.get_session(&session_id)?))
}

/// Result of a controller action
#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    message: &'static str,
    session: SessionSummary,
}

impl ActionResponse {
    fn ok(message: &'static str, session: SessionSummary) -> Json<Self> {
        Json(Self {
            success: true,
            message,
            session,
        })
    }
}

/// POST /sessions/{session_id}/instruct
async fn instruct(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<InstructRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let session = state.instruct(&session_id, request.instruction)?;
    Ok(ActionResponse::ok("Instruction sent", session))
}

/// POST /sessions/{session_id}/tap-out
async fn tap_out(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let session = state.coordinator.tap_out(&session_id)?;
    Ok(ActionResponse::ok("Tap out signal sent", session))
}

/// POST /sessions/{session_id}/complete
async fn complete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let session = state.coordinator.complete(&session_id)?;
    Ok(ActionResponse::ok("Session completed", session))
}

/// DELETE /sessions/{session_id}
async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let session = state.coordinator.remove(&session_id)?;
    Ok(ActionResponse::ok("Session removed", session))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use headlock_core::{Coordinator, CoordinatorConfig, Scope, SessionEventKind};
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<Coordinator>) {
        test_app_with(CoordinatorConfig::default())
    }

    fn test_app_with(config: CoordinatorConfig) -> (Router, Arc<Coordinator>) {
        let coordinator = Arc::new(Coordinator::new(config));
        let state = AppState::new(coordinator.clone(), CancellationToken::new());
        (create_router(state), coordinator)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    mod service_tests {
        use super::*;

        #[tokio::test]
        async fn root_describes_service() {
            let (app, _) = test_app();
            let response = app.oneshot(get_request("/")).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["name"], "headlock");
            assert_eq!(body["mcp"], "/mcp");
        }

        #[tokio::test]
        async fn health_reports_counts() {
            let (app, _) = test_app();
            let response = app.oneshot(get_request("/health")).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["active_sessions"], 0);
            assert_eq!(body["waiting_sessions"], 0);
        }
    }

    mod agent_tests {
        use super::*;

        #[tokio::test]
        async fn enter_instruct_round_trip() {
            let (app, coordinator) = test_app();
            let mut events = coordinator.subscribe(Scope::Session("h1".to_string()));

            let agent = tokio::spawn(app.clone().oneshot(post_json(
                "/headlock/enter-headlock",
                json!({"session_id": "h1", "context": "ready"}),
            )));
            assert_eq!(events.recv().await.unwrap().kind, SessionEventKind::Entered);

            let waiting = body_json(app.clone().oneshot(get_request("/sessions/waiting")).await.unwrap()).await;
            assert_eq!(waiting[0]["id"], "h1");
            assert_eq!(waiting[0]["state"], "WAITING");

            let response = app
                .clone()
                .oneshot(post_json(
                    "/sessions/h1/instruct",
                    json!({"instruction": "build it"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["success"], true);
            assert_eq!(body["session"]["state"], "PROCESSING");

            let response = agent.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["session_id"], "h1");
            assert_eq!(body["instruction"], "build it");
            assert_eq!(body["should_terminate"], false);
        }

        #[tokio::test]
        async fn tap_out_terminates_agent() {
            let (app, coordinator) = test_app();
            let mut events = coordinator.subscribe(Scope::Session("h1".to_string()));

            let agent = tokio::spawn(
                app.clone()
                    .oneshot(post_json("/headlock/enter-headlock", json!({"session_id": "h1"}))),
            );
            events.recv().await.unwrap();

            let response = app
                .clone()
                .oneshot(post_json("/sessions/h1/tap-out", json!({})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = body_json(agent.await.unwrap().unwrap()).await;
            assert_eq!(body["should_terminate"], true);
            assert_eq!(body["instruction"], Value::Null);

            // A second tap out conflicts with the terminal state
            let response = app
                .oneshot(post_json("/sessions/h1/tap-out", json!({})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CONFLICT);
            assert_eq!(body_json(response).await["error"], "invalid_transition");
        }

        #[tokio::test(start_paused = true)]
        async fn wait_timeout_answers_408() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/headlock/enter-headlock?timeout_secs=5",
                    json!({"session_id": "slow"}),
                ))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
            let body = body_json(response).await;
            assert_eq!(body["error"], "timed_out");
            assert_eq!(body["session_id"], "slow");
        }

        #[tokio::test]
        async fn continue_unknown_session_is_404() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/headlock/continue-headlock",
                    json!({"session_id": "ghost", "context": "done"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn unknown_fields_rejected() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/headlock/enter-headlock",
                    json!({"session": "typo"}),
                ))
                .await
                .unwrap();
            assert!(response.status().is_client_error());
        }

        #[tokio::test]
        async fn capacity_exceeded_is_503() {
            let (app, coordinator) = test_app_with(CoordinatorConfig::default().with_max_sessions(1));
            let mut events = coordinator.subscribe(Scope::Global);

            let _agent = tokio::spawn(
                app.clone()
                    .oneshot(post_json("/headlock/enter-headlock", json!({"session_id": "a"}))),
            );
            events.recv().await.unwrap();

            let response = app
                .oneshot(post_json("/headlock/enter-headlock", json!({"session_id": "b"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    mod controller_tests {
        use super::*;

        #[tokio::test]
        async fn instruct_unknown_session_is_404() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json("/sessions/nope/instruct", json!({"instruction": "x"})))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body = body_json(response).await;
            assert_eq!(body["error"], "not_found");
            assert_eq!(body["session_id"], "nope");
        }

        #[tokio::test]
        async fn list_rejects_unknown_state() {
            let (app, _) = test_app();
            let response = app.oneshot(get_request("/sessions?state=sleeping")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn list_filters_by_state() {
            let (app, coordinator) = test_app();
            let mut events = coordinator.subscribe(Scope::Global);

            let _agent = tokio::spawn(
                app.clone()
                    .oneshot(post_json("/headlock/enter-headlock", json!({"session_id": "w"}))),
            );
            events.recv().await.unwrap();

            let all = body_json(app.clone().oneshot(get_request("/sessions")).await.unwrap()).await;
            assert_eq!(all.as_array().unwrap().len(), 1);

            let processing =
                body_json(app.oneshot(get_request("/sessions?state=processing")).await.unwrap()).await;
            assert!(processing.as_array().unwrap().is_empty());
        }

        #[tokio::test]
        async fn delete_releases_agent() {
            let (app, coordinator) = test_app();
            let mut events = coordinator.subscribe(Scope::Global);

            let agent = tokio::spawn(
                app.clone()
                    .oneshot(post_json("/headlock/enter-headlock", json!({"session_id": "d"}))),
            );
            events.recv().await.unwrap();

            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri("/sessions/d")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let response = agent.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::GONE);

            let response = app.oneshot(get_request("/sessions/d")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    mod mcp_tests {
        use super::*;

        #[tokio::test]
        async fn initialize_over_http() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/mcp",
                    json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
                ))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["result"]["serverInfo"]["name"], "headlock");
            assert!(body["result"]["instructions"].as_str().is_some());
        }

        #[tokio::test]
        async fn notification_is_accepted() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/mcp",
                    json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        #[tokio::test]
        async fn tools_list_over_http() {
            let (app, _) = test_app();
            let response = app
                .oneshot(post_json(
                    "/mcp",
                    json!({"jsonrpc": "2.0", "id": "t", "method": "tools/list"}),
                ))
                .await
                .unwrap();

            let body = body_json(response).await;
            assert_eq!(body["id"], "t");
            assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 2);
        }

        #[tokio::test]
        async fn garbage_body_is_parse_error() {
            let (app, _) = test_app();
            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/mcp")
                        .body(Body::from("{not json"))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"]["code"], -32700);
        }
    }
}
