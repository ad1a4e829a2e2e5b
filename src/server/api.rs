use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::controller::{OverrideDecision, RunController};
use crate::errors::ProtocolError;
use crate::models::{RunInput, Session, Transition, Verdict};
use crate::stage::Stage;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: Arc<RunController>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub repo_path: String,
    pub target_module: Option<String>,
    /// Caller-supplied session id; collides with an existing run → 409.
    pub id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum OverrideRequest {
    Proceed { approved_by: String },
    Abort { reason: String },
    Rerun { approved_by: String },
}

impl From<OverrideRequest> for OverrideDecision {
    fn from(req: OverrideRequest) -> Self {
        match req {
            OverrideRequest::Proceed { approved_by } => Self::Proceed { approved_by },
            OverrideRequest::Abort { reason } => Self::Abort { reason },
            OverrideRequest::Rerun { approved_by } => Self::Rerun { approved_by },
        }
    }
}

#[derive(Deserialize)]
pub struct AcceptDriftRequest {
    pub test_name: String,
}

#[derive(Serialize)]
pub struct TransitionsResponse {
    pub session_id: String,
    pub transitions: Vec<Transition>,
}

#[derive(Serialize)]
pub struct VerdictResponse {
    pub verdict: Verdict,
    /// Prior verdicts, oldest first, including the current one.
    pub history: Vec<Verdict>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        let msg = err.to_string();
        match err {
            ProtocolError::SessionExists(_)
            | ProtocolError::NotHeld { .. }
            | ProtocolError::AlreadyTerminal { .. }
            | ProtocolError::CriticalDrift { .. } => ApiError::Conflict(msg),
            ProtocolError::SessionNotFound(_)
            | ProtocolError::ArtifactNotFound { .. }
            | ProtocolError::NoVerdict(_)
            | ProtocolError::DriftNotFound { .. } => ApiError::NotFound(msg),
            ProtocolError::BadRequest(_) => ApiError::BadRequest(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/transitions", get(get_transitions))
        .route("/api/runs/{id}/override", post(override_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/artifacts/{stage}", get(get_artifact))
        .route("/api/runs/{id}/verdict", get(get_verdict))
        .route("/api/runs/{id}/drifts/accept", post(accept_drift))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    if req.repo_path.trim().is_empty() {
        return Err(ApiError::BadRequest("repo_path must not be empty".into()));
    }
    let input = RunInput { repo_path: req.repo_path, target_module: req.target_module };
    let session = state.controller.start(input, req.id)?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.controller.snapshot(&id)?))
}

async fn get_transitions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<TransitionsResponse>, ApiError> {
    let transitions = state.controller.transitions(&id)?;
    Ok(Json(TransitionsResponse { session_id: id, transitions }))
}

async fn override_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.controller.override_run(&id, req.into())?))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.controller.cancel(&id)?))
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((id, stage)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let stage = Stage::from_str(&stage)
        .map_err(|_| ApiError::BadRequest(format!("Unknown stage: {}", stage)))?;
    let artifact = state.controller.artifact(&id, stage)?;
    Ok(Json(artifact).into_response())
}

async fn get_verdict(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<VerdictResponse>, ApiError> {
    let verdict = state.controller.verdict(&id)?;
    let history = state.controller.verdict_history(&id)?;
    Ok(Json(VerdictResponse { verdict, history }))
}

async fn accept_drift(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AcceptDriftRequest>,
) -> Result<Json<Verdict>, ApiError> {
    Ok(Json(state.controller.accept_drift(&id, &req.test_name)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::executor::{SimProfile, SimulatedExecutor};
    use crate::gate::NoHistory;

    fn test_state(profile: SimProfile) -> SharedState {
        let controller = Arc::new(RunController::new(
            Arc::new(SimulatedExecutor::new(profile)),
            Arc::new(NoHistory),
            Config::default(),
        ));
        Arc::new(AppState { controller })
    }

    fn test_router(profile: SimProfile) -> Router {
        api_router().with_state(test_state(profile))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_router(SimProfile::default());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_returns_created_session() {
        let app = test_router(SimProfile::default());
        let resp = app
            .oneshot(post_json("/api/runs", serde_json::json!({"repo_path": "/repos/billing"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session = json_body(resp).await;
        assert_eq!(session["status"], "running");
        assert_eq!(session["stage_pointer"], 0);
        assert!(session["id"].as_str().is_some());
    }

    #[tokio::test]
    async fn create_run_rejects_empty_path() {
        let app = test_router(SimProfile::default());
        let resp = app
            .oneshot(post_json("/api/runs", serde_json::json!({"repo_path": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let state = test_state(SimProfile::default());
        let body = serde_json::json!({"repo_path": "/repos/billing", "id": "fixed-id"});

        let app = api_router().with_state(Arc::clone(&state));
        let resp = app.oneshot(post_json("/api/runs", body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let app = api_router().with_state(state);
        let resp = app.oneshot(post_json("/api/runs", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let app = test_router(SimProfile::default());
        let req = Request::builder().uri("/api/runs/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn transitions_endpoint_returns_the_log() {
        // A stage delay keeps the run alive while we read.
        let profile =
            SimProfile { stage_delay: Some(Duration::from_millis(100)), ..SimProfile::default() };
        let state = test_state(profile);
        let session = state
            .controller
            .start(RunInput { repo_path: "/repos/billing".into(), target_module: None }, None)
            .unwrap();

        let app = api_router().with_state(Arc::clone(&state));
        let uri = format!("/api/runs/{}/transitions", session.id);
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["session_id"], session.id);
        assert!(body["transitions"].is_array());

        state.controller.cancel(&session.id).unwrap();
    }

    #[tokio::test]
    async fn override_on_running_run_conflicts() {
        let profile =
            SimProfile { stage_delay: Some(Duration::from_millis(200)), ..SimProfile::default() };
        let state = test_state(profile);
        let session = state
            .controller
            .start(RunInput { repo_path: "/repos/billing".into(), target_module: None }, None)
            .unwrap();

        let app = api_router().with_state(Arc::clone(&state));
        let uri = format!("/api/runs/{}/override", session.id);
        let body = serde_json::json!({"decision": "proceed", "approved_by": "reviewer"});
        let resp = app.oneshot(post_json(&uri, body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        state.controller.cancel(&session.id).unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_is_404_and_bad_stage_is_400() {
        let profile =
            SimProfile { stage_delay: Some(Duration::from_millis(200)), ..SimProfile::default() };
        let state = test_state(profile);
        let session = state
            .controller
            .start(RunInput { repo_path: "/repos/billing".into(), target_module: None }, None)
            .unwrap();

        let app = api_router().with_state(Arc::clone(&state));
        let uri = format!("/api/runs/{}/artifacts/validation", session.id);
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let app = api_router().with_state(Arc::clone(&state));
        let uri = format!("/api/runs/{}/artifacts/not_a_stage", session.id);
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        state.controller.cancel(&session.id).unwrap();
    }

    #[tokio::test]
    async fn verdict_before_completion_is_404() {
        let profile =
            SimProfile { stage_delay: Some(Duration::from_millis(200)), ..SimProfile::default() };
        let state = test_state(profile);
        let session = state
            .controller
            .start(RunInput { repo_path: "/repos/billing".into(), target_module: None }, None)
            .unwrap();

        let app = api_router().with_state(Arc::clone(&state));
        let uri = format!("/api/runs/{}/verdict", session.id);
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        state.controller.cancel(&session.id).unwrap();
    }

    #[tokio::test]
    async fn cancel_then_cancel_again_conflicts() {
        let profile =
            SimProfile { stage_delay: Some(Duration::from_millis(200)), ..SimProfile::default() };
        let state = test_state(profile);
        let session = state
            .controller
            .start(RunInput { repo_path: "/repos/billing".into(), target_module: None }, None)
            .unwrap();

        let uri = format!("/api/runs/{}/cancel", session.id);
        let app = api_router().with_state(Arc::clone(&state));
        let resp = app
            .oneshot(Request::builder().method("POST").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "cancelled");

        let app = api_router().with_state(state);
        let resp = app
            .oneshot(Request::builder().method("POST").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
