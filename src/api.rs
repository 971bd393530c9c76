use axum::{
    extract::{FromRef, Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::camera_manager::{DiscoveryRequest, RemoteCameraManager};
use crate::config::{CameraConfig, Config};
use crate::endpoint::AddressingFacts;
use crate::errors::StreamError;
use crate::websocket::{peer_handler, restream_handler};

#[derive(Clone)]
pub struct ApiState {
    pub manager: RemoteCameraManager,
    pub admin_token: Option<String>,
    /// Where API changes are persisted; `None` keeps them in memory only
    pub cameras_directory: Option<String>,
}

impl FromRef<ApiState> for RemoteCameraManager {
    fn from_ref(state: &ApiState) -> Self {
        state.manager.clone()
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(message, status.as_u16()))).into_response()
}

fn stream_error_response(e: &StreamError) -> Response {
    let status = match e {
        StreamError::NotFound { .. } => StatusCode::NOT_FOUND,
        StreamError::AlreadyExists { .. } => StatusCode::CONFLICT,
        StreamError::Config { .. } | StreamError::Discovery { .. } | StreamError::AddrParse { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

fn check_admin_token(headers: &HeaderMap, admin_token: &Option<String>) -> std::result::Result<(), Response> {
    let Some(expected_token) = admin_token else { return Ok(()) };
    let provided = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected_token => Ok(()),
        Some(_) => {
            warn!("Invalid Bearer token on admin request");
            Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
        None => Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized")),
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/cameras", post(api_add_camera))
        .route("/api/cameras/status", get(api_get_all_status))
        .route("/api/cameras/:id", delete(api_remove_camera))
        .route("/api/cameras/:id/status", get(api_get_status))
        .route("/api/cameras/:id/addressing", put(api_update_addressing))
        .route("/api/cameras/:id/retry", post(api_retry))
        .route("/api/discovery", post(api_discover))
        .route("/restream/:id", get(restream_handler))
        .route("/peer/:peer_id", get(peer_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct AddCameraRequest {
    pub camera_id: String,
    pub config: CameraConfig,
}

async fn api_add_camera(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<AddCameraRequest>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.admin_token) {
        return response;
    }

    let endpoint = match state.manager.add_camera(&body.camera_id, body.config.clone()).await {
        Ok(endpoint) => endpoint,
        Err(e) => return stream_error_response(&e),
    };

    if let Some(dir) = &state.cameras_directory {
        if let Err(e) = Config::save_camera_config(&body.camera_id, &body.config, dir) {
            warn!("Camera '{}' added but not persisted: {}", body.camera_id, e);
        }
    }

    info!("Camera '{}' added via API", body.camera_id);
    let status = state.manager.get_status(&body.camera_id).await;
    (StatusCode::CREATED, Json(ApiResponse::success(serde_json::json!({
        "camera": endpoint,
        "status": status,
    })))).into_response()
}

async fn api_remove_camera(
    State(state): State<ApiState>,
    headers: HeaderMap,
    AxumPath(camera_id): AxumPath<String>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.admin_token) {
        return response;
    }

    match state.manager.remove_camera(&camera_id).await {
        Ok(true) => {}
        Ok(false) => return stream_error_response(&StreamError::not_found(&camera_id)),
        Err(e) => return stream_error_response(&e),
    }

    if let Some(dir) = &state.cameras_directory {
        if let Err(e) = Config::delete_camera_config(&camera_id, dir) {
            warn!("Camera '{}' removed but its config file remains: {}", camera_id, e);
        }
    }

    info!("Camera '{}' removed via API", camera_id);
    Json(ApiResponse::success(serde_json::json!({ "camera_id": camera_id }))).into_response()
}

async fn api_get_all_status(State(state): State<ApiState>) -> Response {
    Json(ApiResponse::success(state.manager.get_all_status().await)).into_response()
}

async fn api_get_status(State(state): State<ApiState>, AxumPath(camera_id): AxumPath<String>) -> Response {
    match state.manager.get_status(&camera_id).await {
        Some(status) => Json(ApiResponse::success(status)).into_response(),
        None => stream_error_response(&StreamError::not_found(&camera_id)),
    }
}

async fn api_update_addressing(
    State(state): State<ApiState>,
    headers: HeaderMap,
    AxumPath(camera_id): AxumPath<String>,
    Json(facts): Json<AddressingFacts>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.admin_token) {
        return response;
    }

    if let Err(e) = state.manager.update_addressing(&camera_id, facts).await {
        return stream_error_response(&e);
    }

    if let (Some(dir), Some(config)) = (&state.cameras_directory, state.manager.get_config(&camera_id).await) {
        if let Err(e) = Config::save_camera_config(&camera_id, &config, dir) {
            warn!("Addressing of camera '{}' updated but not persisted: {}", camera_id, e);
        }
    }

    Json(ApiResponse::success(state.manager.get_endpoint(&camera_id).await)).into_response()
}

async fn api_retry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    AxumPath(camera_id): AxumPath<String>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.admin_token) {
        return response;
    }

    match state.manager.retry(&camera_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(ApiResponse::success(serde_json::json!({
            "camera_id": camera_id,
        })))).into_response(),
        Err(e) => stream_error_response(&e),
    }
}

async fn api_discover(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<DiscoveryRequest>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.admin_token) {
        return response;
    }

    match state.manager.discover(request).await {
        Ok(report) => {
            info!("Discovery found {} candidate(s), bound {}", report.candidates.len(), report.bound.len());
            Json(ApiResponse::success(report)).into_response()
        }
        Err(e) => stream_error_response(&e),
    }
}
