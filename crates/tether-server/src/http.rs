//! REST surface: session create/join/get, health, metrics.
//!
//! REST joins flow through the coordinator, so WebSocket-connected
//! participants are notified exactly as with a `REGISTER_CLIENT` frame.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tether_core::errors::SignalError;
use tether_core::ids::{DeviceId, SessionId};
use tether_core::session::{CreateSessionRequest, SessionDto};

use crate::state::AppState;
use crate::ws;

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/join", post(join_session))
        .route("/ws", any(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `SignalError` with its HTTP mapping.
pub struct ApiError(pub SignalError);

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SignalError::NotFound(_) | SignalError::UnknownSession(_) => StatusCode::NOT_FOUND,
            SignalError::DeviceBusy(_)
            | SignalError::AlreadyFull(_)
            | SignalError::SessionNotActive(_) => StatusCode::CONFLICT,
            SignalError::PasswordMismatch | SignalError::NotAParticipant { .. } => {
                StatusCode::FORBIDDEN
            }
            SignalError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            SignalError::ConnectionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(self.0.to_payload())).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> String {
    crate::metrics::render(&state.metrics)
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionDto>, ApiError> {
    let session = state
        .coordinator
        .create_session(&request.host_device_id, request.password.as_deref())?;
    Ok(Json(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionDto>, ApiError> {
    let session_id = SessionId::from(id.as_str());
    state
        .coordinator
        .get_session(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError(SignalError::NotFound(session_id)))
}

/// Join body; the session id comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    client_device_id: DeviceId,
    #[serde(default)]
    password: Option<String>,
}

async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<JoinBody>,
) -> Result<Json<SessionDto>, ApiError> {
    let session = state.coordinator.join_session(
        &SessionId::from(id.as_str()),
        &body.client_device_id,
        body.password.as_deref(),
    )?;
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::envelope::ErrorPayload;

    fn payload_of(err: SignalError) -> ErrorPayload {
        err.to_payload()
    }

    #[test]
    fn error_payload_reaches_the_wire_shape() {
        let payload = payload_of(SignalError::PasswordMismatch);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], "PASSWORD_MISMATCH");
        assert!(value["message"].as_str().is_some());
    }

    #[test]
    fn join_body_parses_without_password() {
        let body: JoinBody = serde_json::from_str(r#"{"clientDeviceId":"dev_b"}"#).unwrap();
        assert_eq!(body.client_device_id, DeviceId::from("dev_b"));
        assert!(body.password.is_none());
    }
}
