//! HTTP surface: the driver-facing API and the per-request lifecycle hook.
//!
//! Driver routes are mounted beside, never beneath, the hook. A `wait` call
//! wrapped by the hook would count itself as pending and never return.

pub mod driver;
pub mod middleware;
pub mod params;
pub mod probe;

pub use driver::{DRIVER_PREFIX, SESSION_COOKIE, SESSION_HEADER, driver_router};
pub use middleware::{BrowserSession, RequestLifecycleHook, lifecycle_middleware};

use crate::coordinator::SessionCoordinator;
use crate::core::SessionError;
use crate::host::RequestEnvironment;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Session(SessionError),
    Input(String),
    Forbidden(String),
    Internal(String),
}

impl From<SessionError> for WebError {
    fn from(err: SessionError) -> Self {
        WebError::Session(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::Session(err) => {
                let status = match &err {
                    SessionError::NotRunning(_) => StatusCode::CONFLICT,
                    SessionError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    SessionError::Io(_) => StatusCode::BAD_REQUEST,
                    SessionError::Provisioning(_) | SessionError::Connection(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    SessionError::Import { .. } | SessionError::Lock(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string(), err.code().to_string())
            }
            WebError::Input(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                msg,
                "input_error".to_string(),
            ),
            WebError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "forbidden".to_string()),
            WebError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                msg,
                "internal_error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

/// Wraps `host` in the lifecycle hook and mounts the driver API beside it.
pub fn app(
    coordinator: SessionCoordinator,
    environment: Arc<dyn RequestEnvironment>,
    host: Router,
) -> Router {
    let hook = Arc::new(RequestLifecycleHook::new(coordinator.clone(), environment));
    let host = host.layer(axum::middleware::from_fn_with_state(
        hook,
        lifecycle_middleware,
    ));

    Router::new()
        .merge(host)
        .nest(DRIVER_PREFIX, driver_router(coordinator))
        .layer(TraceLayer::new_for_http())
}
