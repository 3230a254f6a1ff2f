//! Minimal host routes served by `testsession serve`.
//!
//! They read the process clock, mail transport and browser session exactly
//! as application code would, which lets a driver observe that session state
//! reaches request handlers.

use crate::host::{MailMessage, ProcessEnvironment};
use crate::web::{BrowserSession, Result, WebError};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const PROBE_PREFIX: &str = "/__testsession";

pub fn probe_router(environment: Arc<ProcessEnvironment>) -> Router {
    Router::new()
        .route(&format!("{}/now", PROBE_PREFIX), get(now))
        .route(&format!("{}/mail", PROBE_PREFIX), post(send_mail))
        .route(
            &format!("{}/session", PROBE_PREFIX),
            get(read_session).post(write_session),
        )
        .with_state(environment)
}

async fn now(State(environment): State<Arc<ProcessEnvironment>>) -> Json<Value> {
    Json(json!({
        "now": environment.now().format(crate::core::DATETIME_FORMAT).to_string(),
        "mocked": environment.mock_now().is_some(),
    }))
}

async fn send_mail(
    State(environment): State<Arc<ProcessEnvironment>>,
    Json(message): Json<MailMessage>,
) -> Result<StatusCode> {
    let mailer = environment
        .mailer()
        .ok_or_else(|| WebError::Internal("no mail transport configured".to_string()))?;
    mailer.send(&message)?;
    Ok(StatusCode::ACCEPTED)
}

async fn read_session(Extension(session): Extension<BrowserSession>) -> Json<Map<String, Value>> {
    Json(session.snapshot())
}

async fn write_session(
    Extension(session): Extension<BrowserSession>,
    Json(values): Json<Map<String, Value>>,
) -> Json<Map<String, Value>> {
    for (key, value) in values {
        session.insert(key, value);
    }
    Json(session.snapshot())
}
