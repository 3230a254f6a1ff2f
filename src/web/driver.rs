//! Driver-facing API, mounted at [`DRIVER_PREFIX`].
//!
//! - `POST /start`, `POST /set`, `POST /end`, `POST /clear`
//! - `POST /browsersessionstate`
//! - `GET /state`, `GET /wait`, `GET /templates`
//!
//! Parameters come from the query string and, for `POST`, an optional JSON
//! object body (body keys win).

use crate::barrier::{DEFAULT_QUIET_MS, DEFAULT_TIMEOUT_MS};
use crate::coordinator::{SessionCoordinator, generate_session_id, validate_session_id};
use crate::core::{SessionError, SessionState};
use crate::web::params::{SessionCommands, normalize_params};
use crate::web::{Result, WebError};
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

pub const DRIVER_PREFIX: &str = "/dev/testsession";
pub const SESSION_COOKIE: &str = "testsession_id";
pub const SESSION_HEADER: &str = "x-test-session-id";

pub fn driver_router(coordinator: SessionCoordinator) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/set", post(set))
        .route("/end", post(end))
        .route("/clear", post(clear))
        .route("/browsersessionstate", post(browser_session_state))
        .route("/state", get(state))
        .route("/wait", get(wait))
        .route("/templates", get(templates))
        .route_layer(axum::middleware::from_fn_with_state(
            coordinator.clone(),
            deny_live,
        ))
        .with_state(coordinator)
}

/// Session id from the `X-Test-Session-Id` header, else the session cookie.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_session_id(headers).or_else(|| cookie_session_id(headers))
}

/// Like [`session_id_from_headers`], but a malformed cookie id counts as no
/// session. Browsers keep stale cookies around; only an explicit header is
/// worth failing the page for.
pub fn host_session_id(headers: &HeaderMap) -> Option<String> {
    header_session_id(headers).or_else(|| {
        cookie_session_id(headers).filter(|id| match validate_session_id(id) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "ignoring session cookie");
                false
            }
        })
    })
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn cookie_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn deny_live(
    State(coordinator): State<SessionCoordinator>,
    request: Request,
    next: Next,
) -> Response {
    if coordinator.config().environment.is_live() {
        return WebError::Forbidden("Test sessions are disabled in live environments".to_string())
            .into_response();
    }
    next.run(request).await
}

fn scoped(coordinator: &SessionCoordinator, headers: &HeaderMap) -> Result<SessionCoordinator> {
    Ok(coordinator.with_id(session_id_from_headers(headers).as_deref())?)
}

fn request_params(query: Map<String, Value>, body: &Bytes) -> Result<Map<String, Value>> {
    let mut params = query;
    if !body.iter().all(u8::is_ascii_whitespace) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => params.extend(fields),
            Ok(_) => return Err(WebError::Input("request body must be a JSON object".to_string())),
            Err(e) => return Err(WebError::Input(format!("invalid JSON body: {}", e))),
        }
    }
    Ok(normalize_params(params))
}

fn session_cookie(id: Option<&str>) -> HeaderValue {
    let cookie = match id {
        Some(id) => format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, id),
        None => format!("{}=; Path=/; Max-Age=0", SESSION_COOKIE),
    };
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("testsession_id=; Path=/"))
}

/// Runs the one-shot commands of a start or set call against `session`.
fn run_commands(session: &SessionCoordinator, commands: &SessionCommands) -> Result<()> {
    let dump = match (&commands.import_database_path, &commands.import_database_filename) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(filename)) => Some(session.resolve_template(filename)?),
        (None, None) => None,
    };

    if let Some(path) = dump {
        session.import_database(&path, commands.require_default_records)?;
    } else if commands.require_default_records {
        session.require_default_records()?;
    }

    if let Some(fixture) = &commands.fixture {
        session.load_fixture(fixture)?;
    }
    Ok(())
}

async fn start(
    State(coordinator): State<SessionCoordinator>,
    Query(query): Query<Map<String, Value>>,
    body: Bytes,
) -> Result<Response> {
    let mut params = request_params(query, &body)?;
    let commands = SessionCommands::extract(&mut params);

    let id = if commands.global_session {
        None
    } else {
        Some(generate_session_id())
    };
    let session = coordinator.with_id(id.as_deref())?;
    session.start(SessionState::from_map(params))?;

    if let Err(e) = run_commands(&session, &commands) {
        session.end()?;
        return Err(e);
    }

    let state = session.get_state()?;
    info!(session = id.as_deref().unwrap_or("global"), "driver started session");
    Ok((
        [(SET_COOKIE, session_cookie(id.as_deref()))],
        Json(json!({ "id": id, "state": state })),
    )
        .into_response())
}

async fn set(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
    Query(query): Query<Map<String, Value>>,
    body: Bytes,
) -> Result<Json<SessionState>> {
    let session = scoped(&coordinator, &headers)?;
    let mut params = request_params(query, &body)?;
    let commands = SessionCommands::extract(&mut params);

    session.update(SessionState::from_map(params))?;
    run_commands(&session, &commands)?;
    Ok(Json(session.get_state()?))
}

async fn end(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
) -> Result<Response> {
    let session = scoped(&coordinator, &headers)?;
    if !session.is_running() {
        return Err(WebError::Session(SessionError::NotRunning(
            "No test session in progress.".to_string(),
        )));
    }
    session.end()?;

    Ok((
        [(SET_COOKIE, session_cookie(None))],
        Json(json!({ "ended": true })),
    )
        .into_response())
}

async fn clear(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let cleared = scoped(&coordinator, &headers)?.clear()?;
    Ok(Json(json!({ "cleared_tables": cleared })))
}

async fn browser_session_state(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
    Query(query): Query<Map<String, Value>>,
    body: Bytes,
) -> Result<Json<SessionState>> {
    let session = scoped(&coordinator, &headers)?;
    let values = request_params(query, &body)?;
    Ok(Json(session.set_browser_session_state(values)?))
}

async fn state(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
) -> Result<Json<SessionState>> {
    Ok(Json(scoped(&coordinator, &headers)?.get_state()?))
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(default = "default_quiet")]
    quiet_ms: u64,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
}

fn default_quiet() -> u64 {
    DEFAULT_QUIET_MS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

async fn wait(
    State(coordinator): State<SessionCoordinator>,
    headers: HeaderMap,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Value>> {
    let session = scoped(&coordinator, &headers)?;
    let idle = session
        .wait_for_pending_requests(query.quiet_ms, query.timeout_ms)
        .await?;
    Ok(Json(json!({ "idle": idle })))
}

async fn templates(State(coordinator): State<SessionCoordinator>) -> Result<Json<Value>> {
    let templates = coordinator.database_templates()?;
    Ok(Json(json!({ "templates": templates })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_prefers_header_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("other=1; testsession_id=fromcookie"));
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("fromcookie"));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("fromheader"));
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("fromheader"));
    }

    #[test]
    fn test_host_session_id_ignores_malformed_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("testsession_id=bad.id"));
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("bad.id"));
        assert_eq!(host_session_id(&headers), None);

        headers.insert(COOKIE, HeaderValue::from_static("testsession_id=abc123"));
        assert_eq!(host_session_id(&headers).as_deref(), Some("abc123"));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("bad.id"));
        assert_eq!(host_session_id(&headers).as_deref(), Some("bad.id"));
    }

    #[test]
    fn test_no_session_id() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("testsession_id="));
        assert_eq!(session_id_from_headers(&headers), None);
    }
}
