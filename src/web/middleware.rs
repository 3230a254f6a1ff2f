//! Per-request hook applying a running session to the host process.
//!
//! On entry the stored record is re-applied (database selection, mock clock,
//! mail transport, stub script) and the barrier is bumped. On exit the
//! browser session snapshot is written back and the barrier released. The
//! release is owned by a guard, so it also happens when the handler fails or
//! its future is dropped.

use crate::barrier::BarrierGuard;
use crate::coordinator::SessionCoordinator;
use crate::core::{Result, SessionError, SessionState};
use crate::host::RequestEnvironment;
use crate::web::WebError;
use crate::web::driver::host_session_id;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// The browser's session key/value store for the current request.
///
/// Handlers reach it as an `Extension<BrowserSession>`; changes are persisted
/// into the record's `session` field when the request finishes.
#[derive(Debug, Clone, Default)]
pub struct BrowserSession {
    values: Arc<Mutex<Map<String, Value>>>,
}

impl BrowserSession {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A request running inside a session.
pub struct ActiveRequest {
    session: SessionCoordinator,
    browser: BrowserSession,
    _guard: BarrierGuard,
}

impl ActiveRequest {
    pub fn browser_session(&self) -> &BrowserSession {
        &self.browser
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }
}

pub struct RequestLifecycleHook {
    coordinator: SessionCoordinator,
    environment: Arc<dyn RequestEnvironment>,
}

impl RequestLifecycleHook {
    pub fn new(coordinator: SessionCoordinator, environment: Arc<dyn RequestEnvironment>) -> Self {
        Self {
            coordinator,
            environment,
        }
    }

    /// Applies the session addressed by `session_id`, if one is running.
    pub fn enter(&self, session_id: Option<&str>) -> Result<Option<ActiveRequest>> {
        let session = self.coordinator.with_id(session_id)?;
        if !session.is_running() {
            self.reset_environment();
            return Ok(None);
        }

        let Some(state) = session.resume(session.get_state()?)? else {
            self.reset_environment();
            return Ok(None);
        };
        let guard = match session.barrier().and_then(|barrier| barrier.enter()) {
            Ok(guard) => guard,
            Err(_) if !session.is_running() => {
                self.reset_environment();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.apply_environment(&session, &state)?;

        Ok(Some(ActiveRequest {
            browser: BrowserSession::new(state.session()),
            session,
            _guard: guard,
        }))
    }

    /// Persists the browser session snapshot. The barrier is released when
    /// `request` drops at the end of this call.
    pub fn finish(&self, request: ActiveRequest) -> Result<()> {
        let mut state = request.session.get_state()?;
        state.set_session(request.browser.snapshot());

        // Only `session` left means the record was removed mid-request.
        if state.len() <= 1 {
            return Ok(());
        }
        request.session.save_state(&state)
    }

    fn apply_environment(&self, session: &SessionCoordinator, state: &SessionState) -> Result<()> {
        self.environment.set_mock_now(state.mock_now());

        let mailer = match state.mailer() {
            Some(name) => Some(session.mailers().resolve(name)?),
            None => None,
        };
        self.environment.set_mailer(mailer);

        if let (Some(stub), Some(name)) = (state.stubfile(), state.database()) {
            let path = session.config().base_dir.join(stub);
            if !self.environment.is_live() && path.is_file() {
                let count = session.database().run_script(name, &path)?;
                debug!(stub = %path.display(), statements = count, "stub script applied");
            }
        }
        Ok(())
    }

    fn reset_environment(&self) {
        self.environment.set_mock_now(None);
        self.environment.set_mailer(None);
    }
}

/// axum middleware running [`RequestLifecycleHook`] around host routes.
pub async fn lifecycle_middleware(
    State(hook): State<Arc<RequestLifecycleHook>>,
    mut request: Request,
    next: Next,
) -> Response {
    let session_id = host_session_id(request.headers());

    let active = match hook.enter(session_id.as_deref()) {
        Ok(active) => active,
        Err(e) => return lifecycle_error(e),
    };

    let Some(active) = active else {
        request.extensions_mut().insert(BrowserSession::default());
        return next.run(request).await;
    };

    request
        .extensions_mut()
        .insert(active.browser_session().clone());
    let response = next.run(request).await;

    if let Err(e) = hook.finish(active) {
        warn!(error = %e, "failed to persist test session state after request");
    }
    response
}

fn lifecycle_error(err: SessionError) -> Response {
    warn!(error = %err, "test session could not be applied to request");
    WebError::Session(err).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestSessionConfig;
    use crate::host::ProcessEnvironment;
    use serde_json::json;
    use tempfile::TempDir;

    fn hook(temp: &TempDir) -> (RequestLifecycleHook, SessionCoordinator, Arc<ProcessEnvironment>) {
        let coordinator = SessionCoordinator::new(TestSessionConfig::new(temp.path())).unwrap();
        let environment = Arc::new(ProcessEnvironment::default());
        (
            RequestLifecycleHook::new(coordinator.clone(), environment.clone()),
            coordinator,
            environment,
        )
    }

    #[test]
    fn test_enter_without_session_passes_through() {
        let temp = TempDir::new().unwrap();
        let (hook, _, environment) = hook(&temp);
        assert!(hook.enter(None).unwrap().is_none());
        assert!(environment.mock_now().is_none());
    }

    #[test]
    fn test_enter_applies_clock_and_mailer() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, environment) = hook(&temp);
        coordinator
            .start(
                SessionState::from_value(json!({
                    "datetime": "2019-03-14 00:00:00",
                    "mailer": "TestMailer"
                }))
                .unwrap(),
            )
            .unwrap();

        let active = hook.enter(None).unwrap().unwrap();
        assert_eq!(
            environment.mock_now().unwrap().to_string(),
            "2019-03-14 00:00:00"
        );
        assert!(environment.mailer().is_some());
        assert_eq!(coordinator.barrier().unwrap().read().unwrap().pending_requests, 1);

        hook.finish(active).unwrap();
        assert_eq!(coordinator.barrier().unwrap().read().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_finish_persists_browser_session() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, _) = hook(&temp);
        coordinator.start(SessionState::new()).unwrap();

        let active = hook.enter(None).unwrap().unwrap();
        active.browser_session().insert("loggedInAs", 7);
        hook.finish(active).unwrap();

        assert_eq!(
            coordinator.get_state().unwrap().session().get("loggedInAs"),
            Some(&json!(7))
        );
    }

    #[test]
    fn test_finish_does_not_resurrect_ended_session() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, _) = hook(&temp);
        coordinator.start(SessionState::new()).unwrap();

        let active = hook.enter(None).unwrap().unwrap();
        coordinator.end().unwrap();
        hook.finish(active).unwrap();

        assert!(!coordinator.is_running());
    }

    #[test]
    fn test_stub_script_runs_against_session_database() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, _) = hook(&temp);
        std::fs::write(
            temp.path().join("stub.sql"),
            "CREATE TABLE IF NOT EXISTS Stubbed (n INTEGER);\nINSERT INTO Stubbed VALUES (1);\n",
        )
        .unwrap();
        coordinator
            .start(SessionState::from_value(json!({"stubfile": "stub.sql"})).unwrap())
            .unwrap();

        let active = hook.enter(None).unwrap().unwrap();
        hook.finish(active).unwrap();

        let name = coordinator.get_state().unwrap().database().unwrap().to_string();
        let rows: i64 = coordinator
            .database()
            .with_database(&name, |conn| {
                conn.query_row("SELECT COUNT(*) FROM Stubbed", [], |row| row.get(0))
                    .map_err(|e| SessionError::Connection(e.to_string()))
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_enter_after_end_leaves_session_ended() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, environment) = hook(&temp);
        let session = coordinator.with_id(Some("gone")).unwrap();
        let state = session
            .start(SessionState::from_value(json!({"datetime": "2019-03-14 00:00:00"})).unwrap())
            .unwrap();
        let name = state.database().unwrap().to_string();
        session.end().unwrap();

        assert!(hook.enter(Some("gone")).unwrap().is_none());
        assert!(!session.is_running());
        assert!(!coordinator.database().exists(&name));
        assert!(environment.mock_now().is_none());
    }

    #[test]
    fn test_failed_entry_releases_barrier() {
        let temp = TempDir::new().unwrap();
        let (hook, coordinator, _) = hook(&temp);
        std::fs::write(temp.path().join("broken.sql"), "INSERT INTO nowhere VALUES (1);\n").unwrap();
        coordinator
            .start(SessionState::from_value(json!({"stubfile": "broken.sql"})).unwrap())
            .unwrap();

        assert!(matches!(hook.enter(None), Err(SessionError::Import { .. })));
        assert_eq!(coordinator.barrier().unwrap().read().unwrap().pending_requests, 0);
    }
}
