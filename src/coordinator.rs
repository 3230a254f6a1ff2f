//! Session lifecycle: start, update, per-request apply, end.
//!
//! A [`SessionCoordinator`] is cheap to clone. Clones share their
//! collaborators and differ only in the session id they address, so one
//! process can serve any number of named sessions.

use crate::barrier::{BARRIER_TABLE, RequestBarrier};
use crate::config::TestSessionConfig;
use crate::core::{Result, SessionError, SessionState, merge_states, parse_datetime};
use crate::database::EphemeralDatabase;
use crate::host::{
    FixtureLoader, MailerRegistry, SchemaBuilder, ScriptSchemaBuilder, SessionExtension,
    YamlFixtureLoader,
};
use crate::storage::{AssetVault, FileStateStore, StateStore};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref SESSION_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
    static ref FIXTURE_PATH: Regex = Regex::new(r"^([^/.][^/]+)/tests/").unwrap();
}

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 10;

/// A `*.sql` dump offered as a database template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseTemplate {
    pub path: PathBuf,
    pub filename: String,
}

struct Services {
    config: TestSessionConfig,
    database: EphemeralDatabase,
    vault: AssetVault,
    mailers: MailerRegistry,
    fixtures: Box<dyn FixtureLoader>,
    schema: Box<dyn SchemaBuilder>,
    extensions: Vec<Arc<dyn SessionExtension>>,
}

pub struct CoordinatorBuilder {
    config: TestSessionConfig,
    mailers: MailerRegistry,
    fixtures: Box<dyn FixtureLoader>,
    schema: Option<Box<dyn SchemaBuilder>>,
    extensions: Vec<Arc<dyn SessionExtension>>,
}

impl CoordinatorBuilder {
    pub fn mailers(mut self, mailers: MailerRegistry) -> Self {
        self.mailers = mailers;
        self
    }

    pub fn fixture_loader(mut self, loader: impl FixtureLoader + 'static) -> Self {
        self.fixtures = Box::new(loader);
        self
    }

    pub fn schema_builder(mut self, builder: impl SchemaBuilder + 'static) -> Self {
        self.schema = Some(Box::new(builder));
        self
    }

    pub fn extension(mut self, extension: Arc<dyn SessionExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn build(self) -> Result<SessionCoordinator> {
        self.config
            .validate()
            .map_err(SessionError::InvalidArgument)?;

        let schema = self.schema.unwrap_or_else(|| {
            Box::new(ScriptSchemaBuilder::new(
                self.config.schema_script.clone(),
                self.config.default_records_script.clone(),
            ))
        });

        let services = Services {
            database: EphemeralDatabase::from_config(&self.config),
            vault: AssetVault::new(
                &self.config.assets_dir,
                &self.config.assets_backup_dir,
                &self.config.asset_ignore,
            ),
            config: self.config,
            mailers: self.mailers,
            fixtures: self.fixtures,
            schema,
            extensions: self.extensions,
        };

        Ok(SessionCoordinator {
            services: Arc::new(services),
            id: None,
        })
    }
}

#[derive(Clone)]
pub struct SessionCoordinator {
    services: Arc<Services>,
    id: Option<String>,
}

impl SessionCoordinator {
    pub fn builder(config: TestSessionConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            mailers: MailerRegistry::with_defaults(),
            fixtures: Box::new(YamlFixtureLoader),
            schema: None,
            extensions: Vec::new(),
        }
    }

    /// Coordinator with the default collaborators.
    pub fn new(config: TestSessionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// The same coordinator addressing session `id` (`None` is the global one).
    pub fn with_id(&self, id: Option<&str>) -> Result<Self> {
        let id = id.filter(|id| !id.is_empty());
        if let Some(id) = id {
            validate_session_id(id)?;
        }
        Ok(Self {
            services: Arc::clone(&self.services),
            id: id.map(str::to_string),
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn config(&self) -> &TestSessionConfig {
        &self.services.config
    }

    pub fn database(&self) -> &EphemeralDatabase {
        &self.services.database
    }

    pub fn vault(&self) -> &AssetVault {
        &self.services.vault
    }

    pub fn mailers(&self) -> &MailerRegistry {
        &self.services.mailers
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(self.services.config.state_path(self.id()))
    }

    pub fn is_running(&self) -> bool {
        self.store().exists()
    }

    pub fn get_state(&self) -> Result<SessionState> {
        self.store().read()
    }

    pub fn save_state(&self, state: &SessionState) -> Result<()> {
        self.store().write(state)
    }

    /// Starts a session, replacing any stale record for this id.
    pub fn start(&self, params: SessionState) -> Result<SessionState> {
        let store = self.store();
        if let Err(e) = store.delete() {
            warn!(file = %store.location(), error = %e, "could not remove stale state file");
        }

        let mut params = params;
        for extension in &self.services.extensions {
            extension.on_before_start(&mut params)?;
        }

        let state = self.apply_state(params)?;

        match self.services.vault.backup() {
            Ok(Some(report)) => debug!(files = report.files_moved, "assets backed up"),
            Ok(None) => debug!("asset backup already present"),
            Err(e) => {
                // Leave no half-started session behind.
                self.end()?;
                return Err(e);
            }
        }

        for extension in &self.services.extensions {
            extension.on_after_start(&state);
        }
        info!(
            session = self.id().unwrap_or("global"),
            database = state.database().unwrap_or_default(),
            "test session started"
        );
        Ok(state)
    }

    pub fn update(&self, params: SessionState) -> Result<SessionState> {
        self.require_running()?;

        let mut params = params;
        for extension in &self.services.extensions {
            extension.on_before_update(&mut params)?;
        }

        let state = self.apply_state(params)?;

        for extension in &self.services.extensions {
            extension.on_after_update(&state);
        }
        debug!(session = self.id().unwrap_or("global"), "test session updated");
        Ok(state)
    }

    /// Merges `incoming` over the stored record, makes sure the session's
    /// database exists and is selected, then persists the result.
    ///
    /// Nothing is written when validation fails.
    pub fn apply_state(&self, incoming: SessionState) -> Result<SessionState> {
        let mut incoming = incoming;
        for extension in &self.services.extensions {
            extension.on_before_apply(&mut incoming)?;
        }

        let existing = self.get_state()?;
        let mut state = merge_states(&existing, incoming);
        self.validate(&state)?;

        let running = self.is_running();
        let database = &self.services.database;

        if running {
            self.connect_to_database(&state)?;
        } else {
            let name = match state.database() {
                Some(name) if database.exists(name) => name.to_string(),
                Some(name) => {
                    database.create_named(name)?;
                    name.to_string()
                }
                None => database.create()?,
            };
            database.connect(&name)?;
            self.barrier_for(&name).initialize()?;
            state.set_database(name);
        }

        self.save_state(&state)?;

        for extension in &self.services.extensions {
            extension.on_after_apply(&state);
        }
        Ok(state)
    }

    /// Tears the session down. Calling it without a session is a no-op.
    ///
    /// Every step is best-effort so that redundant callers all converge on
    /// "no session".
    pub fn end(&self) -> Result<()> {
        if !self.is_running() {
            debug!(session = self.id().unwrap_or("global"), "no test session to end");
            return Ok(());
        }

        for extension in &self.services.extensions {
            extension.on_before_end();
        }

        if let Err(e) = self.services.vault.restore() {
            warn!(error = %e, "failed to restore assets");
        }

        let state = self.get_state().unwrap_or_else(|e| {
            warn!(error = %e, "could not read state while ending session");
            SessionState::new()
        });

        let database = &self.services.database;
        if let Some(name) = state.database().filter(|name| database.is_temp_name(name)) {
            // Another session may own the selection by now; leave it alone then.
            let selected = database.selected_database().as_deref() == Some(name);
            if database.exists(name) {
                if let Err(e) = database.drop_database(name) {
                    warn!(database = %name, error = %e, "failed to drop temp database");
                }
            }
            if selected {
                if let Err(e) = database.restore_default() {
                    warn!(error = %e, "failed to restore the default database");
                }
            }
        }

        let store = self.store();
        if let Err(e) = store.delete() {
            warn!(file = %store.location(), error = %e, "failed to remove state file");
        }

        for extension in &self.services.extensions {
            extension.on_after_end();
        }
        info!(session = self.id().unwrap_or("global"), "test session ended");
        Ok(())
    }

    /// Re-applies a record read at the start of a request, without
    /// provisioning anything.
    ///
    /// Returns `None` when the session ended in the meantime, so a request
    /// racing `end` never brings the session back.
    pub fn resume(&self, state: SessionState) -> Result<Option<SessionState>> {
        let Some(name) = state.database().map(str::to_string) else {
            return Ok(None);
        };
        if !self.is_running() || !self.services.database.exists(&name) {
            debug!(session = self.id().unwrap_or("global"), "session ended before the request applied it");
            return Ok(None);
        }
        self.validate(&state)?;

        if let Err(e) = self.services.database.connect(&name) {
            if !self.is_running() {
                return Ok(None);
            }
            return Err(e);
        }

        for extension in &self.services.extensions {
            extension.on_after_apply(&state);
        }
        Ok(Some(state))
    }

    /// Applies the persisted record at process boot, when a session is running.
    pub fn load_from_file(&self) -> Result<Option<SessionState>> {
        if !self.is_running() {
            return Ok(None);
        }

        self.get_state()
            .and_then(|state| self.apply_state(state))
            .map(Some)
            .map_err(|e| {
                SessionError::Io(format!(
                    "A test session appears to be in progress, but its details can't be applied. \
                     Try removing the {} file. Inner error: {}",
                    self.store().location(),
                    e
                ))
            })
    }

    /// Selects the session's database, reconnecting only when another one is
    /// selected.
    pub fn connect_to_database(&self, state: &SessionState) -> Result<()> {
        match state.database() {
            Some(name) => self.services.database.connect(name),
            None => Ok(()),
        }
    }

    /// Loads a fixture given relative to the base directory and logs it in
    /// the record's `fixtures` list.
    pub fn load_fixture(&self, fixture: &str) -> Result<usize> {
        self.require_running()?;
        let path = self.resolve_fixture(fixture)?;

        let name = self.session_database()?;
        let written = self
            .services
            .database
            .with_database(&name, |conn| self.services.fixtures.load(conn, &path))?;

        let mut state = self.get_state()?;
        state.push_fixture(fixture);
        self.apply_state(state)?;

        info!(fixture = %fixture, records = written, "fixture loaded");
        Ok(written)
    }

    pub fn import_database(&self, path: &Path, require_default_records: bool) -> Result<usize> {
        let name = self.session_database()?;
        self.services.database.import_dump(
            &name,
            path,
            self.services.schema.as_ref(),
            require_default_records,
        )
    }

    pub fn require_default_records(&self) -> Result<()> {
        let name = self.session_database()?;
        self.services
            .database
            .require_default_records(&name, self.services.schema.as_ref())
    }

    /// Empties every table of the session's database except the barrier.
    pub fn clear(&self) -> Result<usize> {
        let name = self.session_database()?;

        let database = &self.services.database;
        if !database.is_temp_name(&name) {
            return Ok(0);
        }
        let cleared = database.clear_all_data(&name, &[BARRIER_TABLE])?;
        info!(database = %name, tables = cleared, "cleared test database");
        Ok(cleared)
    }

    /// Merges `values` into the record's browser session snapshot.
    pub fn set_browser_session_state(&self, values: Map<String, Value>) -> Result<SessionState> {
        self.require_running()?;
        if values.is_empty() {
            return Err(SessionError::InvalidArgument(
                "No query parameters detected".to_string(),
            ));
        }

        let mut state = self.get_state()?;
        let mut session = state.session();
        session.extend(values);
        state.set_session(session);
        self.apply_state(state)
    }

    /// Barrier of the running session's database.
    pub fn barrier(&self) -> Result<RequestBarrier> {
        let state = self.get_state()?;
        match state.database() {
            Some(name) if self.is_running() => Ok(self.barrier_for(name)),
            _ => Err(SessionError::NotRunning(format!(
                "no session database at {}",
                self.store().location()
            ))),
        }
    }

    /// Waits until no request of this session is in flight and none finished
    /// within `quiet_ms`. Returns `false` on timeout.
    pub async fn wait_for_pending_requests(&self, quiet_ms: u64, timeout_ms: u64) -> Result<bool> {
        self.barrier()?.wait_for_idle(quiet_ms, timeout_ms).await
    }

    /// `*.sql` files in the configured templates directory, by file name.
    pub fn database_templates(&self) -> Result<Vec<DatabaseTemplate>> {
        let Some(dir) = self.services.config.templates_dir() else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            SessionError::Io(format!("Failed to list templates in {}: {}", dir.display(), e))
        })?;

        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SessionError::Io(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            templates.push(DatabaseTemplate {
                filename: entry.file_name().to_string_lossy().into_owned(),
                path,
            });
        }
        templates.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(templates)
    }

    pub fn resolve_template(&self, filename: &str) -> Result<PathBuf> {
        self.database_templates()?
            .into_iter()
            .find(|template| template.filename == filename)
            .map(|template| template.path)
            .ok_or_else(|| {
                SessionError::Io(format!("Database template '{}' not found", filename))
            })
    }

    fn validate(&self, state: &SessionState) -> Result<()> {
        if let Some(name) = state.database() {
            self.services.database.validate_name(name)?;
        }
        if let Some(raw) = state.datetime() {
            parse_datetime(raw)?;
        }
        if let Some(mailer) = state.mailer() {
            self.services.mailers.validate(mailer)?;
        }
        if let Some(stub) = state.stubfile() {
            validate_stubfile(stub)?;
        }
        Ok(())
    }

    fn require_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SessionError::NotRunning(format!(
                "no state file at {}",
                self.store().location()
            )))
        }
    }

    /// Name of the running session's database.
    fn session_database(&self) -> Result<String> {
        self.require_running()?;
        self.get_state()?
            .database()
            .map(str::to_string)
            .ok_or_else(|| {
                SessionError::NotRunning(format!(
                    "no session database at {}",
                    self.store().location()
                ))
            })
    }

    fn barrier_for(&self, database: &str) -> RequestBarrier {
        RequestBarrier::new(self.services.database.server().clone(), database)
    }

    fn resolve_fixture(&self, fixture: &str) -> Result<PathBuf> {
        let base_dir = self.services.config.base_dir.canonicalize().map_err(|e| {
            SessionError::Io(format!(
                "Base directory {} is not accessible: {}",
                self.services.config.base_dir.display(),
                e
            ))
        })?;

        let path = base_dir
            .join(fixture)
            .canonicalize()
            .ok()
            .filter(|path| path.is_file())
            .ok_or_else(|| SessionError::Io("Fixture file doesn't exist".to_string()))?;

        if !path.starts_with(&base_dir) {
            return Err(SessionError::Io(format!(
                "Fixture file must be inside {}",
                base_dir.display()
            )));
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("yml") {
            return Err(SessionError::Io("Fixture file must be a .yml file".to_string()));
        }
        if !FIXTURE_PATH.is_match(fixture) {
            return Err(SessionError::Io(
                "Fixture file must be inside the tests subfolder of one of your modules."
                    .to_string(),
            ));
        }
        Ok(path)
    }
}

pub fn validate_session_id(id: &str) -> Result<()> {
    if SESSION_ID.is_match(id) {
        Ok(())
    } else {
        Err(SessionError::InvalidArgument(format!(
            "Invalid session id '{}'",
            id
        )))
    }
}

/// Stub scripts resolve against the base directory and may not climb out of it.
fn validate_stubfile(stub: &str) -> Result<()> {
    let escapes = Path::new(stub)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if stub.trim().is_empty() || escapes {
        return Err(SessionError::InvalidArgument(format!(
            "Invalid stub file path '{}'",
            stub
        )));
    }
    Ok(())
}

pub fn generate_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}
