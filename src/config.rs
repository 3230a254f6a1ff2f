use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Runtime mode of the host application.
///
/// Test sessions are refused in `Live`, and stub files never run there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvironmentMode {
    #[default]
    Dev,
    Test,
    Live,
}

impl EnvironmentMode {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl FromStr for EnvironmentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "live" | "production" | "prod" => Ok(Self::Live),
            other => Err(format!("Unknown environment mode '{}'", other)),
        }
    }
}

/// Test session configuration
///
/// Every path defaults relative to `base_dir`, the web root shared by the
/// driver and the server processes.
#[derive(Debug, Clone)]
pub struct TestSessionConfig {
    /// Web root; state files and fixture paths resolve against it
    pub base_dir: PathBuf,

    /// State file name used by the global session
    pub state_file: String,

    /// State file template for named sessions, `%s` is the session id
    pub state_id_file: String,

    /// Directory holding one SQLite file per database
    pub data_dir: PathBuf,

    /// Prefix of every ephemeral database name
    pub database_prefix: String,

    /// Database the process uses outside of a test session
    pub default_database: Option<String>,

    /// Watched asset tree
    pub assets_dir: PathBuf,

    /// Where assets are parked while a session runs
    pub assets_backup_dir: PathBuf,

    /// File names never moved out of the asset tree
    pub asset_ignore: Vec<String>,

    /// Folder of `*.sql` dumps offered as database templates
    pub database_templates_path: Option<PathBuf>,

    /// Script run by the schema reconciliation pass
    pub schema_script: Option<PathBuf>,

    /// Script run when default records are requested
    pub default_records_script: Option<PathBuf>,

    pub environment: EnvironmentMode,

    /// How long a connection waits on a locked database file
    pub busy_timeout: Duration,
}

impl TestSessionConfig {
    /// Create a configuration rooted at `base_dir`
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            data_dir: base_dir.join(".testsession").join("databases"),
            assets_dir: base_dir.join("assets"),
            assets_backup_dir: base_dir.join("assets_backup"),
            base_dir,
            state_file: "TESTS_RUNNING.json".to_string(),
            state_id_file: "TESTS_RUNNING-%s.json".to_string(),
            database_prefix: "ss_".to_string(),
            default_database: None,
            asset_ignore: vec![
                ".htaccess".to_string(),
                "web.config".to_string(),
                ".protected".to_string(),
            ],
            database_templates_path: None,
            schema_script: None,
            default_records_script: None,
            environment: EnvironmentMode::Dev,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Overlay `TESTSESSION_*` and `SS_DATABASE_PREFIX` environment variables
    pub fn from_env() -> Self {
        let base_dir = std::env::var_os("TESTSESSION_BASE_DIR")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::new(base_dir);

        if let Some(value) = env_string("TESTSESSION_STATE_FILE") {
            config.state_file = value;
        }
        if let Some(value) = env_string("TESTSESSION_STATE_ID_FILE") {
            config.state_id_file = value;
        }
        if let Some(value) = env_string("TESTSESSION_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("SS_DATABASE_PREFIX") {
            config.database_prefix = value;
        }
        if let Some(value) = env_string("TESTSESSION_DATABASE") {
            config.default_database = Some(value);
        }
        if let Some(value) = env_string("TESTSESSION_ASSETS_DIR") {
            config.assets_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("TESTSESSION_ASSETS_BACKUP_DIR") {
            config.assets_backup_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("TESTSESSION_TEMPLATES_PATH") {
            config.database_templates_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_string("TESTSESSION_SCHEMA_SCRIPT") {
            config.schema_script = Some(PathBuf::from(value));
        }
        if let Some(value) = env_string("TESTSESSION_DEFAULTS_SCRIPT") {
            config.default_records_script = Some(PathBuf::from(value));
        }
        if let Some(mode) = env_string("TESTSESSION_ENV").and_then(|v| v.parse().ok()) {
            config.environment = mode;
        }

        config
    }

    pub fn state_file(mut self, name: &str) -> Self {
        self.state_file = name.to_string();
        self
    }

    pub fn state_id_file(mut self, template: &str) -> Self {
        self.state_id_file = template.to_string();
        self
    }

    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn database_prefix(mut self, prefix: &str) -> Self {
        self.database_prefix = prefix.to_string();
        self
    }

    pub fn default_database(mut self, name: &str) -> Self {
        self.default_database = Some(name.to_string());
        self
    }

    pub fn assets_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.assets_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn assets_backup_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.assets_backup_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn asset_ignore(mut self, names: &[&str]) -> Self {
        self.asset_ignore = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn database_templates_path(mut self, dir: impl AsRef<Path>) -> Self {
        self.database_templates_path = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn schema_script(mut self, path: impl AsRef<Path>) -> Self {
        self.schema_script = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn default_records_script(mut self, path: impl AsRef<Path>) -> Self {
        self.default_records_script = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn environment(mut self, mode: EnvironmentMode) -> Self {
        self.environment = mode;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Absolute path of the state file for `session_id`
    pub fn state_path(&self, session_id: Option<&str>) -> PathBuf {
        match session_id.filter(|id| !id.is_empty()) {
            Some(id) => self.base_dir.join(self.state_id_file.replacen("%s", id, 1)),
            None => self.base_dir.join(&self.state_file),
        }
    }

    /// Templates directory, resolved against `base_dir` when relative
    pub fn templates_dir(&self) -> Option<PathBuf> {
        self.database_templates_path.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                self.base_dir.join(path)
            }
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.state_file.is_empty() {
            return Err("state_file cannot be empty".to_string());
        }

        if !self.state_id_file.contains("%s") {
            return Err("state_id_file must contain a %s placeholder".to_string());
        }

        if self.state_file.contains('/') || self.state_id_file.contains('/') {
            return Err("state file names must not contain directories".to_string());
        }

        if self.database_prefix.is_empty()
            || !self
                .database_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err("database_prefix must be non-empty [A-Za-z0-9_]".to_string());
        }

        if self.assets_dir == self.assets_backup_dir {
            return Err("assets_dir and assets_backup_dir must differ".to_string());
        }

        if self.assets_backup_dir.starts_with(&self.assets_dir) {
            return Err("assets_backup_dir cannot live inside assets_dir".to_string());
        }

        Ok(())
    }
}

impl Default for TestSessionConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TestSessionConfig::new("/srv/www");
        assert_eq!(config.state_file, "TESTS_RUNNING.json");
        assert_eq!(config.database_prefix, "ss_");
        assert_eq!(config.assets_dir, PathBuf::from("/srv/www/assets"));
        assert_eq!(config.assets_backup_dir, PathBuf::from("/srv/www/assets_backup"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TestSessionConfig::new("/srv/www")
            .database_prefix("qa_")
            .default_database("app")
            .environment(EnvironmentMode::Test)
            .asset_ignore(&[".htaccess"]);

        assert_eq!(config.database_prefix, "qa_");
        assert_eq!(config.default_database.as_deref(), Some("app"));
        assert_eq!(config.environment, EnvironmentMode::Test);
        assert_eq!(config.asset_ignore, vec![".htaccess"]);
    }

    #[test]
    fn test_state_path_is_templated_by_id() {
        let config = TestSessionConfig::new("/srv/www");
        assert_eq!(
            config.state_path(None),
            PathBuf::from("/srv/www/TESTS_RUNNING.json")
        );
        assert_eq!(
            config.state_path(Some("abc123")),
            PathBuf::from("/srv/www/TESTS_RUNNING-abc123.json")
        );
        assert_eq!(
            config.state_path(Some("")),
            PathBuf::from("/srv/www/TESTS_RUNNING.json")
        );
    }

    #[test]
    fn test_validate() {
        let no_placeholder = TestSessionConfig::new("/srv").state_id_file("TESTS.json");
        assert!(no_placeholder.validate().is_err());

        let bad_prefix = TestSessionConfig::new("/srv").database_prefix("ss-;drop");
        assert!(bad_prefix.validate().is_err());

        let nested_backup = TestSessionConfig::new("/srv").assets_backup_dir("/srv/assets/backup");
        assert!(nested_backup.validate().is_err());
    }

    #[test]
    fn test_environment_mode_parsing() {
        assert_eq!("live".parse::<EnvironmentMode>(), Ok(EnvironmentMode::Live));
        assert_eq!("Dev".parse::<EnvironmentMode>(), Ok(EnvironmentMode::Dev));
        assert!("staging".parse::<EnvironmentMode>().is_err());
        assert!(EnvironmentMode::Live.is_live());
    }
}
