use crate::core::Result;
use crate::database::dump;
use rusqlite::Connection;
use std::path::PathBuf;
use tracing::debug;

/// Brings a freshly imported database up to the application's schema.
pub trait SchemaBuilder: Send + Sync {
    fn build(&self, conn: &Connection, require_default_records: bool) -> Result<()>;
}

/// Runs an idempotent schema script, then optionally a default-records script.
#[derive(Debug, Clone, Default)]
pub struct ScriptSchemaBuilder {
    schema_script: Option<PathBuf>,
    default_records_script: Option<PathBuf>,
}

impl ScriptSchemaBuilder {
    pub fn new(schema_script: Option<PathBuf>, default_records_script: Option<PathBuf>) -> Self {
        Self {
            schema_script,
            default_records_script,
        }
    }
}

impl SchemaBuilder for ScriptSchemaBuilder {
    fn build(&self, conn: &Connection, require_default_records: bool) -> Result<()> {
        if let Some(script) = &self.schema_script {
            let count = dump::run_script(conn, script)?;
            debug!(script = %script.display(), statements = count, "schema reconciled");
        }
        if require_default_records {
            if let Some(script) = &self.default_records_script {
                let count = dump::run_script(conn, script)?;
                debug!(script = %script.display(), statements = count, "default records seeded");
            }
        }
        Ok(())
    }
}
