// ============================================================================
// testsession Library
// ============================================================================

pub mod barrier;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod database;
pub mod host;
pub mod storage;
pub mod web;

// Re-export main types for convenience
pub use barrier::{BarrierGuard, BarrierRecord, RequestBarrier};
pub use client::{ClientError, DriverClient};
pub use config::{EnvironmentMode, TestSessionConfig};
pub use coordinator::{CoordinatorBuilder, DatabaseTemplate, SessionCoordinator};
pub use core::{Result, SessionError, SessionState, merge_states};
pub use database::{EphemeralDatabase, SqliteServer};
pub use host::{
    CapturingMailer, FixtureLoader, MailMessage, Mailer, MailerRegistry, ProcessEnvironment,
    RequestEnvironment, SchemaBuilder, ScriptSchemaBuilder, SessionExtension, YamlFixtureLoader,
};
pub use storage::{AssetVault, FileStateStore, StateStore};
pub use web::{BrowserSession, RequestLifecycleHook, WebError};
