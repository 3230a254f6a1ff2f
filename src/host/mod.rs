//! Capabilities the session engine borrows from the host application.

pub mod environment;
pub mod extension;
pub mod fixtures;
pub mod mailer;
pub mod schema;

pub use environment::{ProcessEnvironment, RequestEnvironment};
pub use extension::SessionExtension;
pub use fixtures::{FixtureLoader, YamlFixtureLoader};
pub use mailer::{CapturingMailer, MailMessage, Mailer, MailerRegistry};
pub use schema::{SchemaBuilder, ScriptSchemaBuilder};
