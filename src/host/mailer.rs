//! Mail transports selectable by name from the session record.

use crate::core::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Mail-sending capability of the host application.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Keeps every message in memory so a driver can assert on it.
#[derive(Debug, Default)]
pub struct CapturingMailer {
    sent: Mutex<Vec<MailMessage>>,
}

impl CapturingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Mailer for CapturingMailer {
    fn send(&self, message: &MailMessage) -> Result<()> {
        self.sent.lock()?.push(message.clone());
        Ok(())
    }
}

pub type MailerFactory = Arc<dyn Fn() -> Arc<dyn Mailer> + Send + Sync>;

/// Name → mailer lookup.
///
/// Only names registered here are accepted for the `mailer` field; every
/// registered factory yields a [`Mailer`], so a resolvable name is always a
/// conforming one.
#[derive(Default)]
pub struct MailerRegistry {
    factories: RwLock<HashMap<String, MailerFactory>>,
}

impl MailerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a shared [`CapturingMailer`] under `TestMailer`.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let capture: Arc<dyn Mailer> = Arc::new(CapturingMailer::new());
        registry.register_instance("TestMailer", capture);
        registry
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Mailer> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Registers one instance shared by every resolution.
    pub fn register_instance(&self, name: &str, mailer: Arc<dyn Mailer>) {
        self.register(name, move || mailer.clone());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(not_a_mailer(name))
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Mailer>> {
        let factory = self
            .factories
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| not_a_mailer(name))?;
        Ok(factory())
    }
}

fn not_a_mailer(name: &str) -> SessionError {
    SessionError::InvalidArgument(format!(
        "\"{}\" is not a registered Mailer implementation",
        name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_test_mailer() {
        let registry = MailerRegistry::with_defaults();
        assert!(registry.validate("TestMailer").is_ok());
        assert_eq!(registry.names(), vec!["TestMailer"]);
    }

    #[test]
    fn test_unknown_mailer_is_rejected() {
        let registry = MailerRegistry::with_defaults();
        let err = registry.resolve("stdClass").err().unwrap();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
        assert!(err.to_string().contains("stdClass"));
    }

    #[test]
    fn test_registered_instance_is_shared() {
        let capture = Arc::new(CapturingMailer::new());
        let registry = MailerRegistry::new();
        registry.register_instance("Capture", capture.clone());

        let message = MailMessage {
            to: "a@example.com".to_string(),
            from: "b@example.com".to_string(),
            subject: "Hi".to_string(),
            body: "Hello".to_string(),
        };
        registry.resolve("Capture").unwrap().send(&message).unwrap();

        assert_eq!(capture.sent(), vec![message]);
    }
}
