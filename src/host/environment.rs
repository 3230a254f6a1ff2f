use crate::config::EnvironmentMode;
use crate::host::mailer::Mailer;
use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, PoisonError, RwLock};

/// The parts of the host process a session overrides while a request runs.
pub trait RequestEnvironment: Send + Sync {
    fn is_live(&self) -> bool;

    /// `None` restores the real clock.
    fn set_mock_now(&self, now: Option<NaiveDateTime>);

    fn set_mailer(&self, mailer: Option<Arc<dyn Mailer>>);
}

/// Process-wide clock and mail transport, read by application code.
pub struct ProcessEnvironment {
    mode: EnvironmentMode,
    mock_now: RwLock<Option<NaiveDateTime>>,
    mailer: RwLock<Option<Arc<dyn Mailer>>>,
}

impl ProcessEnvironment {
    pub fn new(mode: EnvironmentMode) -> Self {
        Self {
            mode,
            mock_now: RwLock::new(None),
            mailer: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> EnvironmentMode {
        self.mode
    }

    /// Current time as the application should see it.
    pub fn now(&self) -> NaiveDateTime {
        self.mock_now().unwrap_or_else(|| Local::now().naive_local())
    }

    pub fn mock_now(&self) -> Option<NaiveDateTime> {
        *self.mock_now.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mailer(&self) -> Option<Arc<dyn Mailer>> {
        self.mailer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self::new(EnvironmentMode::default())
    }
}

impl RequestEnvironment for ProcessEnvironment {
    fn is_live(&self) -> bool {
        self.mode.is_live()
    }

    fn set_mock_now(&self, now: Option<NaiveDateTime>) {
        *self.mock_now.write().unwrap_or_else(PoisonError::into_inner) = now;
    }

    fn set_mailer(&self, mailer: Option<Arc<dyn Mailer>>) {
        *self.mailer.write().unwrap_or_else(PoisonError::into_inner) = mailer;
    }
}
