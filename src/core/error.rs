use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No test session in progress: {0}")]
    NotRunning(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Import failed at statement `{statement}`: {message}")]
    Import { statement: String, message: String },

    #[error("Lock error: {0}")]
    Lock(String),
}

impl SessionError {
    /// Stable machine-readable code, used by the HTTP layer and the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRunning(_) => "not_running",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Io(_) => "io_error",
            Self::Provisioning(_) => "provisioning_error",
            Self::Connection(_) => "connection_error",
            Self::Import { .. } => "import_error",
            Self::Lock(_) => "lock_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl<T> From<std::sync::PoisonError<T>> for SessionError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_error_names_the_statement() {
        let err = SessionError::Import {
            statement: "INSERT INTO nope VALUES (1)".to_string(),
            message: "no such table: nope".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("INSERT INTO nope VALUES (1)"));
        assert!(text.contains("no such table"));
        assert_eq!(err.code(), "import_error");
    }

    #[test]
    fn poisoned_lock_maps_to_lock_error() {
        let mutex = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: SessionError = mutex.lock().unwrap_err().into();
        assert!(matches!(err, SessionError::Lock(_)));
    }
}
