use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("credential store error: {0}")]
    Credential(String),
    #[error("sync token expired")]
    SyncTokenExpired,
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Network,
    Validation,
    Conflict,
    Persistence,
    Cancelled,
    Config,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) | Self::Credential(_) => ErrorCategory::Auth,
            Self::Network(_) | Self::SyncTokenExpired => ErrorCategory::Network,
            Self::Validation(_) | Self::Json(_) => ErrorCategory::Validation,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::Persistence(_) | Self::Sqlite(_) | Self::Io(_) => ErrorCategory::Persistence,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::InvalidConfig(_) => ErrorCategory::Config,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_and_io_errors_are_persistence_failures() {
        let error = EngineError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(error.category(), ErrorCategory::Persistence);

        let error = EngineError::from(std::io::Error::other("disk full"));
        assert_eq!(error.category(), ErrorCategory::Persistence);
    }

    #[test]
    fn only_network_failures_are_transient() {
        assert!(EngineError::Network("connection reset".to_string()).is_transient());
        assert!(!EngineError::SyncTokenExpired.is_transient());
        assert!(!EngineError::Validation("bad payload".to_string()).is_transient());
    }
}
