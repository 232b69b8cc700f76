//! Error types for streamwarden-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for streamwarden-core
#[derive(Error, Debug)]
pub enum Error {
    /// Media-engine query/control failures
    #[error("engine error: {0}")]
    Engine(String),

    /// OS probe failures (proc parsing, disk stats)
    #[error("probe error: {0}")]
    Probe(String),

    /// Service-manager (systemctl) failures
    #[error("service manager error: {0}")]
    ServiceManager(String),

    /// Health endpoint / webhook HTTP failures
    #[error("http error: {0}")]
    Http(String),

    /// Alert delivery failures
    #[error("alert delivery error: {0}")]
    Alert(String),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel closures)
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let err = Error::Engine("pipeline query timed out".to_string());
        assert!(err.to_string().contains("pipeline query timed out"));

        let err = Error::Config("max_errors must be nonzero".to_string());
        assert!(err.to_string().starts_with("config error"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
