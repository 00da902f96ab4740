//! Error types for Flotilla

use thiserror::Error;

/// Result type for Flotilla operations
pub type Result<T> = std::result::Result<T, FlotillaError>;

/// Flotilla error types
#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Swarm session already active for artifact: {0}")]
    Conflict(String),

    #[error("Swarm startup failed: {0}")]
    Startup(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Swarm session not found: {0}")]
    SessionNotFound(String),

    #[error("Remote execution error: {0}")]
    Remote(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlotillaError {
    /// Process exit code for an error that ends the CLI before a fleet result exists
    pub fn exit_code(&self) -> i32 {
        match self {
            FlotillaError::Config(_) | FlotillaError::Yaml(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_yaml::Error> for FlotillaError {
    fn from(err: serde_yaml::Error) -> Self {
        FlotillaError::Yaml(err.to_string())
    }
}

impl From<reqwest::Error> for FlotillaError {
    fn from(err: reqwest::Error) -> Self {
        FlotillaError::Http(err.to_string())
    }
}
