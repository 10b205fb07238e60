//! Error types for the application

use thiserror::Error;

/// Errors that abort a push cycle and are surfaced to the coordinator
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Transfer error: {0}")]
    Transfer(String),
}

/// Errors from coordinator config endpoints, always downgraded to defaults
#[derive(Error, Debug)]
pub enum ConfigFetchError {
    #[error("Coordinator returned status: {0}")]
    Status(reqwest::StatusCode),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Invalid startup configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
