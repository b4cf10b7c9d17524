//! Typed error hierarchy for numberhub.
//!
//! Two top-level enums:
//! - `HubError`: domain failures raised by storage, auth and the webhook
//! - `ConfigError`: failures while loading or validating configuration

use thiserror::Error;

/// Errors from the hub's storage, auth and webhook layers.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Incorrect username or password")]
    InvalidCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Webhook signature validation failed")]
    InvalidSignature,
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
