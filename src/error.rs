//! Error types for Forkchat
//!
//! This module defines all error types used throughout the engine,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Forkchat operations
///
/// Covers configuration loading, the upstream provider transport, stream
/// decoding, tool execution, media handling and persistence.
#[derive(Error, Debug)]
pub enum ForkchatError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider-related errors (request construction, unexpected responses)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Transport failures: network errors and non-2xx HTTP statuses
    #[error("Transport error: {0}")]
    Transport(String),

    /// Authentication errors (e.g., 401 Unauthorized, missing token)
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A single stream frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Tool execution errors
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Media upload/download/encoding errors
    #[error("Media error: {0}")]
    Media(String),

    /// Media payload exceeded the byte ceiling for its mime type
    #[error("Media too large: limit={limit} bytes, actual={actual} bytes")]
    MediaTooLarge {
        /// Configured ceiling in bytes
        limit: usize,
        /// Observed size in bytes
        actual: usize,
    },

    /// A side-channel generation job reported a terminal failure
    #[error("Generation job failed: {0}")]
    JobFailed(String),

    /// A side-channel generation job did not finish within its bounds
    #[error("Generation job timed out after {attempts} attempts")]
    JobTimedOut {
        /// Number of polls performed before giving up
        attempts: u32,
    },

    /// Conversation storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for Forkchat operations
///
/// Uses `anyhow::Error` so callers get rich context and easy propagation;
/// the concrete [`ForkchatError`] can be recovered with `downcast_ref`.
pub type Result<T> = anyhow::Result<T>;
