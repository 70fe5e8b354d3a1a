//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse rules file {path}: {reason}")]
    RulesParse { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors reported by a platform client.
///
/// The variants mirror how the dispatch core reacts, not the exact
/// platform error codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("Rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },

    #[error("Write forbidden in chat {chat}: {reason}")]
    Forbidden { chat: String, reason: String },

    #[error("Account banned from chat {chat}: {reason}")]
    Banned { chat: String, reason: String },

    #[error("Sub-thread {topic_id} rejected by chat {chat}: {reason}")]
    ThreadIncompatible {
        chat: String,
        topic_id: i64,
        reason: String,
    },

    #[error("Invalid target {chat}: {reason}")]
    InvalidTarget { chat: String, reason: String },

    #[error("Account credentials rejected: {0}")]
    Unauthorized(String),

    #[error("Operation not supported by this client: {0}")]
    Unsupported(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected platform response: {0}")]
    Other(String),
}

/// How the dispatch core classifies a send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    Permission,
    MalformedTarget,
    Unauthorized,
    Unknown,
}

impl FailureClass {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Permission => "permission",
            Self::MalformedTarget => "malformed_target",
            Self::Unauthorized => "unauthorized",
            Self::Unknown => "unknown",
        }
    }
}

impl PlatformError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited { .. } => FailureClass::RateLimit,
            Self::Forbidden { .. } | Self::Banned { .. } => FailureClass::Permission,
            Self::InvalidTarget { .. } => FailureClass::MalformedTarget,
            Self::Unauthorized(_) => FailureClass::Unauthorized,
            Self::ThreadIncompatible { .. }
            | Self::Unsupported(_)
            | Self::Http(_)
            | Self::Other(_) => FailureClass::Unknown,
        }
    }
}

/// Session pool errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("No accounts configured")]
    Empty,

    #[error("No live accounts left in the pool")]
    NoLiveAccounts,

    #[error("Every live account is barred from destination {destination}")]
    NoAccountForDestination { destination: i64 },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unresolved target: {0}")]
    UnresolvedTarget(String),

    #[error("Send to {destination} failed ({}): {source}", .source.class().label())]
    SendFailed {
        destination: i64,
        #[source]
        source: PlatformError,
    },

    #[error("Session pool: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("History fetch failed for {source_id}: {source}")]
    History {
        source_id: i64,
        #[source]
        source: PlatformError,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
