//! Error types for the mail relay.

use crate::delivery::retry::is_permanent_text;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage errors. Any of these on an enqueue means the job was not queued.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Metrics exporter errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Template {slug} not found")]
    NotFound { slug: String },

    #[error("Invalid template slug: {slug}")]
    InvalidSlug { slug: String },
}

/// Outcome of a single failed SMTP send, as reported by a [`crate::mail::Mailer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// The server rejected the message with a terminal (5xx) reply.
    #[error("{code} {message}")]
    Permanent { code: String, message: String },

    /// Anything that may succeed on a later attempt.
    #[error("{message}")]
    Transient { message: String },
}

impl SendFailure {
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Tagged failures are trusted; untagged ones fall back to scanning for 550-554.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Permanent { .. } => true,
            Self::Transient { message } => is_permanent_text(message),
        }
    }
}

/// A send failure for one recipient of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientFailure {
    pub recipient: String,
    pub failure: SendFailure,
}

impl std::fmt::Display for RecipientFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "send to {}: {}", self.recipient, self.failure)
    }
}

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Job-level delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("render template: {0}")]
    Render(#[from] RenderError),

    #[error("{}", join_failures(.failures))]
    Send { failures: Vec<RecipientFailure> },

    #[error("delivery cancelled while waiting for rate limit")]
    Cancelled,

    #[error("panic during delivery: {0}")]
    Panicked(String),
}

impl From<RateLimitError> for DeliveryError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled => Self::Cancelled,
        }
    }
}

impl DeliveryError {
    /// Whether retrying this failure is pointless.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Render(e) => is_permanent_text(&e.to_string()),
            Self::Send { failures } => failures.iter().any(|f| f.failure.is_permanent()),
            Self::Cancelled => false,
            Self::Panicked(_) => true,
        }
    }

    /// Value of the `error` label on failure and retry metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Render(_) => "render",
            Self::Send { .. } => "send",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panic",
        }
    }
}

fn join_failures(failures: &[RecipientFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
