use std::error::Error as StdError;

/// Crate-wide result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed engine errors shared across all switchboard crates.
///
/// The variants map onto the retry policy: validation, not-found and
/// configuration errors are never retried; transient provider errors are
/// retried with backoff up to the attempt cap; permanent provider errors
/// are terminal on first occurrence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is malformed.
    #[error("invalid input: {message}")]
    Validation { message: String },

    /// A referenced conversation, target, or channel does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Missing or unusable credentials for a channel. Operator-actionable.
    #[error("channel not configured: {message}")]
    Configuration { message: String },

    /// Provider-side failure worth retrying (timeout, 5xx, rate limit).
    #[error("transient provider error: {message}")]
    TransientProvider { message: String },

    /// Provider-side failure that will not succeed on retry (4xx other
    /// than rate limit, e.g. invalid recipient).
    #[error("permanent provider error: {message}")]
    PermanentProvider { message: String },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn validation(message: impl std::fmt::Display) -> Self {
        Self::Validation {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl std::fmt::Display) -> Self {
        Self::Configuration {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::TransientProvider {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl std::fmt::Display) -> Self {
        Self::PermanentProvider {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the outbox should re-attempt an operation that failed with
    /// this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientProvider { .. } | Self::Io(_) | Self::External { .. }
        )
    }
}
