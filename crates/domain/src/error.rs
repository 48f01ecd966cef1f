/// Shared error type used across all Ruche crates.
///
/// Variants map one-to-one onto the fabric's error kinds; the scheduler uses
/// [`Error::is_retryable`] to decide whether a failed turn may be retried.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payload too large: {size} bytes (cap {cap})")]
    PayloadTooLarge { size: usize, cap: usize },

    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    #[error("session slot wait exceeded {0} ms")]
    MutexTimeout(u64),

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("enforcement violation: {0}")]
    Enforcement(String),

    /// CAS failure or missing orchestrator identity. Fatal for the turn.
    #[error("internal conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a turn that failed with this error may be retried.
    ///
    /// Retry additionally requires that no irreversible tool committed during
    /// the attempt; that check belongs to the scheduler, not the error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IdentityUnavailable(_)
                | Self::RateLimited { .. }
                | Self::Provider { .. }
                | Self::Timeout(_)
                | Self::MutexTimeout(_)
                | Self::Http(_)
        )
    }

    /// Stable machine-readable error code for API responses and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::IdentityUnavailable(_) => "IDENTITY_UNAVAILABLE",
            Self::IdentityConflict(_) => "IDENTITY_CONFLICT",
            Self::MutexTimeout(_) => "MUTEX_TIMEOUT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Enforcement(_) => "ENFORCEMENT_VIOLATION",
            Self::Conflict(_) => "INTERNAL_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
