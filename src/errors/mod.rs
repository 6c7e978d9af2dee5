use thiserror::Error;

/// Typed error hierarchy for the broker.
///
/// Use at module boundaries (network filter, schema cache, rate limiter,
/// connection pool, upstream pool, proxy, audit logger). Internal/leaf
/// functions can continue using `anyhow::Result` — the `Internal` variant
/// allows seamless conversion via the `?` operator.
///
/// Variants mirror the error taxonomy in the design: each row surfaces at
/// the HTTP boundary as a specific status code, never a stack trace.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: tool '{tool}' not in allowlist")]
    Forbidden { tool: String, allowed: Vec<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited { retry_after: u64, limit: u64 },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection pool is draining")]
    PoolDraining,

    #[error("timed out waiting for a connection pool slot")]
    QueueTimeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// Whether this error is transient and the caller might retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout(_)
                | Self::PoolDraining
                | Self::QueueTimeout
                | Self::UpstreamFailure(_)
                | Self::Internal(_)
        )
    }

    /// HTTP status code this error maps to at the proxy boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::SchemaMismatch(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::Timeout(_)
            | Self::UpstreamFailure(_)
            | Self::PoolDraining
            | Self::QueueTimeout
            | Self::Internal(_) => 500,
        }
    }
}
