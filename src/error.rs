use thiserror::Error;

/// Typed error hierarchy for pipeline operations.
///
/// The variant decides the retry posture: `Transient` failures are retried
/// with backoff, `Permanent` failures park the item until a manual reset,
/// `Validation` failures get a small bounded in-pass retry, and `RateLimited`
/// aborts the remainder of the current orchestrator pass. Stale stage
/// transitions are not represented here; a lost compare-and-swap is a skip,
/// not an error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network hiccup, timeout, or 5xx from a collaborator. Retryable.
    #[error("transient: {0}")]
    Transient(String),

    /// Auth failure, missing resource, or anything a retry cannot fix.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Response or file that failed structural validation.
    #[error("invalid response: {0}")]
    Validation(String),

    /// Quota or rate-limit signal from a collaborator.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Bad or missing configuration. Fatal at startup only.
    #[error("configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether a failed item should be rescheduled on the backoff timer.
    /// Validation failures already got their bounded in-pass retry, so once
    /// they are recorded the item waits for a manual reset.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

/// Map an HTTP response status onto the taxonomy.
pub fn classify_status(status: reqwest::StatusCode, context: &str) -> PipelineError {
    if status.as_u16() == 429 {
        PipelineError::RateLimited(format!("{}: HTTP 429", context))
    } else if status.is_server_error() || status.as_u16() == 408 {
        PipelineError::Transient(format!("{}: HTTP {}", context, status))
    } else {
        PipelineError::Permanent(format!("{}: HTTP {}", context, status))
    }
}

// ============================================================================
// From impls
// ============================================================================

/// Transport-level reqwest failures (connect, timeout, body read) are
/// transient; HTTP status handling happens at the call site before the
/// response is consumed.
impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(e: serde_yaml::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}
