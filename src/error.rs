//! Error taxonomy for the acquisition pipeline.
//!
//! Stage-level errors ([`ScrapeError`]) abort the current run; record-level
//! anomalies (malformed rows, enrichment misses, filing-date conflicts) are
//! recorded on the run and never surface through this type.

/// Errors raised by the network-facing pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// The target site returned an access-denial status. Not retried.
    #[error("blocked by target site (HTTP {status}): {url}")]
    Blocked { status: u16, url: String },

    /// The stateful form tokens were lost or rejected. The caller may restart
    /// the search from page one with a fresh session, at most once per run.
    #[error("form session expired: {0}")]
    SessionExpired(String),

    /// The expected page structure is missing entirely. Usually means the
    /// anti-bot layer served a challenge page instead of results.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Network-level failure. Retryable at the call site with backoff.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ScrapeError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    /// Whether the caller may retry this request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Convenience alias for pipeline-stage results.
pub type ScrapeResult<T> = std::result::Result<T, ScrapeError>;
