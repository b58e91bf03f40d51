// src/infra/errors.rs — Error types for redraft

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedraftError {
    // Limiter wait exhausted before a token became available.
    // Fails fast — never retried by the caller itself.
    #[error("Rate limit exceeded on '{limiter}' after waiting {waited_ms}ms")]
    RateLimitExceeded { limiter: String, waited_ms: u64 },

    // Transient upstream statuses (429, 502, 503, 504) — retried with
    // backoff, surfaced once the retry budget is exhausted.
    #[error("Transient HTTP {status}: {message}")]
    HttpTransient { status: u16, message: String },

    // Any other non-2xx — surfaced immediately, never retried.
    #[error("HTTP {status}: {message}")]
    HttpFatal { status: u16, message: String },

    // Connect/read/timeout failures — retried with backoff, surfaced
    // once the retry budget is exhausted.
    #[error("Network error: {message}")]
    NetworkTransient { message: String },

    // Malformed reviewer feedback. Recovered locally by the controller
    // (one explicit retry, then a degraded zero-score feedback); never
    // crosses the component boundary.
    #[error("Feedback parse error: {0}")]
    FeedbackParse(String),

    // Cooperative cancellation observed at a checkpoint. The controller
    // converts this into a `Cancelled` outcome, not an error.
    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RedraftError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RedraftError::HttpTransient { .. } | RedraftError::NetworkTransient { .. }
        )
    }
}
