// src/provider/resilient.rs — Retry with exponential backoff for the chat endpoint
//
// Wraps any ChatTransport with rate-limiter acquisition, bounded retries,
// and per-attempt timeouts that grow with each retry.
// Retries: rate limits (429), gateway errors (502/503/504), network
// failures. Does NOT retry: any other non-2xx, limiter-wait exhaustion.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ChatRequest, ChatResponse, ChatTransport};
use crate::infra::config::ApiConfig;
use crate::infra::errors::RedraftError;
use crate::limiter::{RateLimiterRegistry, MODEL_API};

/// Default retry configuration.
const MAX_RETRIES: u32 = 3;
const BACKOFF_FACTOR: f64 = 2.0;
const BASE_TIMEOUT_SECS: u64 = 30;
const TOKEN_WAIT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub base_timeout: Duration,
    pub token_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_factor: BACKOFF_FACTOR,
            base_timeout: Duration::from_secs(BASE_TIMEOUT_SECS),
            token_wait: Duration::from_secs(TOKEN_WAIT_SECS),
        }
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(cfg: &ApiConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_factor: cfg.backoff_factor,
            base_timeout: cfg.base_timeout(),
            token_wait: cfg.token_wait(),
        }
    }
}

pub struct ResilientApiCaller {
    transport: Arc<dyn ChatTransport>,
    registry: Arc<RateLimiterRegistry>,
    policy: RetryPolicy,
}

impl ResilientApiCaller {
    pub fn new(transport: Arc<dyn ChatTransport>, registry: Arc<RateLimiterRegistry>) -> Self {
        Self {
            transport,
            registry,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(
        transport: Arc<dyn ChatTransport>,
        registry: Arc<RateLimiterRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            registry,
            policy,
        }
    }

    /// Timeout grows with each retry: `base * (1 + attempt * 0.5)`.
    fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        self.policy
            .base_timeout
            .mul_f64(1.0 + attempt as f64 * 0.5)
    }

    /// `backoff_factor^attempt` seconds.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.policy.backoff_factor.powi(attempt as i32))
    }

    /// Issue one logical chat call.
    ///
    /// Acquires exactly one rate-limiter token per logical call; retried
    /// attempts reuse the original grant, since backoff already paces them
    /// and 429s feed the limiter's throttled metric.
    pub async fn call(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, RedraftError> {
        let allowed = tokio::select! {
            allowed = self
                .registry
                .wait_for_token(MODEL_API, 1.0, self.policy.token_wait) => allowed,
            _ = cancel.cancelled() => return Err(RedraftError::Cancelled),
        };
        if !allowed {
            return Err(RedraftError::RateLimitExceeded {
                limiter: MODEL_API.into(),
                waited_ms: self.policy.token_wait.as_millis() as u64,
            });
        }

        let mut last_error = None;

        for attempt in 0..self.policy.max_retries {
            if cancel.is_cancelled() {
                return Err(RedraftError::Cancelled);
            }

            let timeout = self.timeout_for_attempt(attempt);
            match self.transport.send(request, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() => {
                    if let RedraftError::HttpTransient { status: 429, .. } = e {
                        self.registry.get_limiter(MODEL_API).record_throttled();
                    }

                    if attempt + 1 >= self.policy.max_retries {
                        return Err(e);
                    }

                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient error: {}",
                        e
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RedraftError::Cancelled),
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(RedraftError::NetworkTransient {
            message: "Retry budget exhausted before any attempt".into(),
        }))
    }
}
