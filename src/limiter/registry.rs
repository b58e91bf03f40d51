// src/limiter/registry.rs — Named-bucket registry
//
// One bucket per outbound service. Constructed once at process start and
// shared by reference; the map mutex guards creation and eviction while
// each bucket serializes its own counters, so concurrent controllers
// contending for the same name do not race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::bucket::{BucketMetrics, TokenBucket};
use crate::infra::config::LimitersConfig;

pub const MODEL_API: &str = "model-api";
pub const STORAGE_API: &str = "storage-api";

/// Built-in buckets are seeded at construction and survive staleness
/// cleanup no matter how long they sit idle.
const BUILTINS: [&str; 2] = [MODEL_API, STORAGE_API];

pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    default_rate: f64,
    default_capacity: f64,
}

impl RateLimiterRegistry {
    pub fn new(cfg: &LimitersConfig) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            MODEL_API.to_string(),
            Arc::new(TokenBucket::new(cfg.model_api_rate, cfg.model_api_capacity)),
        );
        buckets.insert(
            STORAGE_API.to_string(),
            Arc::new(TokenBucket::new(
                cfg.storage_api_rate,
                cfg.storage_api_capacity,
            )),
        );

        Self {
            buckets: Mutex::new(buckets),
            default_rate: cfg.default_rate,
            default_capacity: cfg.default_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TokenBucket>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the named bucket, lazily creating it with registry defaults.
    /// Auto-creation is unexpected for anything outside the built-ins, so
    /// it warns.
    pub fn get_limiter(&self, name: &str) -> Arc<TokenBucket> {
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.get(name) {
            return bucket.clone();
        }

        tracing::warn!(
            limiter = name,
            rate = self.default_rate,
            capacity = self.default_capacity,
            "Auto-creating rate limiter for unregistered service"
        );
        let bucket = Arc::new(TokenBucket::new(self.default_rate, self.default_capacity));
        buckets.insert(name.to_string(), bucket.clone());
        bucket
    }

    /// Non-blocking pass-through to the named bucket.
    pub fn allow_request(&self, name: &str, tokens: f64) -> bool {
        self.get_limiter(name).try_consume(tokens)
    }

    /// Awaitable pass-through to the named bucket, bounded by `max_wait`.
    pub async fn wait_for_token(&self, name: &str, tokens: f64, max_wait: Duration) -> bool {
        // Clone the Arc out so the map lock is not held across the await.
        let bucket = self.get_limiter(name);
        bucket.consume_or_wait(tokens, max_wait).await
    }

    /// Drop buckets idle longer than `max_age`, excluding built-ins.
    /// Returns the removed names. Meant for a periodic timer, not the
    /// request path.
    pub fn cleanup_stale(&self, max_age: Duration) -> Vec<String> {
        let mut buckets = self.lock();
        let mut removed = Vec::new();

        buckets.retain(|name, bucket| {
            if BUILTINS.contains(&name.as_str()) || bucket.idle_for() <= max_age {
                true
            } else {
                tracing::debug!(limiter = name.as_str(), "Evicting stale rate limiter");
                removed.push(name.clone());
                false
            }
        });

        removed
    }

    /// Metrics snapshot for every named bucket.
    pub fn metrics(&self) -> Vec<(String, BucketMetrics)> {
        self.lock()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.metrics()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("buckets", &self.len())
            .finish()
    }
}
