// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::infra::errors::RedraftError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limiters: LimitersConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub iteration: IterationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitersConfig {
    pub model_api_rate: f64,
    pub model_api_capacity: f64,
    pub storage_api_rate: f64,
    pub storage_api_capacity: f64,
    /// Applied to buckets auto-created for names nobody registered up front.
    pub default_rate: f64,
    pub default_capacity: f64,
    /// Buckets idle longer than this are eligible for staleness cleanup.
    pub stale_after_secs: u64,
}

impl Default for LimitersConfig {
    fn default() -> Self {
        Self {
            model_api_rate: 5.0,
            model_api_capacity: 10.0,
            storage_api_rate: 10.0,
            storage_api_capacity: 20.0,
            default_rate: 5.0,
            default_capacity: 10.0,
            stale_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub model: String,
    /// Sent as the `Referer` header so the upstream can attribute traffic.
    pub referer: String,
    /// Sent as the `X-Title` header.
    pub app_title: String,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub base_timeout_secs: u64,
    /// Upper bound on the rate-limiter wait before a call fails fast.
    pub token_wait_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".into(),
            model: "anthropic/claude-sonnet-4".into(),
            referer: "https://localhost".into(),
            app_title: "redraft".into(),
            max_retries: 3,
            backoff_factor: 2.0,
            base_timeout_secs: 30,
            token_wait_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }

    pub fn token_wait(&self) -> Duration {
        Duration::from_secs(self.token_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    pub max_loops: u32,
    pub max_refinement_loops: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_loops: 3,
            max_refinement_loops: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub max_logs: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_logs: 1000,
            cleanup_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any missing section.
    pub fn load(path: &Path) -> Result<Self, RedraftError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| RedraftError::Config(e.to_string()))
    }

    /// API key is environment-only; it never lives in the config file.
    pub fn api_key() -> Result<String, RedraftError> {
        std::env::var("REDRAFT_API_KEY")
            .map_err(|_| RedraftError::Config("REDRAFT_API_KEY is not set".into()))
    }
}
