// src/provider/http.rs — reqwest-backed chat transport
//
// Maps upstream responses onto the error taxonomy: 429 and gateway errors
// (502/503/504) are transient, any other non-2xx is fatal, and
// connect/read/timeout failures are transient network errors. Retry policy
// lives in `resilient`, not here.

use async_trait::async_trait;
use std::time::Duration;

use super::{ChatRequest, ChatResponse, ChatTransport};
use crate::infra::config::ApiConfig;
use crate::infra::errors::RedraftError;

/// Cap on error-body excerpts kept for logging.
const ERROR_BODY_EXCERPT: usize = 200;

pub struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    referer: String,
    app_title: String,
}

impl HttpChatTransport {
    pub fn new(cfg: &ApiConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            api_key,
            referer: cfg.referer.clone(),
            app_title: cfg.app_title.clone(),
        }
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_EXCERPT).collect()
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, RedraftError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Referer", &self.referer)
            .header("X-Title", &self.app_title)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| RedraftError::NetworkTransient {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = excerpt(&body);
            return match status.as_u16() {
                429 | 502 | 503 | 504 => Err(RedraftError::HttpTransient {
                    status: status.as_u16(),
                    message,
                }),
                code => Err(RedraftError::HttpFatal {
                    status: code,
                    message,
                }),
            };
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| RedraftError::HttpFatal {
                status: status.as_u16(),
                message: format!("Malformed response body: {e}"),
            })?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let total_tokens = body["usage"]["total_tokens"].as_u64().map(|t| t as u32);

        Ok(ChatResponse {
            content,
            total_tokens,
        })
    }
}
