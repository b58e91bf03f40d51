// src/provider/mod.rs — Outbound chat-completion layer

pub mod http;
pub mod resilient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infra::errors::RedraftError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub total_tokens: Option<u32>,
}

/// Seam between the retry layer and the wire. The production impl is
/// `http::HttpChatTransport`; tests substitute scripted fakes.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, RedraftError>;
}
