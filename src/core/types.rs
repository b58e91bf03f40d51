// src/core/types.rs — Core domain types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Structured reviewer verdict, parsed from the reviewer's JSON reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub score: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Feedback {
    /// Degraded stand-in used when the reviewer's reply cannot be parsed
    /// even after a retry.
    pub fn parse_failure() -> Self {
        Self {
            score: 0.0,
            suggestions: vec!["parse error".into()],
        }
    }
}

/// Returned once per `generate`/`refine` call. Not persisted.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub draft: String,
    pub feedback: Feedback,
    pub iterations: u32,
    pub from_cache: bool,
    pub tokens_used: u32,
}

/// Terminal outcome of a run. Cancellation is a status, not an error.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(IterationResult),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Writing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Writing,
    Reviewing,
    Cache,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Writing => "writing",
            Stage::Reviewing => "reviewing",
            Stage::Cache => "cache",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Overall completion in [0, 1].
    pub progress: f64,
    pub message: String,
    pub stage: Stage,
    /// Rolling estimate of remaining seconds; absent until one iteration
    /// has completed.
    pub eta_seconds: Option<f64>,
}

/// Observer for phase transitions. The excluded HTTP layer forwards these
/// to its own client-notification channel.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, update: ProgressUpdate);
}

/// Sink that drops every update.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn report(&self, _update: ProgressUpdate) {}
}

/// Sink backed by a bounded channel the caller drains. Preserves update
/// ordering; a closed receiver silently discards.
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update).await;
    }
}
