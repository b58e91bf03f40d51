// src/core/controller.rs — Writer/reviewer iteration controller
//
// Drives the bounded drafting loop: writer call, reviewer call, feedback
// parse, quality decision, progress report, repeat or stop. Every outbound
// call goes through the resilient caller; cancellation is cooperative and
// observed only at the checkpoints around those calls. One instance serves
// one logical run at a time (single-flight by convention — there is no
// internal mutual exclusion across calls).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::{RefinementCache, CACHEABLE_SCORE};
use super::events::{EventKind, EventLog, EventLogEntry};
use super::feedback::parse_feedback;
use super::quality::meets_criteria;
use super::types::{
    ControllerState, Feedback, IterationResult, NullProgressSink, ProgressSink, ProgressUpdate,
    RunOutcome, Stage,
};
use crate::infra::config::Config;
use crate::infra::errors::RedraftError;
use crate::provider::resilient::ResilientApiCaller;
use crate::provider::{ChatMessage, ChatRequest, ChatResponse};

/// Drafts past this word count get the compressed refinement prompt.
const COMPRESSED_PROMPT_WORDS: usize = 1000;

/// Characters kept from each side of a cached before/after pattern.
const PATTERN_EXCERPT_CHARS: usize = 200;

const WRITER_SYSTEM: &str =
    "You are a professional writer producing polished long-form text. \
     Output only the text itself, with no commentary.";

const REVIEWER_SYSTEM: &str =
    "You are an exacting editor. Score drafts for clarity, structure, and completeness.";

pub struct IterationController {
    caller: ResilientApiCaller,
    model: String,
    max_loops: u32,
    max_refinement_loops: u32,
    cache: RefinementCache,
    events: EventLog,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    state: Mutex<ControllerState>,
    last_error: Mutex<Option<String>>,
}

impl IterationController {
    pub fn new(caller: ResilientApiCaller, model: impl Into<String>, config: &Config) -> Self {
        Self {
            caller,
            model: model.into(),
            max_loops: config.iteration.max_loops,
            max_refinement_loops: config.iteration.max_refinement_loops,
            cache: RefinementCache::new(config.cache.max_entries),
            events: EventLog::new(
                config.events.max_logs,
                Duration::from_secs(config.events.cleanup_interval_secs),
            ),
            progress: Arc::new(NullProgressSink),
            cancel: CancellationToken::new(),
            state: Mutex::new(ControllerState::Idle),
            last_error: Mutex::new(None),
        }
    }

    /// Attach a progress observer, invoked (awaited) at each phase
    /// transition.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Request cooperative cancellation. In-flight calls are allowed to
    /// finish; no further calls are issued. Terminal for this instance.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle the excluded HTTP layer can hold to cancel from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ControllerState {
        *self.lock_state()
    }

    /// Message of the error that moved the controller to `Failed`, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_last_error().clone()
    }

    /// Diagnostic view of the event trace, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<EventLogEntry> {
        self.events.recent(limit)
    }

    /// Produce a draft for `content`, iterating until the reviewer is
    /// satisfied or `max_loops` is reached.
    pub async fn generate(&self, content: &str) -> Result<RunOutcome, RedraftError> {
        self.start_run("generate");

        let mut draft = String::new();
        let mut suggestions: Vec<String> = Vec::new();
        let mut last_feedback: Option<Feedback> = None;
        let mut durations: Vec<Duration> = Vec::new();
        let mut tokens_used: u32 = 0;
        let mut iterations: u32 = 0;

        for i in 0..self.max_loops {
            let iter_start = Instant::now();

            self.set_state(ControllerState::Writing);
            self.emit(
                i as f64 / self.max_loops as f64,
                format!("Drafting (iteration {} of {})", i + 1, self.max_loops),
                Stage::Writing,
                eta(&durations, self.max_loops - i),
            )
            .await;

            let messages = if i == 0 {
                writer_messages(content)
            } else {
                revision_messages(content, &draft, &suggestions)
            };
            let Some(response) = self.step(messages).await? else {
                return Ok(RunOutcome::Cancelled);
            };
            tokens_used += response.total_tokens.unwrap_or(0);
            draft = response.content;
            self.events.record(
                EventKind::WriterCompleted,
                json!({"iteration": i + 1, "draft_chars": draft.len()}),
            );

            self.set_state(ControllerState::Reviewing);
            self.emit(
                (i as f64 + 0.5) / self.max_loops as f64,
                format!("Reviewing (iteration {} of {})", i + 1, self.max_loops),
                Stage::Reviewing,
                eta(&durations, self.max_loops - i),
            )
            .await;

            let Some(feedback) = self.review(&draft, &mut tokens_used, i + 1).await? else {
                return Ok(RunOutcome::Cancelled);
            };

            iterations = i + 1;
            durations.push(iter_start.elapsed());

            let (passed, reason) = meets_criteria(&feedback);
            self.events.record(
                if passed {
                    EventKind::QualityPassed
                } else {
                    EventKind::QualityFailed
                },
                json!({"iteration": iterations, "score": feedback.score, "reason": reason}),
            );

            suggestions.extend(feedback.suggestions.iter().cloned());
            last_feedback = Some(feedback);

            if passed {
                break;
            }
        }

        let feedback = last_feedback.unwrap_or_else(Feedback::parse_failure);
        let result = self
            .finish_completed(IterationResult {
                draft,
                feedback,
                iterations,
                from_cache: false,
                tokens_used,
            })
            .await;
        Ok(RunOutcome::Completed(result))
    }

    /// Rework `content` according to `instructions`. Simple instructions
    /// seen before short-circuit to a single writer call that applies the
    /// cached transformation pattern, skipping the reviewer entirely.
    pub async fn refine(
        &self,
        content: &str,
        instructions: &str,
    ) -> Result<RunOutcome, RedraftError> {
        self.start_run("refine");

        let key = RefinementCache::key(instructions, content.len());
        let simple = RefinementCache::is_simple(instructions);

        if simple {
            if let Some(entry) = self.cache.get(&key) {
                self.events.record(EventKind::CacheHit, json!({"key": key.as_str()}));
                self.emit(
                    0.5,
                    "Applying cached transformation".to_string(),
                    Stage::Cache,
                    None,
                )
                .await;

                let messages = cached_pattern_messages(content, instructions, &entry.pattern);
                let Some(response) = self.step(messages).await? else {
                    return Ok(RunOutcome::Cancelled);
                };
                let tokens_used = response.total_tokens.unwrap_or(0);
                self.events.record(
                    EventKind::WriterCompleted,
                    json!({"iteration": 1, "cached": true}),
                );

                let result = self
                    .finish_completed(IterationResult {
                        draft: response.content,
                        feedback: entry.feedback,
                        iterations: 1,
                        from_cache: true,
                        tokens_used,
                    })
                    .await;
                return Ok(RunOutcome::Completed(result));
            }
        }

        let compressed = word_count(content) > COMPRESSED_PROMPT_WORDS;
        let mut draft = content.to_string();
        let mut last_feedback: Option<Feedback> = None;
        let mut durations: Vec<Duration> = Vec::new();
        let mut tokens_used: u32 = 0;
        let mut iterations: u32 = 0;

        for r in 0..self.max_refinement_loops {
            let iter_start = Instant::now();

            self.set_state(ControllerState::Writing);
            self.emit(
                r as f64 / self.max_refinement_loops as f64,
                format!("Refining (pass {} of {})", r + 1, self.max_refinement_loops),
                Stage::Writing,
                eta(&durations, self.max_refinement_loops - r),
            )
            .await;

            let messages = refine_messages(&draft, instructions, compressed);
            let Some(response) = self.step(messages).await? else {
                return Ok(RunOutcome::Cancelled);
            };
            tokens_used += response.total_tokens.unwrap_or(0);
            draft = response.content;
            self.events.record(
                EventKind::WriterCompleted,
                json!({"iteration": r + 1, "draft_chars": draft.len()}),
            );

            self.set_state(ControllerState::Reviewing);
            self.emit(
                (r as f64 + 0.5) / self.max_refinement_loops as f64,
                format!("Reviewing (pass {} of {})", r + 1, self.max_refinement_loops),
                Stage::Reviewing,
                eta(&durations, self.max_refinement_loops - r),
            )
            .await;

            let Some(feedback) = self.review(&draft, &mut tokens_used, r + 1).await? else {
                return Ok(RunOutcome::Cancelled);
            };

            iterations = r + 1;
            durations.push(iter_start.elapsed());

            let good_enough = feedback.score > CACHEABLE_SCORE;
            self.events.record(
                if good_enough {
                    EventKind::QualityPassed
                } else {
                    EventKind::QualityFailed
                },
                json!({"iteration": iterations, "score": feedback.score}),
            );
            last_feedback = Some(feedback.clone());

            if good_enough {
                if simple {
                    self.events
                        .record(EventKind::CacheStored, json!({"key": key.as_str()}));
                    self.cache
                        .insert(key.clone(), pattern_excerpt(content, &draft), feedback);
                }
                break;
            }
        }

        let feedback = last_feedback.unwrap_or_else(Feedback::parse_failure);
        let result = self
            .finish_completed(IterationResult {
                draft,
                feedback,
                iterations,
                from_cache: false,
                tokens_used,
            })
            .await;
        Ok(RunOutcome::Completed(result))
    }

    // ─── internals ──────────────────────────────────────────────

    fn start_run(&self, mode: &str) {
        self.set_state(ControllerState::Writing);
        *self.lock_last_error() = None;
        self.events.record(
            EventKind::RunStarted,
            json!({"run_id": Uuid::new_v4().to_string(), "mode": mode}),
        );
    }

    /// One outbound call with its surrounding cancellation checkpoints.
    /// `None` means cancellation was observed (state already recorded);
    /// errors have already been recorded as the run's failure.
    async fn step(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<Option<ChatResponse>, RedraftError> {
        if self.cancel.is_cancelled() {
            return Ok(self.observe_cancelled());
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
        };
        match self.caller.call(&request, &self.cancel).await {
            Ok(response) => Ok(Some(response)),
            Err(RedraftError::Cancelled) => Ok(self.observe_cancelled()),
            Err(e) => Err(self.observe_failed(e)),
        }
    }

    /// Reviewer call plus feedback parse. Parse failure gets one retry
    /// with an explicit JSON-only instruction, then degrades to a
    /// zero-score feedback; it never aborts the loop.
    async fn review(
        &self,
        draft: &str,
        tokens_used: &mut u32,
        iteration: u32,
    ) -> Result<Option<Feedback>, RedraftError> {
        let Some(response) = self.step(reviewer_messages(draft, false)).await? else {
            return Ok(None);
        };
        *tokens_used += response.total_tokens.unwrap_or(0);
        self.events.record(
            EventKind::ReviewerCompleted,
            json!({"iteration": iteration}),
        );

        match parse_feedback(&response.content) {
            Ok(feedback) => Ok(Some(feedback)),
            Err(e) => {
                self.events.record(
                    EventKind::ParseRetry,
                    json!({"iteration": iteration, "error": e.to_string()}),
                );
                tracing::warn!(iteration, "Unparseable reviewer feedback, retrying: {}", e);

                let Some(retry) = self.step(reviewer_messages(draft, true)).await? else {
                    return Ok(None);
                };
                *tokens_used += retry.total_tokens.unwrap_or(0);
                Ok(Some(
                    parse_feedback(&retry.content).unwrap_or_else(|_| Feedback::parse_failure()),
                ))
            }
        }
    }

    fn observe_cancelled(&self) -> Option<ChatResponse> {
        self.set_state(ControllerState::Cancelled);
        self.events.record(EventKind::RunCancelled, json!({}));
        tracing::info!("Run cancelled at checkpoint");
        None
    }

    fn observe_failed(&self, error: RedraftError) -> RedraftError {
        self.set_state(ControllerState::Failed);
        *self.lock_last_error() = Some(error.to_string());
        self.events
            .record(EventKind::RunFailed, json!({"error": error.to_string()}));
        tracing::error!("Run failed: {}", error);
        error
    }

    async fn finish_completed(&self, result: IterationResult) -> IterationResult {
        self.set_state(ControllerState::Completed);
        self.events.record(
            EventKind::RunCompleted,
            json!({
                "iterations": result.iterations,
                "score": result.feedback.score,
                "from_cache": result.from_cache,
            }),
        );
        self.emit(1.0, "Done".to_string(), Stage::Done, Some(0.0)).await;
        result
    }

    async fn emit(&self, progress: f64, message: String, stage: Stage, eta_seconds: Option<f64>) {
        self.progress
            .report(ProgressUpdate {
                progress,
                message,
                stage,
                eta_seconds,
            })
            .await;
    }

    fn set_state(&self, state: ControllerState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rolling mean of completed iteration durations times the iterations
/// still ahead. `None` until one iteration has finished.
fn eta(durations: &[Duration], remaining: u32) -> Option<f64> {
    if durations.is_empty() {
        return None;
    }
    let avg = durations.iter().map(|d| d.as_secs_f64()).sum::<f64>() / durations.len() as f64;
    Some(avg * remaining as f64)
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn char_excerpt(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn pattern_excerpt(before: &str, after: &str) -> String {
    format!(
        "BEFORE: {}\nAFTER: {}",
        char_excerpt(before, PATTERN_EXCERPT_CHARS),
        char_excerpt(after, PATTERN_EXCERPT_CHARS)
    )
}

fn writer_messages(content: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(WRITER_SYSTEM),
        ChatMessage::user(format!(
            "Write a complete draft for the following brief.\n\n{content}"
        )),
    ]
}

fn revision_messages(content: &str, draft: &str, suggestions: &[String]) -> Vec<ChatMessage> {
    let bullet_list = suggestions
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        ChatMessage::system(WRITER_SYSTEM),
        ChatMessage::user(format!(
            "Revise the draft below for the original brief, addressing the reviewer \
             suggestions.\n\nBrief:\n{content}\n\nDraft:\n{draft}\n\nReviewer \
             suggestions:\n{bullet_list}"
        )),
    ]
}

fn reviewer_messages(draft: &str, json_only: bool) -> Vec<ChatMessage> {
    let mut prompt = format!(
        "Evaluate the draft below. Reply with a JSON object: \
         {{\"score\": <number between 0 and 1>, \"suggestions\": \
         [<specific improvements>]}}.\n\nDraft:\n{draft}"
    );
    if json_only {
        prompt.push_str("\n\nReply with JSON only. No prose, no code fences.");
    }
    vec![
        ChatMessage::system(REVIEWER_SYSTEM),
        ChatMessage::user(prompt),
    ]
}

fn refine_messages(draft: &str, instructions: &str, compressed: bool) -> Vec<ChatMessage> {
    // Long drafts get the terse template to conserve tokens.
    let prompt = if compressed {
        format!("Apply: {instructions}\n\nText:\n{draft}\n\nOutput only the revised text.")
    } else {
        format!(
            "Rework the text below according to the instructions. Preserve meaning and \
             factual content unless the instructions say otherwise. Output only the \
             revised text.\n\nInstructions: {instructions}\n\nText:\n{draft}"
        )
    };
    vec![ChatMessage::system(WRITER_SYSTEM), ChatMessage::user(prompt)]
}

fn cached_pattern_messages(content: &str, instructions: &str, pattern: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(WRITER_SYSTEM),
        ChatMessage::user(format!(
            "Apply the same editing transformation shown in the example to the text.\n\n\
             Example (before/after excerpt):\n{pattern}\n\nInstructions: {instructions}\n\n\
             Text:\n{content}\n\nOutput only the revised text."
        )),
    ]
}
