// src/core/events.rs — Bounded in-memory trace of loop events
//
// Append-only on the hot path; trimming to `max_logs` happens on a
// periodic cleanup tick, not on every record.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    WriterCompleted,
    ReviewerCompleted,
    ParseRetry,
    QualityPassed,
    QualityFailed,
    CacheHit,
    CacheStored,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::RunStarted => "run_started",
            EventKind::WriterCompleted => "writer_completed",
            EventKind::ReviewerCompleted => "reviewer_completed",
            EventKind::ParseRetry => "parse_retry",
            EventKind::QualityPassed => "quality_passed",
            EventKind::QualityFailed => "quality_failed",
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheStored => "cache_stored",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunFailed => "run_failed",
            EventKind::RunCancelled => "run_cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub details: serde_json::Value,
}

struct EventLogInner {
    entries: VecDeque<EventLogEntry>,
    last_cleanup: Instant,
}

pub struct EventLog {
    inner: Mutex<EventLogInner>,
    max_logs: usize,
    cleanup_interval: Duration,
}

impl EventLog {
    pub fn new(max_logs: usize, cleanup_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                entries: VecDeque::new(),
                last_cleanup: Instant::now(),
            }),
            max_logs,
            cleanup_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventLogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// O(1) append. Trimming only runs once `cleanup_interval` has elapsed
    /// since the previous tick.
    pub fn record(&self, kind: EventKind, details: serde_json::Value) {
        let mut inner = self.lock();
        inner.entries.push_back(EventLogEntry {
            timestamp: Utc::now(),
            kind,
            details,
        });

        if inner.last_cleanup.elapsed() >= self.cleanup_interval {
            let max = self.max_logs;
            while inner.entries.len() > max {
                inner.entries.pop_front();
            }
            inner.last_cleanup = Instant::now();
        }
    }

    /// Newest-first slice of the trace.
    pub fn recent(&self, limit: usize) -> Vec<EventLogEntry> {
        let inner = self.lock();
        inner.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
