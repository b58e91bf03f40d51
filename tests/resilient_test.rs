// tests/resilient_test.rs — Integration: resilient caller with scripted transport

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use redraft::infra::config::LimitersConfig;
use redraft::infra::errors::RedraftError;
use redraft::limiter::{RateLimiterRegistry, MODEL_API};
use redraft::provider::resilient::{ResilientApiCaller, RetryPolicy};
use redraft::provider::{ChatMessage, ChatRequest, ChatResponse, ChatTransport};

/// One scripted transport outcome per attempt.
enum Reply {
    Content(&'static str),
    Http(u16),
    Network,
}

/// Replays a fixed sequence of outcomes and records what it saw.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    timeouts_seen: Mutex<Vec<Duration>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            timeouts_seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn timeouts(&self) -> Vec<Duration> {
        self.timeouts_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        _request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, RedraftError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timeouts_seen.lock().unwrap().push(timeout);

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("transport script exhausted");
        match reply {
            Reply::Content(text) => Ok(ChatResponse {
                content: text.to_string(),
                total_tokens: Some(10),
            }),
            Reply::Http(status) => match status {
                429 | 502 | 503 | 504 => Err(RedraftError::HttpTransient {
                    status,
                    message: "scripted".into(),
                }),
                _ => Err(RedraftError::HttpFatal {
                    status,
                    message: "scripted".into(),
                }),
            },
            Reply::Network => Err(RedraftError::NetworkTransient {
                message: "connection reset".into(),
            }),
        }
    }
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "test-model".into(),
        messages: vec![ChatMessage::user("hello")],
    }
}

fn registry() -> Arc<RateLimiterRegistry> {
    Arc::new(RateLimiterRegistry::new(&LimitersConfig {
        model_api_rate: 100.0,
        model_api_capacity: 100.0,
        ..Default::default()
    }))
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        backoff_factor: 2.0,
        base_timeout: Duration::from_secs(30),
        token_wait: Duration::from_secs(10),
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_gateway_errors_then_succeeds() {
    let transport = ScriptedTransport::new(vec![
        Reply::Http(503),
        Reply::Http(503),
        Reply::Content("third time lucky"),
    ]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let start = Instant::now();
    let response = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.content, "third time lucky");
    assert_eq!(transport.calls(), 3);
    // Backoff slept 2^0 + 2^1 seconds between the three attempts
    assert_eq!((Instant::now() - start).as_secs(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_budget_exhaustion_surfaces_error() {
    let transport = ScriptedTransport::new(vec![Reply::Http(502), Reply::Http(502), Reply::Http(502)]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let err = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RedraftError::HttpTransient { status: 502, .. }));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_429_feeds_throttled_metric_and_retries() {
    let transport = ScriptedTransport::new(vec![Reply::Http(429), Reply::Content("ok")]);
    let reg = registry();
    let caller = ResilientApiCaller::with_policy(transport.clone(), reg.clone(), policy());

    let response = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.content, "ok");
    assert_eq!(transport.calls(), 2);
    assert_eq!(reg.get_limiter(MODEL_API).metrics().throttled_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_status_is_not_retried() {
    let transport = ScriptedTransport::new(vec![Reply::Http(400)]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let err = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RedraftError::HttpFatal { status: 400, .. }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_network_errors_retried_then_surfaced() {
    let transport =
        ScriptedTransport::new(vec![Reply::Network, Reply::Network, Reply::Network]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let start = Instant::now();
    let err = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RedraftError::NetworkTransient { .. }));
    assert_eq!(transport.calls(), 3);
    assert_eq!((Instant::now() - start).as_secs(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_grows_across_attempts() {
    let transport = ScriptedTransport::new(vec![
        Reply::Network,
        Reply::Network,
        Reply::Content("done"),
    ]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        transport.timeouts(),
        vec![
            Duration::from_secs(30),
            Duration::from_secs(45),
            Duration::from_secs(60),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_limiter_exhaustion_fails_fast_without_calling() {
    let transport = ScriptedTransport::new(vec![Reply::Content("never sent")]);
    let reg = Arc::new(RateLimiterRegistry::new(&LimitersConfig {
        model_api_rate: 0.001,
        model_api_capacity: 1.0,
        ..Default::default()
    }));
    // Drain the single token so the wait cannot succeed
    assert!(reg.allow_request(MODEL_API, 1.0));

    let caller = ResilientApiCaller::with_policy(
        transport.clone(),
        reg,
        RetryPolicy {
            token_wait: Duration::ZERO,
            ..policy()
        },
    );

    let err = caller
        .call(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RedraftError::RateLimitExceeded { .. }));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_attempt_issues_no_call() {
    let transport = ScriptedTransport::new(vec![Reply::Content("never sent")]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = caller.call(&request(), &cancel).await.unwrap_err();
    assert!(matches!(err, RedraftError::Cancelled));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_during_backoff_stops_retrying() {
    let transport = ScriptedTransport::new(vec![Reply::Http(503), Reply::Content("never sent")]);
    let caller = ResilientApiCaller::with_policy(transport.clone(), registry(), policy());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel_clone.cancel();
    });

    // First attempt fails with 503, backoff is 1s; cancellation lands at
    // 500ms and must win the race.
    let err = caller.call(&request(), &cancel).await.unwrap_err();
    assert!(matches!(err, RedraftError::Cancelled));
    assert_eq!(transport.calls(), 1);
}
