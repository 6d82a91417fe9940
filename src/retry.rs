//! Classification-driven retry with exponential backoff.
//!
//! The set of transient statuses is data on [`RetryPolicy`]; the retry loop
//! never names a status code.

use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{Failure, FailureKind, TransportError};
use crate::results::Outcome;
use crate::transport::{Request, Response};

/// Suspends the current task for a backoff delay
///
/// Swapped out in tests to observe delays without waiting for them.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// How random jitter is applied to a backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the capped exponential delay as is
    None,
    /// Pick uniformly from `[0, capped delay]`
    Full,
}

/// What to do with the result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Retry(FailureKind),
    Terminal(FailureKind),
}

/// Attempt bookkeeping for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// Attempts made so far, starting at 1 once the first call returns
    pub attempt: u32,
    pub max_attempts: u32,
}

impl RetryContext {
    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Retry policy configuration
///
/// # Example
///
/// ```rust
/// use bricata_api_client::{FailureKind, Jitter, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(200))
///     .with_jitter(Jitter::None)
///     .with_transient_status(502, FailureKind::ServerFault);
///
/// assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
/// assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Jitter,
    transient: BTreeMap<u16, FailureKind>,
    retry_transport_errors: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut transient = BTreeMap::new();
        transient.insert(429, FailureKind::RateLimited);
        transient.insert(503, FailureKind::ServiceUnavailable);

        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1250),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Jitter::Full,
            transient,
            retry_transport_errors: true,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("transient", &self.transient)
            .field("retry_transport_errors", &self.retry_transport_errors)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Total attempts including the first one; values below 1 are raised to 1
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Treat `status` as transient, reporting `kind` if retries run out
    pub fn with_transient_status(mut self, status: u16, kind: FailureKind) -> Self {
        self.transient.insert(status, kind);
        self
    }

    /// Replace the whole transient set; kinds come from [`FailureKind::for_status`]
    pub fn with_transient_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.transient = statuses
            .into_iter()
            .map(|status| (status, FailureKind::for_status(status)))
            .collect();
        self
    }

    pub fn with_retry_transport_errors(mut self, retry: bool) -> Self {
        self.retry_transport_errors = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_transient(&self, status: u16) -> bool {
        self.transient.contains_key(&status)
    }

    /// Classify the result of one attempt
    pub fn classify(&self, result: &std::result::Result<Response, TransportError>) -> Classification {
        match result {
            Ok(response) if response.is_success() => Classification::Success,
            failed => match self.failure_kind(failed) {
                (kind, true) => Classification::Retry(kind),
                (kind, false) => Classification::Terminal(kind),
            },
        }
    }

    /// Kind of a failed attempt and whether it may be retried
    fn failure_kind(&self, failed: &std::result::Result<Response, TransportError>) -> (FailureKind, bool) {
        match failed {
            Ok(response) => match self.transient.get(&response.status) {
                Some(kind) => (kind.clone(), true),
                None => (FailureKind::for_status(response.status), false),
            },
            Err(err) => (
                FailureKind::Transport,
                self.retry_transport_errors && err.is_retryable(),
            ),
        }
    }

    /// Delay before the next attempt after `attempt` failed attempts
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`, then jittered.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() {
            Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };

        match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let millis = capped.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        }
    }

    /// Run `send` until it succeeds, fails terminally or runs out of attempts
    ///
    /// `send` is invoked once per attempt; every terminal path yields exactly
    /// one [`Outcome`] tagged with `request`'s id.
    pub async fn execute<F, Fut>(&self, request: &Request, send: F) -> Outcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<Response, TransportError>>,
    {
        let mut context = RetryContext {
            attempt: 0,
            max_attempts: self.max_attempts,
        };

        loop {
            context.attempt += 1;
            let result = match send().await {
                Ok(response) if response.is_success() => return Outcome::Success(response),
                failed => failed,
            };

            let (kind, retryable) = self.failure_kind(&result);
            if !retryable {
                debug!(request_id = %request.id(), attempt = context.attempt, %kind, "Terminal failure");
                return Outcome::Failure(failure_from(request, kind, result));
            }

            if context.exhausted() {
                warn!(
                    request_id = %request.id(),
                    attempts = context.attempt,
                    %kind,
                    "Retries exhausted"
                );
                let kind = FailureKind::RetriesExhausted(Box::new(kind));
                return Outcome::Failure(failure_from(request, kind, result));
            }

            let delay = self.backoff_delay(context.attempt);
            warn!(
                request_id = %request.id(),
                attempt = context.attempt,
                max_attempts = context.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %kind,
                "Retrying request"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

fn failure_from(
    request: &Request,
    kind: FailureKind,
    result: std::result::Result<Response, TransportError>,
) -> Failure {
    match result {
        Ok(response) => Failure::new(request.id(), kind, response.text()).with_status(response.status),
        Err(err) => Failure::new(request.id(), kind, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    fn policy(sleeper: Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::default()
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper)
    }

    /// Replays `statuses` in order, repeating the last one
    async fn run(policy: &RetryPolicy, statuses: &[u16]) -> (Outcome, u32) {
        let request = Request::get("/tags/");
        let calls = AtomicU32::new(0);
        let outcome = policy
            .execute(&request, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
                let status = statuses[n.min(statuses.len() - 1)];
                let id = request.id();
                async move { Ok(Response::new(id, status, "{}")) }
            })
            .await;
        (outcome, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert!(policy.is_transient(429));
        assert!(policy.is_transient(503));
        assert!(!policy.is_transient(500));
        assert!(!policy.is_transient(404));
    }

    #[test]
    fn test_classify() {
        let policy = RetryPolicy::default();
        let id = uuid::Uuid::new_v4();

        assert_eq!(
            policy.classify(&Ok(Response::new(id, 204, ""))),
            Classification::Success
        );
        assert_eq!(
            policy.classify(&Ok(Response::new(id, 429, ""))),
            Classification::Retry(FailureKind::RateLimited)
        );
        assert_eq!(
            policy.classify(&Ok(Response::new(id, 404, ""))),
            Classification::Terminal(FailureKind::ClientRejected)
        );
        assert_eq!(
            policy.classify(&Ok(Response::new(id, 500, ""))),
            Classification::Terminal(FailureKind::ServerFault)
        );
        assert_eq!(
            policy.classify(&Err(TransportError::new(TransportErrorKind::Timeout, "slow"))),
            Classification::Retry(FailureKind::Transport)
        );
        assert_eq!(
            policy.classify(&Err(TransportError::new(TransportErrorKind::InvalidUrl, "bad"))),
            Classification::Terminal(FailureKind::Transport)
        );

        let strict = RetryPolicy::default().with_retry_transport_errors(false);
        assert_eq!(
            strict.classify(&Err(TransportError::new(TransportErrorKind::Connect, "refused"))),
            Classification::Terminal(FailureKind::Transport)
        );
    }

    #[test]
    fn test_custom_transient_set() {
        let policy = RetryPolicy::default().with_transient_statuses([502, 504]);
        assert!(policy.is_transient(502));
        assert!(!policy.is_transient(429));

        let id = uuid::Uuid::new_v4();
        assert_eq!(
            policy.classify(&Ok(Response::new(id, 502, ""))),
            Classification::Retry(FailureKind::ServerFault)
        );
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default()
            .with_jitter(Jitter::None)
            .with_base_delay(Duration::from_millis(1250))
            .with_max_delay(Duration::from_secs(60));

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1250));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2500));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_full_jitter_stays_within_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let cap = RetryPolicy::default()
                .with_jitter(Jitter::None)
                .backoff_delay(attempt);
            assert!(policy.backoff_delay(attempt) <= cap);
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (outcome, calls) = run(&policy(sleeper.clone()), &[200]).await;

        assert!(matches!(outcome, Outcome::Success(ref r) if r.status == 200));
        assert_eq!(calls, 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (outcome, calls) = run(&policy(sleeper.clone()), &[503, 503, 200]).await;

        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(calls, 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(1250), Duration::from_millis(2500)]
        );
    }

    #[tokio::test]
    async fn test_always_transient_attempts_exactly_max() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (outcome, calls) = run(&policy(sleeper.clone()), &[429]).await;

        assert_eq!(calls, 5);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 4);
        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(
                    failure.kind,
                    FailureKind::RetriesExhausted(Box::new(FailureKind::RateLimited))
                );
                assert_eq!(failure.status, Some(429));
            }
            Outcome::Success(_) => panic!("Expected failure"),
        }
    }

    #[tokio::test]
    async fn test_non_transient_status_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (outcome, calls) = run(&policy(sleeper.clone()), &[404, 200]).await;

        assert_eq!(calls, 1);
        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::ClientRejected);
                assert_eq!(failure.status, Some(404));
                assert_eq!(failure.detail, "{}");
            }
            Outcome::Success(_) => panic!("Expected failure"),
        }
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = policy(sleeper).with_max_attempts(2);
        let request = Request::get("/tags/");
        let calls = AtomicU32::new(0);

        let outcome = policy
            .execute(&request, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::new(TransportErrorKind::Connect, "refused")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.request_id, request.id());
                assert_eq!(
                    failure.kind,
                    FailureKind::RetriesExhausted(Box::new(FailureKind::Transport))
                );
                assert!(!failure.reached_server());
            }
            Outcome::Success(_) => panic!("Expected failure"),
        }
    }

    #[tokio::test]
    async fn test_terminal_transport_error_attempted_once() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = policy(sleeper.clone()).with_retry_transport_errors(false);
        let request = Request::get("/tags/");
        let calls = AtomicU32::new(0);

        let outcome = policy
            .execute(&request, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::new(TransportErrorKind::Connect, "refused")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Transport);
                assert!(failure.detail.contains("refused"));
            }
            Outcome::Success(_) => panic!("Expected failure"),
        }
    }
}
