//! Bounded-concurrency batch execution.
//!
//! A batch is joined in the caller's task: requests interleave at I/O and
//! backoff suspension points, no tasks are spawned, and dropping the batch
//! future cancels every request in it.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::errors::{BricataError, Result, TransportError, TransportErrorKind};
use crate::results::Outcome;
use crate::retry::RetryPolicy;
use crate::transport::{Headers, Request, Transport};

/// Runs batches of requests through a [`RetryPolicy`] over a [`Transport`]
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    concurrency: usize,
    batch_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Default number of simultaneous transport calls per batch
    pub const DEFAULT_CONCURRENCY: usize = 5;

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            concurrency: Self::DEFAULT_CONCURRENCY,
            batch_timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Limit simultaneous transport calls per batch; values below 1 are raised to 1
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Fail a whole batch with [`BricataError::TimedOut`] after `timeout`
    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `requests` and return one outcome per request, in input order
    ///
    /// # Errors
    ///
    /// Returns [`BricataError::TimedOut`] if a batch timeout is configured and
    /// expires; no partial outcomes are returned in that case.
    #[instrument(
        name = "Dispatcher::dispatch",
        skip_all,
        fields(batch_size = requests.len(), concurrency = self.concurrency)
    )]
    pub async fn dispatch(&self, requests: &[Request], headers: &Headers) -> Result<Vec<Outcome>> {
        let outcomes = match self.batch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.run_batch(requests, headers))
                .await
                .map_err(|_| BricataError::TimedOut(timeout))?,
            None => self.run_batch(requests, headers).await,
        };

        debug!(
            succeeded = outcomes.iter().filter(|o| o.is_success()).count(),
            failed = outcomes.iter().filter(|o| !o.is_success()).count(),
            "Batch complete"
        );
        Ok(outcomes)
    }

    /// Like [`dispatch`](Self::dispatch), aborting the whole batch when `token` fires
    ///
    /// # Errors
    ///
    /// Returns [`BricataError::Cancelled`] on cancellation, or
    /// [`BricataError::TimedOut`] if the batch timeout expires first.
    pub async fn dispatch_cancellable(
        &self,
        requests: &[Request],
        headers: &Headers,
        token: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(batch_size = requests.len(), "Batch cancelled");
                Err(BricataError::Cancelled)
            }
            outcomes = self.dispatch(requests, headers) => outcomes,
        }
    }

    async fn run_batch(&self, requests: &[Request], headers: &Headers) -> Vec<Outcome> {
        let limiter = Semaphore::new(self.concurrency);
        let limiter = &limiter;
        let transport = self.transport.as_ref();

        let calls = requests.iter().map(|request| {
            self.policy.execute(request, move || async move {
                // One permit per attempt; it is dropped before any backoff sleep
                let _permit = limiter.acquire().await.map_err(|_| {
                    TransportError::new(TransportErrorKind::Other, "concurrency limiter closed")
                })?;
                transport.send(request, headers).await
            })
        });

        join_all(calls).await
    }
}
