use std::time::Duration;

use async_trait::async_trait;

use crate::error::StreamError;
use crate::request::GenerationRequest;
use crate::token::TokenEventStream;
use crate::transport::Transport;

/// Policy controlling how many times an operation is retried and the delay
/// between attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Maximum number of additional attempts to make after the first failure.
    pub max_retries: usize,
    /// Delay between retry attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_retries` times, sleeping `delay` before each retry.
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Execute `op` retrying on error according to the policy.
    pub async fn retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempts < self.max_retries => {
                    attempts += 1;
                    tracing::warn!(error = %e, attempt = attempts, "retrying");
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Opt-in wrapper retrying failed stream *opens*.
///
/// Only the connection attempt is retried. Once a stream is open, a fault is
/// reported as is; resubmitting the request is up to the caller.
#[derive(Clone)]
pub struct RetryTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryTransport<T> {
    /// Wrap `inner`, retrying its stream opens under `policy`.
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T> Transport for RetryTransport<T>
where
    T: Transport,
{
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        self.policy
            .retry(|| self.inner.open_stream(request))
            .await
    }
}
