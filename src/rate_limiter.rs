//! Retry and pacing around single-symbol fetches.

use crate::error::{ErrorKind, FetchError};
use crate::events::{EventSink, RunEvent};
use crate::presets::RateLimitConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// One outbound call keyed by ticker symbol.
#[async_trait]
pub trait Fetcher: Send + Sync {
    type Output: Send;

    async fn fetch(&self, symbol: &str) -> Result<Self::Output, FetchError>;
}

/// Terminal outcome of a wrapped fetch. Failures carry the number of attempts made.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult<T> {
    Success(T),
    Failure {
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
}

impl<T> FetchResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Wraps a [`Fetcher`] with a jittered pre-call delay and exponential backoff.
pub struct RetryingFetcher<F> {
    inner: F,
    config: RateLimitConfig,
    sink: Arc<dyn EventSink>,
}

impl<F: Fetcher> RetryingFetcher<F> {
    pub fn new(inner: F, config: RateLimitConfig, sink: Arc<dyn EventSink>) -> Self {
        Self { inner, config, sink }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub async fn fetch(&self, symbol: &str) -> FetchResult<F::Output> {
        let max_attempts = self.config.max_attempts();
        let mut attempt = 1;

        loop {
            tokio::time::sleep(self.config.delay_range.sample()).await;

            let err = match self.inner.fetch(symbol).await {
                Ok(value) => return FetchResult::Success(value),
                Err(err) => err,
            };

            let kind = err.kind();
            if !err.is_retryable() {
                tracing::debug!(symbol, %err, "non-retryable failure");
                return FetchResult::Failure {
                    kind,
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            if attempt >= max_attempts {
                self.sink.record(RunEvent::GaveUp {
                    symbol: symbol.to_string(),
                    attempts: attempt,
                    kind,
                });
                return FetchResult::Failure {
                    kind,
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            let wait = self.config.backoff_for(attempt);
            self.sink.record(RunEvent::RetryScheduled {
                symbol: symbol.to_string(),
                attempt,
                wait,
                kind,
            });
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
