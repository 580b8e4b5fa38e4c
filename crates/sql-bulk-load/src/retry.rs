//! Bounded retry with exponential backoff.
//!
//! [`RetryExecutor::run`] attempts an idempotent operation, asks the
//! [`RetryHooks`] whether a failure is transient, and sleeps a doubling wait
//! (capped at `max_wait`) between attempts. When it gives up it returns the
//! *first* error, wrapped with a summary of every attempt. The backoff sleep
//! is cancellable: cancellation ends the loop with [`LoadError::Cancelled`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OutputConfig;
use crate::error::{summarize_causes, LoadError, Result};

/// Per-operation classification and logging.
pub trait RetryHooks: Sync {
    fn is_retryable(&self, err: &LoadError) -> bool;

    fn on_retry(&self, err: &LoadError, retry_count: u32, retry_limit: u32, wait: Duration) {
        let _ = (err, retry_count, retry_limit, wait);
    }

    fn on_giveup(&self, first: &LoadError, last: &LoadError) {
        let _ = (first, last);
    }
}

/// Hooks that log under a description and delegate classification to a closure.
pub struct LoggingHooks<'a, P> {
    description: &'a str,
    classify: P,
}

impl<'a, P> LoggingHooks<'a, P>
where
    P: Fn(&LoadError) -> bool + Sync,
{
    pub fn new(description: &'a str, classify: P) -> Self {
        Self {
            description,
            classify,
        }
    }
}

impl<P> RetryHooks for LoggingHooks<'_, P>
where
    P: Fn(&LoadError) -> bool + Sync,
{
    fn is_retryable(&self, err: &LoadError) -> bool {
        (self.classify)(err)
    }

    fn on_retry(&self, err: &LoadError, retry_count: u32, retry_limit: u32, wait: Duration) {
        warn!(
            "{} ({}:{}), retrying {}/{} after {} seconds. Message: {}",
            self.description,
            err.error_code().map(|c| c.to_string()).unwrap_or_default(),
            err.sql_state().unwrap_or_default(),
            retry_count,
            retry_limit,
            wait.as_secs_f64(),
            summarize_causes(err)
        );
        if retry_count % 3 == 0 {
            warn!("Error details:\n{}", err.format_detailed());
        }
    }

    fn on_giveup(&self, first: &LoadError, last: &LoadError) {
        warn!(
            "{} failed; giving up. First error: {}. Last error: {}",
            self.description,
            summarize_causes(first),
            summarize_causes(last)
        );
    }
}

/// Retry loop settings.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    retry_limit: u32,
    initial_wait: Duration,
    max_wait: Duration,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(retry_limit: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            retry_limit,
            initial_wait,
            max_wait,
            cancel: None,
        }
    }

    /// Settings of the `retry_*` output options.
    pub fn from_config(output: &OutputConfig) -> Self {
        Self::new(
            output.retry_limit,
            Duration::from_millis(output.retry_wait),
            Duration::from_millis(output.max_retry_wait),
        )
    }

    /// Abort backoff sleeps when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or has been retried `retry_limit` times.
    pub async fn run<T, F, Fut, H>(&self, hooks: &H, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        H: RetryHooks + ?Sized,
    {
        let mut retry_count: u32 = 0;
        let mut wait = self.initial_wait;
        let mut first: Option<LoadError> = None;
        let mut causes: Vec<String> = Vec::new();

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_cancelled() {
                return Err(err);
            }

            let message = summarize_causes(&err);
            if causes.last() != Some(&message) {
                causes.push(message);
            }

            if !hooks.is_retryable(&err) || retry_count >= self.retry_limit {
                return Err(match first {
                    None => {
                        hooks.on_giveup(&err, &err);
                        err
                    }
                    Some(first) => {
                        hooks.on_giveup(&first, &err);
                        exhausted(retry_count + 1, &causes, first)
                    }
                });
            }

            retry_count += 1;
            hooks.on_retry(&err, retry_count, self.retry_limit, wait);
            if first.is_none() {
                first = Some(err);
            } else {
                debug!("Retryable failure {}: {}", retry_count, err);
            }
            self.sleep(wait).await?;
            wait = (wait * 2).min(self.max_wait);
        }
    }

    async fn sleep(&self, wait: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(LoadError::Cancelled),
                    _ = tokio::time::sleep(wait) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
        }
    }
}

fn exhausted(attempts: u32, causes: &[String], first: LoadError) -> LoadError {
    LoadError::RetryExhausted {
        attempts,
        causes: causes.join(" < "),
        source: Box::new(first),
    }
}
