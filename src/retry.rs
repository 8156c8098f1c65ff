//! Shared retry policy for source-system and downstream-service calls.
//!
//! Retryable-vs-fatal is an explicit classification on the error type, not
//! exception inspection: an operation returns its error and the policy asks
//! [`Transient::is_transient`] whether another attempt is allowed. Sleeps
//! between attempts are cancellable via a [`CancelFlag`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Cooperative cancellation flag shared between a job and its in-flight
/// network operations. Checked at sleep boundaries, never preemptive.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors that may be worth retrying.
pub trait Transient {
    /// `true` for conditions like timeouts and connection resets; `false`
    /// for anything that repeating the call cannot fix.
    fn is_transient(&self) -> bool;
}

/// Outcome of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error> {
    /// The retry budget was exhausted by transient failures.
    #[error("retry budget exhausted after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: E },

    /// The operation failed with a non-retryable error.
    #[error(transparent)]
    Fatal(E),

    /// Cancellation was requested while waiting to retry.
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

/// Fixed-interval retry policy.
///
/// `max_retries` counts retries, not attempts: a value of 3 allows up to
/// four calls in total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Runs `op` until it succeeds, fails fatally, or the budget runs out.
    pub async fn run<T, E, F, Fut>(
        &self,
        description: &str,
        cancel: &CancelFlag,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Transient,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
                Err(e) => {
                    warn!(
                        attempt,
                        max = self.max_retries + 1,
                        error = %e,
                        "Transient failure while '{description}'"
                    );
                    if attempt > self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                    sleep(self.interval).await;
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, thiserror::Error)]
    enum FakeError {
        #[error("timeout")]
        Timeout,
        #[error("bad request")]
        BadRequest,
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, FakeError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy
            .run("test op", &CancelFlag::new(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(FakeError::Timeout)
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test op", &CancelFlag::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Timeout)
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // max_retries = 2 means three calls in total
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test op", &CancelFlag::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::BadRequest)
            })
            .await;
        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_between_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result: Result<(), _> = policy
            .run("test op", &cancel, || async { Err(FakeError::Timeout) })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
