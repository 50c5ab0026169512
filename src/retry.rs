//! Bounded retry with linearly increasing backoff
//!
//! Every call site that retries a transient backend error goes through
//! [`retry_if`], parameterized by a predicate deciding what is retryable.

use crate::error::AvatalkError;
use std::time::Duration;
use tokio_retry::{Action, RetryIf};
use tracing::warn;

/// Delay sequence `base * 1, base * 2, base * 3, ...`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base, attempt: 0 }
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.base.saturating_mul(self.attempt))
    }
}

/// Run `action` up to `max_attempts` times, sleeping `attempt * base`
/// between attempts, as long as `is_retryable` accepts the error.
///
/// Errors the predicate rejects are returned immediately. When the last
/// attempt fails its error is returned unchanged.
pub async fn retry_if<A, P>(
    max_attempts: usize,
    base: Duration,
    action: A,
    mut is_retryable: P,
) -> Result<A::Item, AvatalkError>
where
    A: Action<Error = AvatalkError>,
    P: FnMut(&AvatalkError) -> bool,
{
    let strategy = LinearBackoff::new(base).take(max_attempts.saturating_sub(1));
    let mut failures = 0usize;

    RetryIf::spawn(strategy, action, |err: &AvatalkError| {
        failures += 1;
        let retry = is_retryable(err);
        if retry && failures < max_attempts {
            warn!(
                "⚠️ Attempt {}/{} failed, retrying in {:?}: {}",
                failures,
                max_attempts,
                base.saturating_mul(failures as u32),
                err
            );
        }
        retry
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_backoff_sequence() {
        let delays: Vec<Duration> = LinearBackoff::new(Duration::from_secs(2)).take(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let start = tokio::time::Instant::now();

        let result = retry_if(
            3,
            Duration::from_secs(2),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(AvatalkError::ConcurrencyLimit(format!("attempt {n}")))
                    } else {
                        Ok(n)
                    }
                }
            },
            AvatalkError::is_transient,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_aborts_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry_if(
            5,
            Duration::from_secs(1),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AvatalkError::Unauthorized("bad key".into()))
                }
            },
            AvatalkError::is_transient,
        )
        .await;

        assert!(matches!(result, Err(AvatalkError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry_if(
            3,
            Duration::from_millis(10),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AvatalkError::ConcurrencyLimit("full".into()))
                }
            },
            AvatalkError::is_transient,
        )
        .await;

        assert!(matches!(result, Err(AvatalkError::ConcurrencyLimit(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
