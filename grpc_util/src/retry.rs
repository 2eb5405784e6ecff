// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use futures::Future;
use rand::{thread_rng, Rng};
use tonic::{Code, Status};

/// Whether a gRPC status indicates a transient transport failure worth
/// retrying. Every other status exits the retry loop immediately: the server
/// answered, and answering again will not change its mind.
pub fn status_is_retryable(status: &Status) -> bool {
    status.code() == Code::Unavailable
}

/// Budget for retrying transient RPC failures: truncated exponential backoff
/// between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the backoff between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// The backoff to sleep before retry number `retry` (1-based), with up to
    /// 10% random jitter so that concurrent callers do not retry in lockstep.
    fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
            .min(self.max_backoff);
        let jitter = thread_rng().gen_range(0..=(exp.as_millis() as u64 / 10).max(1));
        exp + Duration::from_millis(jitter)
    }
}

/// Retry a gRPC client operation per the given config.
///
/// `f` is invoked with a fresh clone of `value` and the current attempt
/// number (0-based). Errors are retried only while `is_retryable` holds and
/// the attempt budget is not exhausted.
pub async fn retry_call<T, E, V, F, Fut, G>(
    config: RetryConfig,
    value: V,
    f: F,
    is_retryable: G,
) -> Result<T, E>
where
    V: Clone,
    F: Fn(V, u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    G: Fn(&E) -> bool,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(config.backoff(attempt)).await;
        }

        match f(value.clone(), attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if is_retryable(&err) {
                    last_error = Some(err);
                } else {
                    return Err(err);
                }
            }
        }
    }

    Err(last_error.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tonic::{Code, Status};

    use super::{retry_call, status_is_retryable, RetryConfig};

    fn quick_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(status_is_retryable(&Status::unavailable("down")));
        assert!(!status_is_retryable(&Status::internal("bug")));
        assert!(!status_is_retryable(&Status::not_found("missing")));
        assert!(!status_is_retryable(&Status::invalid_argument("bad")));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_call(
            quick_config(),
            (),
            |_, attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Status::unavailable("down"))
                    } else {
                        Ok(42)
                    }
                }
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Status> = retry_call(
            quick_config(),
            (),
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Status::unavailable("down")) }
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_exits_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Status> = retry_call(
            quick_config(),
            (),
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Status::internal("bug")) }
            },
            status_is_retryable,
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
