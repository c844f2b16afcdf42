use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use common::domain::DomainResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        exponential_backoff(self.initial_delay, self.max_delay)
    }
}

/// Doubling backoff starting at `initial`, capped at `max`, with no elapsed
/// time limit. Callers bound the number of attempts themselves.
pub fn exponential_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        // The first delay is drawn from current_interval, not initial_interval
        current_interval: initial,
        initial_interval: initial,
        max_interval: max,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Run `operation` until it succeeds, fails with a validation error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> DomainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_validation() || attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                let Some(delay) = backoff.next_backoff() else {
                    return Err(e);
                };
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::DomainError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(&fast_policy(3), "test", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DomainError::Timeout("ack".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: DomainResult<()> = retry_with_backoff(&fast_policy(4), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::PublishFailed("m1".to_string(), "no ack".to_string()))
        })
        .await;

        assert!(matches!(result, Err(DomainError::PublishFailed(_, _))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_first_delay_follows_initial_delay() {
        let policy = fast_policy(3);
        let mut backoff = policy.backoff();

        // Default jitter keeps each delay within half an interval
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(5), "first delay {:?}", first);
        assert!(first <= Duration::from_millis(15), "first delay {:?}", first);

        let second = backoff.next_backoff().unwrap();
        assert!(second <= Duration::from_millis(30), "second delay {:?}", second);
    }

    #[test]
    fn test_delays_capped_at_max() {
        let mut backoff = exponential_backoff(Duration::from_millis(100), Duration::from_millis(300));

        for _ in 0..10 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_millis(450), "delay {:?}", delay);
        }
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: DomainResult<()> = retry_with_backoff(&fast_policy(5), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::InvalidPayload("bad".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
