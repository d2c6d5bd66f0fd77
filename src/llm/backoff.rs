use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff settings for one call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles after each further attempt.
    pub base_delay: Duration,
    /// Ceiling applied to the doubled delay.
    pub max_delay: Duration,
    /// Retries after the initial attempt, so `max_retries + 1` invocations
    /// at most.
    pub max_retries: usize,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }
}

pub enum RetryDisposition {
    Retry,
    Abort,
}

enum SleepOutcome {
    Completed,
    Cancelled,
}

/// Runs `operation` until it succeeds, aborts, or the retry budget is spent.
///
/// `attempt` is zero-indexed; the sleep after a failed attempt `n` is
/// `min(base_delay * 2^n, max_delay)`. Errors classified as `Abort` and the
/// final exhausted error are returned as-is so callers keep their typed
/// error. Cancellation during a backoff sleep surfaces the last error
/// without running further attempts.
pub async fn retry_with_backoff<T, E, Op, Fut, Classify, OnRetry>(
    policy: RetryPolicy,
    cancellation: Option<&CancellationToken>,
    mut operation: Op,
    mut classify: Classify,
    mut on_retry: OnRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: FnMut(&E) -> RetryDisposition,
    OnRetry: FnMut(usize, Duration, &E),
{
    let mut attempt = 0;
    let mut delay = policy.base_delay;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if matches!(classify(&err), RetryDisposition::Abort) {
                    return Err(err);
                }
                if attempt >= policy.max_retries {
                    return Err(err);
                }

                on_retry(attempt, delay, &err);

                if matches!(
                    sleep_with_cancellation(delay, cancellation).await,
                    SleepOutcome::Cancelled
                ) {
                    return Err(err);
                }

                attempt += 1;
                delay = next_delay(delay, policy.max_delay);
            }
        }
    }
}

async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> SleepOutcome {
    if delay.is_zero() {
        yield_now().await;
        return SleepOutcome::Completed;
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => SleepOutcome::Cancelled,
            _ = sleep(delay) => SleepOutcome::Completed,
        }
    } else {
        sleep(delay).await;
        SleepOutcome::Completed
    }
}

fn next_delay(current: Duration, max_delay: Duration) -> Duration {
    if current.is_zero() {
        return max_delay.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_delay {
        next = max_delay;
    }
    next
}
