//! Retry policies for operations that fail transiently.
//!
//! A [`RetryPolicy`] decides, per failure, whether to try again and how long
//! to wait first. Policies compose through [`RetryPolicyExt`], and
//! [`retry_with_policy`] drives an async operation under a policy bounded by
//! a [`Cancellation`]. [`retry_with_reset`] does the same for operations that
//! can make progress before failing, such as a long-lived connection.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cancellation::Cancellation;
use crate::error::RetryError;

/// Decides whether and when to retry a failed operation.
///
/// `attempt` counts the failures observed since the policy was last reset,
/// starting at 1 for the first failure.
pub trait RetryPolicy: Send {
    /// Delay before the next attempt, or `None` to give up.
    fn next_delay(&mut self, attempt: u32, error: &(dyn Error + 'static)) -> Option<Duration>;

    /// Forget any state accumulated by earlier failures.
    ///
    /// Called after an operation makes progress, for example once a
    /// reverse call has been re-established.
    fn reset(&mut self) {}
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for Box<P> {
    fn next_delay(&mut self, attempt: u32, error: &(dyn Error + 'static)) -> Option<Duration> {
        (**self).next_delay(attempt, error)
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

/// Exponential backoff: `initial`, doubling per failure, capped at `max`.
///
/// Defaults to 1 second doubling up to 30 seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ExponentialBackoff {
    /// Backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32, _error: &(dyn Error + 'static)) -> Option<Duration> {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Always wait the same delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl RetryPolicy for FixedDelay {
    fn next_delay(&mut self, _attempt: u32, _error: &(dyn Error + 'static)) -> Option<Duration> {
        Some(self.0)
    }
}

/// Retry straight away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Immediate;

impl RetryPolicy for Immediate {
    fn next_delay(&mut self, _attempt: u32, _error: &(dyn Error + 'static)) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Gives up once `max` attempts have been made. See [`RetryPolicyExt::max_attempts`].
#[derive(Debug, Clone)]
pub struct MaxAttempts<P> {
    inner: P,
    max: u32,
}

impl<P: RetryPolicy> RetryPolicy for MaxAttempts<P> {
    fn next_delay(&mut self, attempt: u32, error: &(dyn Error + 'static)) -> Option<Duration> {
        if attempt >= self.max {
            return None;
        }
        self.inner.next_delay(attempt, error)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Gives up on errors the predicate rejects. See [`RetryPolicyExt::retry_if`].
#[derive(Debug, Clone)]
pub struct RetryIf<P, F> {
    inner: P,
    predicate: F,
}

impl<P, F> RetryPolicy for RetryIf<P, F>
where
    P: RetryPolicy,
    F: Fn(&(dyn Error + 'static)) -> bool + Send,
{
    fn next_delay(&mut self, attempt: u32, error: &(dyn Error + 'static)) -> Option<Duration> {
        if !(self.predicate)(error) {
            return None;
        }
        self.inner.next_delay(attempt, error)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Combinators available on every [`RetryPolicy`].
pub trait RetryPolicyExt: RetryPolicy + Sized {
    /// Run the operation at most `max` times in total.
    fn max_attempts(self, max: u32) -> MaxAttempts<Self> {
        MaxAttempts { inner: self, max }
    }

    /// Only retry errors for which `predicate` returns `true`.
    fn retry_if<F>(self, predicate: F) -> RetryIf<Self, F>
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send,
    {
        RetryIf {
            inner: self,
            predicate,
        }
    }
}

impl<P: RetryPolicy> RetryPolicyExt for P {}

/// Run `operation` until it succeeds, the policy gives up, or `cancellation`
/// fires.
///
/// An in-flight attempt is never interrupted; cancellation is observed
/// between attempts and while waiting out a delay. Once cancelled, the
/// result is always [`RetryError::Cancelled`].
pub async fn retry_with_policy<T, E, P, F, Fut>(
    policy: P,
    cancellation: &Cancellation,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    P: RetryPolicy,
    E: Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_reset(policy, cancellation, |_| operation()).await
}

/// Handed to every attempt of [`retry_with_reset`]. Calling
/// [`reset`](RetryReset::reset) marks the attempt as having made progress.
#[derive(Debug, Clone, Default)]
pub struct RetryReset(Arc<AtomicBool>);

impl RetryReset {
    /// Reset the policy and the attempt count once this attempt ends, so a
    /// failure after progress starts the backoff afresh.
    pub fn reset(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Like [`retry_with_policy`], but each attempt may call
/// [`RetryReset::reset`] to report progress. A failure that follows progress
/// is counted as the first failure of a fresh run of the policy.
pub async fn retry_with_reset<T, E, P, F, Fut>(
    mut policy: P,
    cancellation: &Cancellation,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    P: RetryPolicy,
    E: Error + 'static,
    F: FnMut(RetryReset) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let progress = RetryReset::default();
    let mut attempt = 0u32;
    loop {
        if cancellation.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let result = operation(progress.clone()).await;
        if progress.take() {
            policy.reset();
            attempt = 0;
        }
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if cancellation.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = policy.next_delay(attempt, &error) else {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: error,
            });
        };
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "operation failed, retrying"
        );
        wait_for_retry(delay, cancellation).await?;
    }
}

/// Sleep for `delay` unless `cancellation` fires first.
async fn wait_for_retry<E: Error + 'static>(
    delay: Duration,
    cancellation: &Cancellation,
) -> Result<(), RetryError<E>> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(RetryError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cancellation::CancellationSource;

    #[derive(Debug, thiserror::Error, PartialEq)]
    enum Flaky {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    fn transient() -> Flaky {
        Flaky::Transient
    }

    #[test]
    fn exponential_backoff_doubles_up_to_max() {
        let mut policy = ExponentialBackoff::default();
        let error = transient();
        let delays: Vec<_> = (1..=7)
            .map(|attempt| policy.next_delay(attempt, &error))
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(16)),
                Some(Duration::from_secs(30)),
                Some(Duration::from_secs(30)),
            ]
        );
    }

    #[test]
    fn exponential_backoff_saturates_for_huge_attempts() {
        let mut policy = ExponentialBackoff::default();
        assert_eq!(
            policy.next_delay(u32::MAX, &transient()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn max_attempts_counts_total_runs() {
        let mut policy = Immediate.max_attempts(3);
        let error = transient();
        assert_eq!(policy.next_delay(1, &error), Some(Duration::ZERO));
        assert_eq!(policy.next_delay(2, &error), Some(Duration::ZERO));
        assert_eq!(policy.next_delay(3, &error), None);
    }

    #[test]
    fn retry_if_gives_up_on_rejected_errors() {
        let mut policy = FixedDelay(Duration::from_millis(5)).retry_if(|error| {
            error
                .downcast_ref::<Flaky>()
                .is_some_and(|flaky| *flaky == Flaky::Transient)
        });
        assert_eq!(
            policy.next_delay(1, &Flaky::Transient),
            Some(Duration::from_millis(5))
        );
        assert_eq!(policy.next_delay(1, &Flaky::Fatal), None);
    }

    #[test]
    fn boxed_policy_delegates() {
        let mut policy: Box<dyn RetryPolicy> = Box::new(Immediate.max_attempts(1));
        assert_eq!(policy.next_delay(1, &transient()), None);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_policy(Immediate, &Cancellation::none(), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky::Transient)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_carries_last_error_and_attempts() {
        let result: Result<(), _> =
            retry_with_policy(Immediate.max_attempts(4), &Cancellation::none(), || async {
                Err(Flaky::Transient)
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source, Flaky::Transient);
            }
            other => panic!("expected Exhausted, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_delay_wins() {
        let source = CancellationSource::new();
        let cancellation = source.token();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let task = tokio::spawn(async move {
            retry_with_policy(
                FixedDelay(Duration::from_secs(60)),
                &cancellation,
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Flaky::Transient) }
                },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("retry loop should stop promptly")
            .expect("task should not panic");
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_resets_the_attempt_count() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Flaky>> =
            retry_with_reset(Immediate.max_attempts(2), &Cancellation::none(), |progress| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 5 {
                        progress.reset();
                    }
                    Err(Flaky::Transient)
                }
            })
            .await;

        // The fifth call made progress and starts a fresh run of two.
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn already_cancelled_never_runs_operation() {
        let source = CancellationSource::new();
        source.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Flaky>> =
            retry_with_policy(Immediate, &source.token(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky::Transient) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
