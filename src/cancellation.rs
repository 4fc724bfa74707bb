//! Cooperative cancellation signals.
//!
//! A [`Cancellation`] answers one question: should the operation holding it
//! stop? It can be checked synchronously with [`Cancellation::is_cancelled`]
//! or awaited with [`Cancellation::cancelled`]. Signals are monotonic -- once
//! fired they stay fired -- and compose by union ([`Cancellation::any`]) or
//! carry a deadline ([`Cancellation::after`]).
//!
//! Signals are fired through a [`CancellationSource`]. Cancellation never
//! interrupts running code; holders observe it at their own suspension points.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// A boxed wait on a single trigger or deadline.
type Waiter = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Observable, composable stop signal.
///
/// `Clone` is cheap: clones observe the same underlying sources. The
/// [`Default`] value is [`Cancellation::none`], which never fires.
///
/// # Examples
///
/// ```
/// use eventfold_sdk::{Cancellation, CancellationSource};
///
/// let source = CancellationSource::new();
/// let cancellation = Cancellation::any([Cancellation::none(), source.token()]);
/// assert!(!cancellation.is_cancelled());
///
/// source.cancel();
/// assert!(cancellation.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    /// Watch receivers of every source this signal is derived from.
    triggers: Vec<watch::Receiver<bool>>,
    /// Earliest deadline among the timeouts this signal is derived from.
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A signal that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// A signal that fires once `duration` has elapsed.
    ///
    /// Durations too large to represent as a deadline never fire.
    pub fn after(duration: Duration) -> Self {
        Self {
            triggers: Vec::new(),
            deadline: Instant::now().checked_add(duration),
        }
    }

    /// A signal that fires as soon as any of `cancellations` fires.
    ///
    /// The union of no signals is [`Cancellation::none`].
    pub fn any(cancellations: impl IntoIterator<Item = Cancellation>) -> Self {
        let mut triggers = Vec::new();
        let mut deadline: Option<Instant> = None;
        for cancellation in cancellations {
            triggers.extend(cancellation.triggers);
            deadline = match (deadline, cancellation.deadline) {
                (Some(current), Some(other)) => Some(current.min(other)),
                (current, other) => current.or(other),
            };
        }
        Self { triggers, deadline }
    }

    /// Shorthand for the union of `self` and `other`.
    pub fn or(&self, other: &Cancellation) -> Self {
        Self::any([self.clone(), other.clone()])
    }

    /// Returns `true` if any source has fired or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
            || self.triggers.iter().any(|trigger| *trigger.borrow())
    }

    /// Wait until the signal fires.
    ///
    /// Completes immediately if it already has. Never completes for a signal
    /// whose sources can no longer fire.
    pub async fn cancelled(&self) {
        let mut waiters: Vec<Waiter> = self
            .triggers
            .iter()
            .cloned()
            .map(|trigger| Box::pin(wait_for_trigger(trigger)) as Waiter)
            .collect();
        if let Some(deadline) = self.deadline {
            waiters.push(Box::pin(tokio::time::sleep_until(deadline)));
        }
        if waiters.is_empty() {
            return std::future::pending().await;
        }

        std::future::poll_fn(|cx| {
            if waiters
                .iter_mut()
                .any(|waiter| waiter.as_mut().poll(cx).is_ready())
            {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// Resolve once `trigger` observes `true`; pend forever if its source is
/// dropped without firing.
async fn wait_for_trigger(mut trigger: watch::Receiver<bool>) {
    let fired = trigger.wait_for(|cancelled| *cancelled).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}

/// The firing side of a [`Cancellation`].
///
/// Dropping a source without calling [`cancel`](CancellationSource::cancel)
/// leaves its tokens unfired forever.
#[derive(Debug)]
pub struct CancellationSource {
    sender: watch::Sender<bool>,
}

impl CancellationSource {
    /// Create an unfired source.
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    /// A [`Cancellation`] that fires when this source is cancelled.
    pub fn token(&self) -> Cancellation {
        Cancellation {
            triggers: vec![self.sender.subscribe()],
            deadline: None,
        }
    }

    /// Fire the source. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns `true` once [`cancel`](CancellationSource::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn none_never_fires() {
        let cancellation = Cancellation::none();
        assert!(!cancellation.is_cancelled());
        let waited = tokio::time::timeout(SHORT, cancellation.cancelled()).await;
        assert!(waited.is_err(), "Cancellation::none must never complete");
    }

    #[tokio::test]
    async fn source_cancel_is_observed_synchronously_and_async() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
        tokio::time::timeout(SHORT, token.cancelled())
            .await
            .expect("cancelled() should complete after cancel()");
    }

    #[tokio::test]
    async fn cancellation_is_monotonic() {
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel();
        source.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[tokio::test]
    async fn waiter_is_woken_by_later_cancel() {
        let source = CancellationSource::new();
        let token = source.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        tokio::time::timeout(SHORT, waiter)
            .await
            .expect("waiter should wake up")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn any_fires_when_one_source_fires() {
        let first = CancellationSource::new();
        let second = CancellationSource::new();
        let union = Cancellation::any([first.token(), second.token()]);

        assert!(!union.is_cancelled());
        second.cancel();
        assert!(union.is_cancelled());
        tokio::time::timeout(SHORT, union.cancelled())
            .await
            .expect("union should fire");
    }

    #[tokio::test]
    async fn any_of_nothing_never_fires() {
        let union = Cancellation::any(Vec::new());
        assert!(!union.is_cancelled());
        assert!(
            tokio::time::timeout(SHORT, union.cancelled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn after_fires_once_duration_elapses() {
        let cancellation = Cancellation::after(Duration::from_millis(30));
        assert!(!cancellation.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), cancellation.cancelled())
            .await
            .expect("timeout cancellation should fire");
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn or_combines_timeout_and_source() {
        let source = CancellationSource::new();
        let combined = source.token().or(&Cancellation::after(Duration::from_millis(20)));

        tokio::time::timeout(Duration::from_secs(1), combined.cancelled())
            .await
            .expect("deadline should fire the union");
        assert!(!source.is_cancelled(), "union must not fire its sources");
    }

    #[tokio::test]
    async fn dropped_source_never_fires() {
        let token = {
            let source = CancellationSource::new();
            source.token()
        };
        assert!(!token.is_cancelled());
        assert!(
            tokio::time::timeout(SHORT, token.cancelled())
                .await
                .is_err()
        );
    }

    #[test]
    fn huge_timeout_never_fires() {
        let cancellation = Cancellation::after(Duration::MAX);
        assert!(!cancellation.is_cancelled());
    }
}
