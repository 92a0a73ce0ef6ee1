//! Cooperative stop signals.
//!
//! Every listener owns a [`StopSignal`] that is a child of the process-wide
//! shutdown signal: triggering the parent stops every child, triggering a
//! child leaves its parent and siblings running. Read loops never wait on a
//! signal alone; they race it against a bounded read (see
//! [`ListenerContext::bounded`](crate::listener::ListenerContext::bounded)).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Upper bound on any single blocking read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a read raced against the stop signal and a timeout.
#[derive(Debug)]
pub enum Bounded<T> {
    Ready(T),
    TimedOut,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<StopSignal>,
}

/// Cloneable, hierarchical stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    /// Create a root signal.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<StopSignal>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, parent }),
        }
    }

    /// Create a signal that also fires when `self` fires.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.inner.tx.send_replace(true);
    }

    /// Whether this signal or any ancestor has fired.
    pub fn is_triggered(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .map_or(false, StopSignal::is_triggered)
    }

    /// Resolve once this signal or any ancestor fires.
    pub fn wait(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.inner.tx.subscribe();
            let own = async move {
                loop {
                    let fired = *rx.borrow_and_update();
                    if fired {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            };
            match &self.inner.parent {
                None => own.await,
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.wait() => {}
                    }
                }
            }
        })
    }

    /// Race `fut` against this signal and `limit`.
    pub async fn within<F: Future>(&self, limit: Duration, fut: F) -> Bounded<F::Output> {
        if self.is_triggered() {
            return Bounded::Stopped;
        }
        tokio::select! {
            biased;
            _ = self.wait() => Bounded::Stopped,
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(value) => Bounded::Ready(value),
                Err(_) => Bounded::TimedOut,
            },
        }
    }

    /// Sleep for `duration`; returns `false` if the signal fired first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_stops_child() {
        let root = StopSignal::new();
        let child = root.child();
        let sibling = root.child();

        child.trigger();
        assert!(child.is_triggered());
        assert!(!sibling.is_triggered());
        assert!(!root.is_triggered());

        root.trigger();
        assert!(sibling.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), sibling.wait())
            .await
            .expect("sibling should observe parent stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let signal = StopSignal::new();
        let outcome = signal
            .within(READ_TIMEOUT, std::future::pending::<()>())
            .await;
        assert!(matches!(outcome, Bounded::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let signal = StopSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        assert!(!signal.sleep(Duration::from_secs(60)).await);
        assert!(matches!(
            signal.within(READ_TIMEOUT, async { 1 }).await,
            Bounded::Stopped
        ));
    }
}
