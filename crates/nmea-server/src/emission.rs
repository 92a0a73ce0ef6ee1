//! Emission path.
//!
//! Every accepted sentence goes into the history buffer first. Live fan-out
//! is then gated by the rate limiter and the circuit breaker, in that order.
//! Each guarded structure sits behind its own short-lived lock; none is held
//! while the publisher runs, and the publisher itself never blocks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use nmea_core::{
    CircuitBreaker, CircuitConfig, CircuitSnapshot, HistoryBuffer, HistoryEntry, RateLimiter, Sentence,
    DEFAULT_HISTORY_CAPACITY,
};
use nmea_protocol::PushEvent;

use crate::statistics::StatisticsCollector;

/// Errors reported by a [`Publisher`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The push channel is gone.
    #[error("Push channel closed")]
    Closed,

    /// The event could not be handed to the channel.
    #[error("Publish failed: {0}")]
    Failed(String),
}

/// Boundary to the push channel.
///
/// Implementations must not block; a slow channel should drop or fail
/// rather than stall the listener that produced the sentence.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, event: &PushEvent) -> Result<(), PublishError>;
}

/// Publisher backed by a tokio broadcast channel.
///
/// Having no subscribers is not a failure: events are simply dropped.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<PushEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, event: &PushEvent) -> Result<(), PublishError> {
        // `send` only errors when nobody is subscribed.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// What happened to one sentence on the emission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Both events reached the channel.
    Published,
    /// Kept in history, not pushed: over the per-second ceiling.
    RateLimited,
    /// Kept in history, not pushed: the breaker is open.
    BreakerOpen,
    /// Kept in history; the channel rejected an event.
    Failed,
    /// Empty or placeholder text; nothing recorded.
    Ignored,
}

/// History, rate limiter and circuit breaker in front of a [`Publisher`].
pub struct Emitter {
    history: Mutex<HistoryBuffer>,
    limiter: Mutex<RateLimiter>,
    breaker: Mutex<CircuitBreaker>,
    publisher: Arc<dyn Publisher>,
    stats: Arc<StatisticsCollector>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Emitter {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        stats: Arc<StatisticsCollector>,
        circuit: CircuitConfig,
        max_per_second: u32,
    ) -> Self {
        Self {
            history: Mutex::new(HistoryBuffer::new(DEFAULT_HISTORY_CAPACITY)),
            limiter: Mutex::new(RateLimiter::new(max_per_second)),
            breaker: Mutex::new(CircuitBreaker::new(circuit)),
            publisher,
            stats,
        }
    }

    /// Record `sentence` and push it to subscribers if the gates allow.
    pub fn publish(&self, sentence: &Sentence) -> PublishOutcome {
        self.publish_at(sentence, Instant::now())
    }

    /// [`publish`](Emitter::publish) with an explicit clock.
    pub fn publish_at(&self, sentence: &Sentence, now: Instant) -> PublishOutcome {
        let text = sentence.text.trim();
        if text.is_empty() || text == "undefined" {
            return PublishOutcome::Ignored;
        }

        lock(&self.history).push(HistoryEntry::from(sentence));

        if !lock(&self.limiter).try_acquire(now) {
            self.stats.record_rate_limited();
            return PublishOutcome::RateLimited;
        }

        if !lock(&self.breaker).allow(now) {
            self.stats.record_breaker_rejected();
            return PublishOutcome::BreakerOpen;
        }

        let result = PushEvent::for_sentence(sentence)
            .iter()
            .try_for_each(|event| self.publisher.publish(event));

        match result {
            Ok(()) => {
                lock(&self.breaker).record_success(now);
                self.stats.record_published();
                PublishOutcome::Published
            }
            Err(e) => {
                let mut breaker = lock(&self.breaker);
                breaker.record_failure(now);
                let snapshot = breaker.snapshot();
                drop(breaker);

                self.stats.record_publish_failure();
                if snapshot.state == nmea_core::CircuitState::Open {
                    warn!("Publish failed, circuit open after {} failures: {}", snapshot.failure_count, e);
                } else {
                    debug!("Publish failed: {}", e);
                }
                PublishOutcome::Failed
            }
        }
    }

    /// The `n` most recent history entries, oldest first.
    pub fn get_history(&self, n: usize) -> Vec<HistoryEntry> {
        lock(&self.history).recent(n)
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        lock(&self.breaker).snapshot()
    }

    /// Apply new breaker and rate limit tuning, keeping current state.
    pub fn reconfigure(&self, circuit: CircuitConfig, max_per_second: u32) {
        lock(&self.breaker).reconfigure(circuit);
        lock(&self.limiter).set_max_per_second(max_per_second);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Publisher that counts calls and can be told to fail.
    #[derive(Default)]
    pub struct FlakyPublisher {
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
        pub events: Mutex<Vec<PushEvent>>,
    }

    impl Publisher for FlakyPublisher {
        fn publish(&self, event: &PushEvent) -> Result<(), PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::Failed("injected".to_string()));
            }
            lock(&self.events).push(event.clone());
            Ok(())
        }
    }
}
