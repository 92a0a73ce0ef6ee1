//! Relay statistics collection.
//!
//! Counters are updated lock-free from listener tasks and read by the
//! status snapshot:
//! - Accepted sentences and rejections by reason
//! - Publish outcomes (published, rate limited, breaker rejected, failed)
//! - Sentence rate over the last window
//! - Uptime

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nmea_core::Rejection;
use nmea_protocol::RelayStatistics;
use nmea_providers::StopSignal;

/// Collects and tracks relay statistics.
pub struct StatisticsCollector {
    start_time: Instant,

    accepted: AtomicU64,
    rejected_empty: AtomicU64,
    rejected_not_nmea: AtomicU64,
    rejected_denied: AtomicU64,
    rejected_checksum: AtomicU64,

    published: AtomicU64,
    rate_limited: AtomicU64,
    breaker_rejected: AtomicU64,
    publish_failures: AtomicU64,

    /// Accepted sentences in the current measurement window.
    window_sentences: AtomicU64,

    /// Last calculated sentence rate.
    sentence_rate: AtomicU64, // Stored as f64 bits
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted: AtomicU64::new(0),
            rejected_empty: AtomicU64::new(0),
            rejected_not_nmea: AtomicU64::new(0),
            rejected_denied: AtomicU64::new(0),
            rejected_checksum: AtomicU64::new(0),
            published: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            breaker_rejected: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            window_sentences: AtomicU64::new(0),
            sentence_rate: AtomicU64::new(0),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.window_sentences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: Rejection) {
        let counter = match reason {
            Rejection::Empty => &self.rejected_empty,
            Rejection::NotNmea => &self.rejected_not_nmea,
            Rejection::Denied => &self.rejected_denied,
            Rejection::BadChecksum => &self.rejected_checksum,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejected(&self) {
        self.breaker_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the sentence rate (call once per second).
    pub fn update_rate(&self) {
        let window = self.window_sentences.swap(0, Ordering::Relaxed);
        self.sentence_rate
            .store((window as f64).to_bits(), Ordering::Relaxed);
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self) -> RelayStatistics {
        RelayStatistics {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_empty: self.rejected_empty.load(Ordering::Relaxed),
            rejected_not_nmea: self.rejected_not_nmea.load(Ordering::Relaxed),
            rejected_denied: self.rejected_denied.load(Ordering::Relaxed),
            rejected_checksum: self.rejected_checksum.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            breaker_rejected: self.breaker_rejected.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            sentence_rate: f64::from_bits(self.sentence_rate.load(Ordering::Relaxed)),
            uptime: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh the sentence rate once per second until `stop` fires.
pub async fn run_rate_updates(stats: Arc<StatisticsCollector>, stop: StopSignal) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = ticker.tick() => stats.update_rate(),
        }
    }
}
