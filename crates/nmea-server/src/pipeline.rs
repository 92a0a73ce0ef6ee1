//! Ingest pipeline: the sink every listener writes into.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use nmea_core::{RawFrame, Rejection, SentenceFilter};
use nmea_providers::SentenceSink;

use crate::emission::{Emitter, PublishOutcome};
use crate::statistics::StatisticsCollector;

/// Decodes, filters and emits framed lines.
pub struct IngestPipeline {
    filter: RwLock<SentenceFilter>,
    emitter: Arc<Emitter>,
    stats: Arc<StatisticsCollector>,
}

impl IngestPipeline {
    pub fn new(filter: SentenceFilter, emitter: Arc<Emitter>, stats: Arc<StatisticsCollector>) -> Self {
        Self {
            filter: RwLock::new(filter),
            emitter,
            stats,
        }
    }

    /// Swap the filter policy; in-flight lines finish with the old one.
    pub fn set_filter(&self, filter: SentenceFilter) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Run one frame through the filter and the emission path.
    pub fn process(&self, frame: RawFrame) -> Result<PublishOutcome, Rejection> {
        let (text, lossy) = frame.decode();
        if lossy {
            debug!("Dropped undecodable bytes from {}", frame.source);
        }

        let checked = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(frame.source, &text);

        match checked {
            Ok(sentence) => {
                self.stats.record_accepted();
                Ok(self.emitter.publish(&sentence))
            }
            Err(reason) => {
                self.stats.record_rejection(reason);
                debug!("Dropped line from {} ({}): {:?}", frame.source, reason, text.trim());
                Err(reason)
            }
        }
    }
}

impl SentenceSink for IngestPipeline {
    fn ingest(&self, frame: RawFrame) {
        let _ = self.process(frame);
    }
}
