//! # nmea-server
//!
//! NMEA relay engine.
//!
//! This crate ties the listeners to the push channel:
//! - [`IngestPipeline`]: the sink every listener writes into (filter,
//!   statistics, emission)
//! - [`Emitter`]: history buffer, rate limiter and circuit breaker in front
//!   of a [`Publisher`]
//! - [`ConnectionManager`]: starts, restarts and stops listeners to match
//!   the configuration
//! - [`ConfigWatcher`]: reloads the configuration file and reconciles
//! - [`PushServer`]: WebSocket endpoint for subscribers
//!
//! ## Usage
//!
//! ```rust,ignore
//! let publisher = BroadcastPublisher::default();
//! let state = Arc::new(EngineState::new(config, Arc::new(publisher.clone())));
//! let manager = Arc::new(ConnectionManager::new(state, DefaultLauncher::default()));
//! manager.reconcile().await;
//!
//! let server = PushServer::bind(addr, publisher, manager.clone()).await?;
//! tokio::spawn(server.run(manager.state().shutdown_signal().clone()));
//! ```

pub mod emission;
pub mod lifecycle;
pub mod pipeline;
pub mod push;
pub mod state;
pub mod statistics;
pub mod watcher;

pub use emission::{BroadcastPublisher, Emitter, PublishError, PublishOutcome, Publisher};
pub use lifecycle::{ConnectionManager, DefaultLauncher, ListenerLauncher, ReconcileReport, RunningListener};
pub use pipeline::IngestPipeline;
pub use push::{PushError, PushServer, BACKFILL_ENTRIES};
pub use state::EngineState;
pub use statistics::{run_rate_updates, StatisticsCollector};
pub use watcher::ConfigWatcher;

// Re-export commonly used types
pub use nmea_core::{RelayConfig, Sentence, Source, TransportKind};
pub use nmea_protocol::{PushEvent, StatusSnapshot};
