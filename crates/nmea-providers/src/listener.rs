//! Listener framework.
//!
//! A [`Transport`] owns one read loop; a [`Listener`] is the handle to that
//! loop once it runs as a tokio task. Transports never validate anything
//! themselves: every framed line goes to the [`SentenceSink`] carried by the
//! [`ListenerContext`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nmea_core::{RawFrame, Source};

use crate::error::ListenerError;
use crate::stop::{Bounded, StopSignal, READ_TIMEOUT};

/// How long [`Listener::shutdown`] waits before aborting the task.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Receiver of framed lines.
///
/// Implementations must return quickly; they run on the listener's task.
pub trait SentenceSink: Send + Sync + 'static {
    fn ingest(&self, frame: RawFrame);
}

/// Everything a transport needs while running.
#[derive(Clone)]
pub struct ListenerContext {
    source: Source,
    sink: Arc<dyn SentenceSink>,
    stop: StopSignal,
}

impl ListenerContext {
    /// Create a context whose stop signal is a child of `shutdown`.
    pub fn new(source: Source, sink: Arc<dyn SentenceSink>, shutdown: &StopSignal) -> Self {
        Self {
            source,
            sink,
            stop: shutdown.child(),
        }
    }

    /// Context for a nested listener, stopped together with this one.
    pub fn child(&self, source: Source) -> Self {
        Self {
            source,
            sink: self.sink.clone(),
            stop: self.stop.child(),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn sink(&self) -> &Arc<dyn SentenceSink> {
        &self.sink
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_triggered()
    }

    /// Forward one framed line.
    pub fn emit_line(&self, line: &[u8]) {
        self.sink.ingest(RawFrame::new(self.source, line));
    }

    /// Race a read against the stop signal and [`READ_TIMEOUT`].
    pub async fn bounded<F: Future>(&self, fut: F) -> Bounded<F::Output> {
        self.stop.within(READ_TIMEOUT, fut).await
    }

    /// Race `fut` against the stop signal and a custom limit.
    pub async fn within<F: Future>(&self, limit: Duration, fut: F) -> Bounded<F::Output> {
        self.stop.within(limit, fut).await
    }

    /// Stop-aware sleep; `false` means the listener should exit.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.stop.sleep(duration).await
    }
}

impl fmt::Debug for ListenerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContext")
            .field("source", &self.source)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Why a listener task ended.
#[derive(Debug)]
pub enum ListenerExit {
    /// A stop signal fired.
    Stopped,
    /// The transport gave up; the manager may restart it later.
    Failed(ListenerError),
    /// The task ignored its stop signal and was aborted.
    Aborted,
}

impl ListenerExit {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ListenerExit::Stopped)
    }
}

impl fmt::Display for ListenerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerExit::Stopped => f.write_str("stopped"),
            ListenerExit::Failed(e) => write!(f, "failed: {e}"),
            ListenerExit::Aborted => f.write_str("aborted"),
        }
    }
}

/// One read loop strategy (serial, UDP, TCP, Bluetooth discovery).
pub trait Transport: Send + 'static {
    /// Human-readable label for logs.
    fn describe(&self) -> String;

    /// Run until the context's stop signal fires or the resource fails.
    fn run(self, ctx: ListenerContext) -> impl Future<Output = ListenerExit> + Send;
}

/// Handle to a running transport task.
#[derive(Debug)]
pub struct Listener {
    name: String,
    stop: StopSignal,
    task: JoinHandle<ListenerExit>,
}

impl Listener {
    /// Spawn `transport` on the current runtime.
    pub fn start<T: Transport>(transport: T, ctx: ListenerContext) -> Self {
        let name = transport.describe();
        let stop = ctx.stop_signal().clone();
        debug!("Starting listener: {}", name);
        let task = tokio::spawn(transport.run(ctx));
        Self { name, stop, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop without waiting for it.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the task, aborting it after `limit`.
    pub async fn join(self, limit: Duration) -> ListenerExit {
        let Listener { name, mut task, .. } = self;
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => ListenerExit::Failed(ListenerError::Panicked(e.to_string())),
            Err(_) => {
                warn!("Listener {} did not stop within {:?}, aborting", name, limit);
                task.abort();
                ListenerExit::Aborted
            }
        }
    }

    /// Stop and join with [`JOIN_TIMEOUT`].
    pub async fn shutdown(self) -> ListenerExit {
        self.stop();
        self.join(JOIN_TIMEOUT).await
    }
}
