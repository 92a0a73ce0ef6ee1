//! Serial device listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::framing::LineFramer;
use crate::listener::{ListenerContext, ListenerExit, Transport};
use crate::stop::Bounded;
use crate::transport::is_transient;

/// Consecutive undecodable lines after which reads pause for a second.
pub const BACKOFF_AFTER_ERRORS: u32 = 10;

/// Consecutive read errors after which the listener gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 20;

const DECODE_PAUSE: Duration = Duration::from_secs(1);
const READ_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Readable byte stream opened from a device path.
pub type DeviceStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens serial devices.
///
/// The listener and the Bluetooth tester only need a byte stream, so tests
/// substitute in-memory readers here.
pub trait DeviceOpener: Send + Sync + 'static {
    fn open(&self, path: &str, baud_rate: u32) -> Result<DeviceStream, ListenerError>;
}

/// Opens real ports through `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialOpener;

impl DeviceOpener for TokioSerialOpener {
    fn open(&self, path: &str, baud_rate: u32) -> Result<DeviceStream, ListenerError> {
        let port = tokio_serial::new(path, baud_rate)
            .timeout(Duration::from_secs(1))
            .open_native_async()
            .map_err(|e| ListenerError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(port))
    }
}

/// What to do after a read or decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry,
    Pause,
    Abort,
}

/// Counts undecodable lines and read errors separately.
///
/// Garbage on the line only ever pauses the reader; only read errors can
/// end the listener.
#[derive(Debug, Default, Clone)]
pub struct ErrorTracker {
    decode: u32,
    read: u32,
}

impl ErrorTracker {
    /// Record an undecodable line. The count restarts after each pause.
    pub fn record_decode(&mut self) -> ErrorAction {
        self.decode += 1;
        if self.decode > BACKOFF_AFTER_ERRORS {
            self.decode = 0;
            ErrorAction::Pause
        } else {
            ErrorAction::Retry
        }
    }

    /// Record a failed read.
    pub fn record_read(&mut self) -> ErrorAction {
        self.read += 1;
        if self.read >= MAX_CONSECUTIVE_ERRORS {
            ErrorAction::Abort
        } else {
            ErrorAction::Retry
        }
    }

    pub fn decoded_line(&mut self) {
        self.decode = 0;
    }

    pub fn read_ok(&mut self) {
        self.read = 0;
    }

    pub fn read_errors(&self) -> u32 {
        self.read
    }
}

/// Reads lines from one serial device at a fixed baud rate.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    opener: Arc<dyn DeviceOpener>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32, opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            opener,
        }
    }
}

impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("serial {} @ {} bps", self.path, self.baud_rate)
    }

    async fn run(self, ctx: ListenerContext) -> ListenerExit {
        let mut port = match self.opener.open(&self.path, self.baud_rate) {
            Ok(port) => port,
            Err(e) => {
                warn!("Serial listener not started: {}", e);
                return ListenerExit::Failed(e);
            }
        };
        info!("Serial listener reading {} @ {} bps", self.path, self.baud_rate);

        let mut framer = LineFramer::default();
        let mut errors = ErrorTracker::default();
        let mut buf = [0u8; 1024];

        let exit = loop {
            match ctx.bounded(port.read(&mut buf)).await {
                Bounded::Stopped => break ListenerExit::Stopped,
                Bounded::TimedOut => continue,
                Bounded::Ready(Ok(0)) => {
                    break ListenerExit::Failed(ListenerError::Disconnected(self.path.clone()));
                }
                Bounded::Ready(Ok(n)) => {
                    errors.read_ok();
                    let mut pause = false;
                    for line in framer.push(&buf[..n]) {
                        if std::str::from_utf8(&line).is_ok() {
                            errors.decoded_line();
                        } else if errors.record_decode() == ErrorAction::Pause {
                            pause = true;
                        }
                        // The pipeline drops and counts what does not decode.
                        ctx.emit_line(&line);
                    }
                    if pause {
                        warn!("Too many undecodable lines on {}, pausing", self.path);
                        if !ctx.sleep(DECODE_PAUSE).await {
                            break ListenerExit::Stopped;
                        }
                    }
                }
                Bounded::Ready(Err(e)) if is_transient(&e) => continue,
                Bounded::Ready(Err(e)) => {
                    if errors.record_read() == ErrorAction::Abort {
                        warn!("Serial read error on {}: {}", self.path, e);
                        break ListenerExit::Failed(ListenerError::TooManyErrors(errors.read_errors()));
                    }
                    debug!("Serial read error on {}: {}", self.path, e);
                    if !ctx.sleep(READ_ERROR_PAUSE).await {
                        break ListenerExit::Stopped;
                    }
                }
            }
        };

        info!("Serial listener on {} {}", self.path, exit);
        exit
    }
}
