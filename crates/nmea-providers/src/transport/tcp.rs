//! TCP listeners.
//!
//! The server accepts one peer at a time and reads it until it hangs up.
//! The client dials out and keeps redialing with exponential backoff.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::listener::{ListenerContext, ListenerExit, Transport};
use crate::stop::Bounded;
use crate::transport::{pump_lines, StreamEnd};

/// Upper bound on one outbound connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential reconnect delay: base, doubling, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.base,
            Some(previous) => previous.saturating_mul(2).min(self.cap),
        };
        self.current = Some(delay);
        delay
    }

    /// Forget past failures after a successful connection.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

/// Listens on a local address, serving one connection at a time.
#[derive(Debug, Clone)]
pub struct TcpServerTransport {
    addr: SocketAddr,
}

impl TcpServerTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Transport for TcpServerTransport {
    fn describe(&self) -> String {
        format!("tcp server on {}", self.addr)
    }

    async fn run(self, ctx: ListenerContext) -> ListenerExit {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("TCP server could not bind {}: {}", self.addr, e);
                return ListenerExit::Failed(ListenerError::Bind {
                    addr: self.addr.to_string(),
                    source: e,
                });
            }
        };
        info!("TCP server listening on {}", self.addr);

        loop {
            match ctx.bounded(listener.accept()).await {
                Bounded::Stopped => return ListenerExit::Stopped,
                Bounded::TimedOut => continue,
                Bounded::Ready(Ok((stream, peer))) => {
                    info!("TCP peer connected: {}", peer);
                    match pump_lines(stream, &ctx).await {
                        StreamEnd::Stopped => return ListenerExit::Stopped,
                        StreamEnd::Closed => info!("TCP peer {} disconnected", peer),
                        StreamEnd::Failed(e) => warn!("TCP peer {} dropped: {}", peer, e),
                    }
                }
                Bounded::Ready(Err(e)) => {
                    warn!("TCP accept failed: {}", e);
                    if !ctx.sleep(Duration::from_millis(100)).await {
                        return ListenerExit::Stopped;
                    }
                }
            }
        }
    }
}

/// Connects to a remote talker and reconnects on failure.
#[derive(Debug, Clone)]
pub struct TcpClientTransport {
    host: String,
    port: u16,
    backoff: Backoff,
}

impl TcpClientTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Transport for TcpClientTransport {
    fn describe(&self) -> String {
        format!("tcp client to {}:{}", self.host, self.port)
    }

    async fn run(mut self, ctx: ListenerContext) -> ListenerExit {
        let target = format!("{}:{}", self.host, self.port);
        loop {
            match ctx.within(CONNECT_TIMEOUT, connect(&self.host, self.port)).await {
                Bounded::Stopped => return ListenerExit::Stopped,
                Bounded::TimedOut => warn!("TCP connect to {} timed out", target),
                Bounded::Ready(Err(e)) => warn!("TCP connect to {} failed: {}", target, e),
                Bounded::Ready(Ok(stream)) => {
                    info!("TCP client connected to {}", target);
                    self.backoff.reset();
                    match pump_lines(stream, &ctx).await {
                        StreamEnd::Stopped => return ListenerExit::Stopped,
                        StreamEnd::Closed => info!("TCP server {} closed the connection", target),
                        StreamEnd::Failed(e) => warn!("TCP connection to {} lost: {}", target, e),
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!("Reconnecting to {} in {:?}", target, delay);
            if !ctx.sleep(delay).await {
                return ListenerExit::Stopped;
            }
        }
    }
}

/// Resolve and connect with keep-alive enabled.
async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
    }))
}
