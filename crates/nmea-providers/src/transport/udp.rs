//! UDP listeners.
//!
//! Both roles receive datagrams; they differ in what they bind and which
//! senders they accept. Each datagram is split on newlines so a talker that
//! batches several sentences per packet is handled too.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::framing::split_datagram;
use crate::listener::{ListenerContext, ListenerExit, Transport};
use crate::stop::Bounded;

const MAX_DATAGRAM: usize = 65_535;

/// Receive errors in a row after which the socket is given up.
pub const MAX_RECEIVE_ERRORS: u32 = 20;

const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Where datagrams come from; the receive loop only needs this.
pub(crate) trait Datagrams: Send + Sync {
    fn recv_datagram(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Datagrams for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Binds a local address and accepts datagrams from anyone.
#[derive(Debug, Clone)]
pub struct UdpServerTransport {
    addr: SocketAddr,
}

impl UdpServerTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Transport for UdpServerTransport {
    fn describe(&self) -> String {
        format!("udp server on {}", self.addr)
    }

    async fn run(self, ctx: ListenerContext) -> ListenerExit {
        let socket = match UdpSocket::bind(self.addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("UDP server could not bind {}: {}", self.addr, e);
                return ListenerExit::Failed(ListenerError::Bind {
                    addr: self.addr.to_string(),
                    source: e,
                });
            }
        };
        info!("UDP server listening on {}", self.addr);
        receive_loop(&socket, &ctx, None).await
    }
}

/// Receives broadcast traffic on a port, optionally from one sender only.
#[derive(Debug, Clone)]
pub struct UdpClientTransport {
    port: u16,
    sender: Option<IpAddr>,
}

impl UdpClientTransport {
    pub fn new(port: u16, sender: Option<IpAddr>) -> Self {
        Self { port, sender }
    }
}

impl Transport for UdpClientTransport {
    fn describe(&self) -> String {
        match self.sender {
            Some(ip) => format!("udp client on port {} from {}", self.port, ip),
            None => format!("udp client on port {}", self.port),
        }
    }

    async fn run(self, ctx: ListenerContext) -> ListenerExit {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("UDP client could not bind {}: {}", addr, e);
                return ListenerExit::Failed(ListenerError::Bind {
                    addr: addr.to_string(),
                    source: e,
                });
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!("UDP client could not enable broadcast: {}", e);
        }
        info!("UDP client receiving on port {}", self.port);
        receive_loop(&socket, &ctx, self.sender).await
    }
}

async fn receive_loop<D: Datagrams>(socket: &D, ctx: &ListenerContext, sender: Option<IpAddr>) -> ListenerExit {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut errors = 0u32;
    loop {
        match ctx.bounded(socket.recv_datagram(&mut buf)).await {
            Bounded::Stopped => return ListenerExit::Stopped,
            Bounded::TimedOut => continue,
            Bounded::Ready(Ok((n, peer))) => {
                errors = 0;
                if sender.is_some_and(|expected| expected != peer.ip()) {
                    debug!("Ignoring datagram from {}", peer);
                    continue;
                }
                for line in split_datagram(&buf[..n]) {
                    ctx.emit_line(line);
                }
            }
            // ICMP port-unreachable and similar surface here; keep receiving.
            Bounded::Ready(Err(e)) => {
                errors += 1;
                if errors >= MAX_RECEIVE_ERRORS {
                    warn!("UDP receive failing repeatedly, giving up: {}", e);
                    return ListenerExit::Failed(ListenerError::TooManyErrors(errors));
                }
                debug!("UDP receive error: {}", e);
                if !ctx.sleep(RECEIVE_ERROR_PAUSE).await {
                    return ListenerExit::Stopped;
                }
            }
        }
    }
}
