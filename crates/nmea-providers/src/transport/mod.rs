//! Transport implementations.

pub mod serial;
pub mod tcp;
pub mod udp;

pub use serial::{DeviceOpener, DeviceStream, SerialTransport, TokioSerialOpener};
pub use tcp::{Backoff, TcpClientTransport, TcpServerTransport};
pub use udp::{UdpClientTransport, UdpServerTransport};

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::framing::LineFramer;
use crate::listener::ListenerContext;
use crate::stop::Bounded;

/// How a line-oriented stream ended.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    Stopped,
    Closed,
    Failed(io::Error),
}

/// Read `stream` line by line into the context's sink until it ends.
pub(crate) async fn pump_lines<R>(mut stream: R, ctx: &ListenerContext) -> StreamEnd
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::default();
    let mut buf = [0u8; 1024];
    loop {
        match ctx.bounded(stream.read(&mut buf)).await {
            Bounded::Stopped => return StreamEnd::Stopped,
            Bounded::TimedOut => continue,
            Bounded::Ready(Ok(0)) => return StreamEnd::Closed,
            Bounded::Ready(Ok(n)) => {
                for line in framer.push(&buf[..n]) {
                    ctx.emit_line(&line);
                }
            }
            Bounded::Ready(Err(e)) if is_transient(&e) => continue,
            Bounded::Ready(Err(e)) => return StreamEnd::Failed(e),
        }
    }
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
