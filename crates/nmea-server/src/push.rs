//! WebSocket push server.
//!
//! Subscribers connect over WebSocket and receive:
//! - One `nmea_history` event with recent formatted history
//! - Every live `nmea_data` and `nmea_data_web` event
//! - `status` / `history` replies to their requests

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use nmea_protocol::{
    decode_client_request, encode_push_event, format_entries, ClientRequest, CodecError,
    HistoryResponse, PushEvent,
};
use nmea_providers::StopSignal;

use crate::emission::BroadcastPublisher;
use crate::lifecycle::ConnectionManager;

/// History entries sent to a new subscriber.
pub const BACKFILL_ENTRIES: usize = 10;

/// Errors from the push server and its connections.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Accepts subscribers and forwards events to them.
pub struct PushServer {
    listener: TcpListener,
    publisher: BroadcastPublisher,
    manager: Arc<ConnectionManager>,
}

impl PushServer {
    /// Bind the server socket.
    pub async fn bind(
        addr: SocketAddr,
        publisher: BroadcastPublisher,
        manager: Arc<ConnectionManager>,
    ) -> Result<Self, PushError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            publisher,
            manager,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PushError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` fires.
    pub async fn run(self, stop: StopSignal) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Push server listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = stop.wait() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let events = self.publisher.subscribe();
                        let manager = self.manager.clone();
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, events, manager, stop).await {
                                debug!("Subscriber {} closed with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept subscriber: {}", e),
                },
            }
        }
        info!("Push server stopped");
    }
}

/// Serve one subscriber.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    mut events: broadcast::Receiver<PushEvent>,
    manager: Arc<ConnectionManager>,
    stop: StopSignal,
) -> Result<(), PushError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("Subscriber connected: {}", addr);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let backfill = manager.state().emitter().get_history(BACKFILL_ENTRIES);
    if !backfill.is_empty() {
        let event = PushEvent::NmeaHistory(format_entries(&backfill));
        ws_tx.send(Message::Text(encode_push_event(&event)?)).await?;
        debug!("Sent {} history entries to {}", backfill.len(), addr);
    }

    loop {
        tokio::select! {
            _ = stop.wait() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    ws_tx.send(Message::Text(encode_push_event(&event)?)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber {} lagged, skipped {} events", addr, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = answer(&text, &manager) {
                        ws_tx.send(Message::Text(encode_push_event(&reply)?)).await?;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws_tx.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", addr, e);
                    break;
                }
            },
        }
    }

    info!("Subscriber disconnected: {}", addr);
    Ok(())
}

fn answer(text: &str, manager: &ConnectionManager) -> Option<PushEvent> {
    match decode_client_request(text) {
        Ok(ClientRequest::RequestStatus) => Some(PushEvent::Status(manager.get_status())),
        Ok(ClientRequest::RequestHistory { count }) => {
            let emitter = manager.state().emitter();
            let entries = emitter.get_history(count);
            Some(PushEvent::History(HistoryResponse::new(&entries, emitter.history_len())))
        }
        Err(e) => {
            debug!("Ignoring subscriber message: {}", e);
            None
        }
    }
}
