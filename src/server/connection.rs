//! Viewer connection
//!
//! Each accepted socket runs one reader loop (this task) and one writer task
//! draining the connection's outbound queue. The hub only ever sees the
//! queue's sending half.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::hub::{ConnectionId, HubError, LiveViewHub};
use crate::server::config::ServerConfig;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One viewer connection
pub struct Connection {
    id: ConnectionId,
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    hub: Arc<LiveViewHub>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    /// Wrap an accepted socket
    pub fn new(
        id: ConnectionId,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        hub: Arc<LiveViewHub>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            socket,
            peer_addr,
            config,
            hub,
            shutdown,
        }
    }

    /// Perform the WebSocket handshake and serve until either side closes
    pub async fn run(self) -> Result<()> {
        let Connection {
            id,
            socket,
            peer_addr,
            config,
            hub,
            mut shutdown,
        } = self;

        let ws = match timeout(config.handshake_timeout, tokio_tungstenite::accept_async(socket)).await {
            Ok(ws) => ws?,
            Err(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "WebSocket handshake timed out",
                )))
            }
        };
        tracing::debug!(conn = id, peer = %peer_addr, "WebSocket established");

        let (sink, mut stream) = ws.split();
        let (outbox, outbound) = mpsc::channel(config.outbound_capacity);
        let writer = tokio::spawn(write_loop(id, sink, outbound));

        hub.connect(id, outbox).await;

        let result = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => hub.handle_text(id, text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => hub.reply_error(id, &HubError::InvalidMessage).await,
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    // ping/pong is answered by the transport
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(Error::from(e)),
                },
                _ = shutdown.changed() => {
                    tracing::debug!(conn = id, "Closing for shutdown");
                    break Ok(());
                }
            }
        };

        // releases every outbox clone, which lets the writer finish
        hub.disconnect(id).await;
        let _ = writer.await;

        result
    }
}

/// Forward queued messages to the socket, then close it
async fn write_loop(id: ConnectionId, mut sink: WsSink, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(conn = id, error = %e, "Write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
