//! Live-view server listener
//!
//! Handles the TCP accept loop and spawns one [`Connection`] per viewer.
//!
//! Shutdown runs top-down: the hub stops every extractor, then each
//! connection is told to close (sending a WebSocket Close), and only then is
//! the listener dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;

use crate::error::Result;
use crate::hub::LiveViewHub;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// WebSocket server for live viewers
pub struct LiveViewServer {
    config: ServerConfig,
    hub: Arc<LiveViewHub>,
    listener: TcpListener,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl LiveViewServer {
    /// Bind the listener
    pub async fn bind(config: ServerConfig, hub: Arc<LiveViewHub>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        tracing::info!(addr = %listener.local_addr()?, "Live-view server listening");

        Ok(Self {
            config,
            hub,
            listener,
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub this server feeds
    pub fn hub(&self) -> &Arc<LiveViewHub> {
        &self.hub
    }

    /// Run the server until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (notify_tx, notify_rx) = watch::channel(false);
        // every connection task holds a clone; recv() yields None once all are gone
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = self.accept_loop(&notify_rx, &done_tx) => {}
        }

        self.hub.shutdown().await;

        let _ = notify_tx.send(true);
        drop(notify_rx);
        drop(done_tx);
        if timeout(self.config.close_timeout, done_rx.recv()).await.is_err() {
            tracing::warn!("Viewer connections did not close in time");
        }

        drop(self.listener);
        tracing::info!("Live-view server stopped");
        Ok(())
    }

    async fn accept_loop(&self, notify: &watch::Receiver<bool>, done: &mpsc::Sender<()>) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, notify.clone(), done.clone());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        notify: watch::Receiver<bool>,
        done: mpsc::Sender<()>,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(conn = id, peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let connection = Connection::new(
            id,
            socket,
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.hub),
            notify,
        );

        tokio::spawn(async move {
            let _permit = permit;
            let _done = done;

            if let Err(e) = connection.run().await {
                tracing::debug!(conn = id, error = %e, "Connection error");
            }

            tracing::debug!(conn = id, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::config::{AppConfig, CameraSource};
    use crate::hub::ServerMessage;
    use crate::process::PipelineProfile;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame_source(_: &CameraSource) -> PipelineProfile {
        PipelineProfile::extractor("rtsp://unused")
            .program("sh")
            .args([
                "-c",
                r"while :; do printf '\377\330img\377\331'; sleep 0.05; done",
            ])
            .kill_grace(Duration::from_millis(300))
    }

    fn hub() -> Arc<LiveViewHub> {
        let cameras = AppConfig::new("plate", "rtmp://ingest/live/")
            .source("rtsp://cam/0", false)
            .source("rtsp://cam/1", false)
            .source("rtsp://cam/2", false)
            .cameras();
        LiveViewHub::with_factory(cameras, frame_source)
    }

    async fn start(
        config: ServerConfig,
    ) -> (SocketAddr, Arc<LiveViewHub>, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let hub = hub();
        let server = LiveViewServer::bind(config.bind("127.0.0.1:0".parse().unwrap()), Arc::clone(&hub))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));
        (addr, hub, stop_tx, task)
    }

    async fn next_message(client: &mut Client) -> Option<ServerMessage> {
        loop {
            let message = tokio::time::timeout(WAIT, client.next())
                .await
                .expect("timed out waiting for message")?
                .ok()?;
            match message {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn send_json(client: &mut Client, json: &str) {
        client.send(Message::text(json.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_viewer_session_end_to_end() {
        let (addr, hub, stop_tx, task) = start(ServerConfig::default()).await;
        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        assert_eq!(
            next_message(&mut client).await,
            Some(ServerMessage::AvailableCameras {
                cameras: vec!["plate_0".into(), "plate_1".into(), "plate_2".into()]
            })
        );

        send_json(&mut client, r#"{"action":"subscribe","cameraName":"plate_0"}"#).await;
        assert_eq!(
            next_message(&mut client).await,
            Some(ServerMessage::Subscribed { camera: "plate_0".into() })
        );
        assert!(matches!(
            next_message(&mut client).await,
            Some(ServerMessage::Frame { ref camera, .. }) if camera == "plate_0"
        ));
        assert_eq!(hub.entry_stats("plate_0").await.unwrap().subscribers, 1);

        client.close(None).await.unwrap();

        // disconnect counts as unsubscribe
        for _ in 0..100 {
            if hub.entry_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.entry_count().await, 0);

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_binary_message_is_protocol_error() {
        let (addr, _hub, stop_tx, task) = start(ServerConfig::default()).await;
        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(matches!(
            next_message(&mut client).await,
            Some(ServerMessage::AvailableCameras { .. })
        ));

        client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(
            next_message(&mut client).await,
            Some(ServerMessage::Error {
                camera: None,
                message: "Invalid message format, expected JSON.".into(),
            })
        );

        // the connection is still usable
        send_json(&mut client, r#"{"action":"nope"}"#).await;
        assert!(matches!(
            next_message(&mut client).await,
            Some(ServerMessage::Error { .. })
        ));

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_extractors_and_closes_viewers() {
        let (addr, hub, stop_tx, task) = start(ServerConfig::default()).await;
        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        next_message(&mut client).await;

        send_json(&mut client, r#"{"action":"subscribe","cameraName":"plate_1"}"#).await;
        assert!(matches!(
            next_message(&mut client).await,
            Some(ServerMessage::Subscribed { .. })
        ));

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();

        assert!(hub.is_closed());
        assert_eq!(hub.entry_count().await, 0);
        assert_eq!(hub.viewer_count().await, 0);

        // drain until the server's close frame or the end of the stream
        let closed = tokio::time::timeout(WAIT, async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (addr, hub, stop_tx, task) = start(ServerConfig::default().max_connections(1)).await;

        let (mut first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        next_message(&mut first).await;
        assert_eq!(hub.viewer_count().await, 1);

        // the second socket is dropped before the handshake
        let second = connect_async(format!("ws://{}", addr)).await;
        assert!(second.is_err());

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
    }
}
