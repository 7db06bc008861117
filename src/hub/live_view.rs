//! Live-view hub
//!
//! Tracks viewer connections and their (at most one) subscription, and
//! creates or destroys one [`FrameExtractor`](crate::pipeline::FrameExtractor)
//! per watched camera through the [`ExtractorRegistry`].
//!
//! The hub never touches sockets: each connection hands in an [`Outbox`] and
//! the transport drains it. Frames are offered with `try_send` and dropped
//! for a full queue. Control replies and stream-error notices wait for queue
//! space, bounded by [`CONTROL_SEND_TIMEOUT`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use super::error::HubError;
use super::protocol::{ClientAction, ServerMessage, STREAM_ERROR_MESSAGE};
use super::registry::{ConnectionId, EntryStats, ExtractorRegistry, Outbox};
use crate::config::{AppConfig, CameraSource};
use crate::pipeline::Pipeline;
use crate::process::profile::EXTRACTOR_KILL_GRACE;
use crate::process::{PipelineFailure, PipelineProfile, ProcessEvent, ProcessState};

/// Extra time allowed on top of the extractor grace window at shutdown
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

/// How long a control message may wait for room in a viewer's queue
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds the profile for a camera's extractor
pub trait ExtractorFactory: Send + Sync + 'static {
    /// Profile used when the first viewer subscribes to `camera`
    fn profile(&self, camera: &CameraSource) -> PipelineProfile;
}

impl<F> ExtractorFactory for F
where
    F: Fn(&CameraSource) -> PipelineProfile + Send + Sync + 'static,
{
    fn profile(&self, camera: &CameraSource) -> PipelineProfile {
        self(camera)
    }
}

/// Default factory: MJPEG extraction with the transcoder on `PATH`
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegExtractors;

impl ExtractorFactory for FfmpegExtractors {
    fn profile(&self, camera: &CameraSource) -> PipelineProfile {
        PipelineProfile::extractor(&camera.source)
    }
}

/// One connected viewer
struct Viewer {
    outbox: Outbox,
    camera: Option<String>,
}

/// Live-view subscription hub
pub struct LiveViewHub {
    cameras: Vec<CameraSource>,
    factory: Box<dyn ExtractorFactory>,
    registry: ExtractorRegistry,
    viewers: Mutex<HashMap<ConnectionId, Viewer>>,
    closed: AtomicBool,
}

impl LiveViewHub {
    /// Create a hub serving the cameras in `config`
    pub fn new(config: &AppConfig) -> Arc<Self> {
        Self::with_factory(config.cameras(), FfmpegExtractors)
    }

    /// Create a hub with an explicit camera list and extractor factory
    pub fn with_factory(cameras: Vec<CameraSource>, factory: impl ExtractorFactory) -> Arc<Self> {
        Arc::new(Self {
            cameras,
            factory: Box::new(factory),
            registry: ExtractorRegistry::new(),
            viewers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Names of every configured camera
    pub fn camera_names(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.name.clone()).collect()
    }

    fn camera(&self, name: &str) -> Option<&CameraSource> {
        self.cameras.iter().find(|c| c.name == name)
    }

    /// Register a connection and send it the camera list
    pub async fn connect(&self, conn: ConnectionId, outbox: Outbox) {
        self.viewers.lock().await.insert(
            conn,
            Viewer {
                outbox: outbox.clone(),
                camera: None,
            },
        );
        tracing::debug!(conn = conn, "Viewer connected");

        let cameras = self.camera_names();
        send(&outbox, &ServerMessage::AvailableCameras { cameras }).await;
    }

    /// Handle one text message from `conn`
    pub async fn handle_text(self: &Arc<Self>, conn: ConnectionId, text: &str) {
        match ClientAction::parse(text) {
            Ok(ClientAction::Subscribe { camera_name }) => self.subscribe(conn, &camera_name).await,
            Ok(ClientAction::Unsubscribe) => self.unsubscribe(conn).await,
            Err(err) => {
                tracing::debug!(conn = conn, error = %err, "Rejected viewer message");
                self.reply_error(conn, &err).await;
            }
        }
    }

    /// Report a protocol error to `conn`
    pub async fn reply_error(&self, conn: ConnectionId, err: &HubError) {
        if let Some(outbox) = self.outbox(conn).await {
            send(&outbox, &ServerMessage::from_error(err)).await;
        }
    }

    /// Subscribe `conn` to `camera_name`, leaving any other camera first
    pub async fn subscribe(self: &Arc<Self>, conn: ConnectionId, camera_name: &str) {
        let (outbox, current) = {
            let viewers = self.viewers.lock().await;
            let Some(viewer) = viewers.get(&conn) else {
                return;
            };
            (viewer.outbox.clone(), viewer.camera.clone())
        };

        if current.as_deref() == Some(camera_name) {
            send(&outbox, &ServerMessage::Subscribed { camera: camera_name.to_string() }).await;
            return;
        }
        if current.is_some() {
            self.unsubscribe(conn).await;
        }

        let Some(camera) = self.camera(camera_name) else {
            tracing::warn!(conn = conn, camera = %camera_name, "Subscribe to unknown camera");
            let err = HubError::UnknownCamera(camera_name.to_string());
            send(&outbox, &ServerMessage::from_error(&err)).await;
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            let err = HubError::NotAvailable(camera_name.to_string());
            send(&outbox, &ServerMessage::from_error(&err)).await;
            return;
        }

        // record first so a concurrent teardown clears it
        if !self.set_camera(conn, Some(camera_name.to_string())).await {
            return;
        }
        // confirm before joining so the first frame cannot overtake it
        send(&outbox, &ServerMessage::Subscribed { camera: camera_name.to_string() }).await;

        let (count, created) = self
            .registry
            .add_subscriber(camera, conn, outbox.clone(), || self.factory.profile(camera))
            .await;
        if let Some(created) = created {
            tokio::spawn(forward_events(
                Arc::downgrade(self),
                camera.name.clone(),
                created.generation,
                created.events,
            ));
        }

        tracing::info!(conn = conn, camera = %camera_name, subscribers = count, "Viewer subscribed");

        // lost a race with shutdown; do not leave an extractor behind
        if self.closed.load(Ordering::Acquire) {
            self.leave(conn).await;
        }
    }

    /// Remove `conn`'s subscription and confirm it
    pub async fn unsubscribe(&self, conn: ConnectionId) {
        let Some(outbox) = self.outbox(conn).await else {
            return;
        };
        if let Some(camera) = self.leave(conn).await {
            send(&outbox, &ServerMessage::Unsubscribed { camera }).await;
        }
    }

    /// Forget `conn`; treated as an unsubscribe without a reply
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.leave(conn).await;
        self.viewers.lock().await.remove(&conn);
        tracing::debug!(conn = conn, "Viewer disconnected");
    }

    /// Clear the subscription of `conn`, returning the camera it had
    async fn leave(&self, conn: ConnectionId) -> Option<String> {
        let camera = {
            let mut viewers = self.viewers.lock().await;
            viewers.get_mut(&conn)?.camera.take()?
        };
        if let Some(remaining) = self.registry.remove_subscriber(&camera, conn).await {
            tracing::info!(conn = conn, camera = %camera, remaining = remaining, "Viewer unsubscribed");
        }
        Some(camera)
    }

    async fn set_camera(&self, conn: ConnectionId, camera: Option<String>) -> bool {
        match self.viewers.lock().await.get_mut(&conn) {
            Some(viewer) => {
                viewer.camera = camera;
                true
            }
            None => false,
        }
    }

    async fn outbox(&self, conn: ConnectionId) -> Option<Outbox> {
        self.viewers.lock().await.get(&conn).map(|v| v.outbox.clone())
    }

    /// Tear down a failed extractor and tell its subscribers
    ///
    /// Subscribers are not resubscribed; they have to ask again.
    async fn on_extractor_error(&self, camera: &str, generation: u64, failure: &PipelineFailure) {
        // entry removal and subscription clearing happen under one lock
        let notified = {
            let mut viewers = self.viewers.lock().await;
            let removed = self.registry.teardown(camera, generation).await;
            let notified: Vec<(ConnectionId, Outbox)> = removed
                .into_iter()
                .filter(|(conn, _)| match viewers.get_mut(conn) {
                    Some(viewer) if viewer.camera.as_deref() == Some(camera) => {
                        viewer.camera = None;
                        true
                    }
                    _ => false,
                })
                .collect();
            notified
        };
        if notified.is_empty() {
            return;
        }
        tracing::error!(
            camera = %camera,
            error = %failure,
            subscribers = notified.len(),
            "Extractor failed, dropping subscribers"
        );

        let notice = ServerMessage::Error {
            camera: Some(camera.to_string()),
            message: STREAM_ERROR_MESSAGE.to_string(),
        };
        join_all(notified.iter().map(|(conn, outbox)| {
            let notice = &notice;
            async move {
                if !send(outbox, notice).await {
                    tracing::warn!(conn = *conn, camera = %camera, "Stream error notice not delivered");
                }
            }
        }))
        .await;
    }

    /// Stop every extractor and refuse further subscriptions
    ///
    /// Waits until each extractor has stopped, bounded by its grace window.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let extractors = self.registry.drain().await;
        for viewer in self.viewers.lock().await.values_mut() {
            viewer.camera = None;
        }

        tracing::info!(extractors = extractors.len(), "Stopping live-view extractors");

        let bound = EXTRACTOR_KILL_GRACE + SHUTDOWN_SLACK;
        join_all(extractors.iter().map(|extractor| async move {
            if timeout(bound, extractor.process().wait_stopped()).await.is_err() {
                tracing::warn!(camera = %extractor.name(), "Extractor did not stop in time");
            }
        }))
        .await;

        tracing::info!("Live-view extractors stopped");
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Statistics for one camera's extractor entry
    pub async fn entry_stats(&self, camera: &str) -> Option<EntryStats> {
        self.registry.entry_stats(camera).await
    }

    /// Number of cameras with a running extractor
    pub async fn entry_count(&self) -> usize {
        self.registry.len().await
    }

    /// Camera `conn` is subscribed to
    pub async fn subscription(&self, conn: ConnectionId) -> Option<String> {
        self.viewers.lock().await.get(&conn)?.camera.clone()
    }

    /// Number of connected viewers
    pub async fn viewer_count(&self) -> usize {
        self.viewers.lock().await.len()
    }

    /// State receiver of a camera's extractor, if one is running
    pub async fn watch_extractor(&self, camera: &str) -> Option<watch::Receiver<ProcessState>> {
        self.registry.watch_extractor(camera).await
    }
}

/// Queue a control message, waiting at most [`CONTROL_SEND_TIMEOUT`]
///
/// Returns whether the message was queued. A closed outbox means the
/// connection is already going away.
async fn send(outbox: &Outbox, message: &ServerMessage) -> bool {
    let message = match message.to_message() {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode viewer message");
            return false;
        }
    };
    match timeout(CONTROL_SEND_TIMEOUT, outbox.send(message)).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            tracing::debug!("Viewer queue stayed full, control message dropped");
            false
        }
    }
}

/// Route one extractor's events into the hub until it stops or fails
async fn forward_events(
    hub: Weak<LiveViewHub>,
    camera: String,
    generation: u64,
    mut events: mpsc::Receiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        match event {
            ProcessEvent::Frame(image) => {
                hub.registry.fan_out(&camera, generation, image).await;
            }
            ProcessEvent::Error(failure) => {
                hub.on_extractor_error(&camera, generation, &failure).await;
                break;
            }
            ProcessEvent::Spawned { pid } => {
                tracing::debug!(camera = %camera, pid = ?pid, "Extractor running");
            }
            ProcessEvent::Stopped => break,
        }
    }
    tracing::trace!(camera = %camera, generation = generation, "Extractor forwarder finished");
}
