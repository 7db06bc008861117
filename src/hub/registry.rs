//! Per-camera extractor registry
//!
//! One entry per watched camera: the running [`FrameExtractor`] and the
//! outboxes of the connections subscribed to it. An entry exists exactly as
//! long as its subscriber set is non-empty; removing the last subscriber
//! stops the extractor and drops the entry in the same critical section.
//!
//! The map lock is taken for writing only by membership changes. Fan-out
//! takes it for reading and then locks the single entry it targets, so
//! frames for unrelated cameras never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::ServerMessage;
use crate::config::CameraSource;
use crate::pipeline::{FrameExtractor, Pipeline};
use crate::process::{PipelineProfile, ProcessEvent, ProcessState};

/// Identifier the transport assigns to each viewer connection
pub type ConnectionId = u64;

/// Sending half of a connection's outbound queue
pub type Outbox = mpsc::Sender<Message>;

/// Entry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    /// Connections currently subscribed
    pub subscribers: usize,
    /// State of the entry's extractor
    pub extractor_state: ProcessState,
    /// Frames handed to subscriber queues
    pub frames_sent: u64,
    /// Frames dropped because a subscriber queue was full
    pub frames_dropped: u64,
}

struct ExtractorEntry {
    generation: u64,
    extractor: FrameExtractor,
    subscribers: HashMap<ConnectionId, Outbox>,
    frames_sent: u64,
    frames_dropped: u64,
}

/// Extractor created by [`ExtractorRegistry::add_subscriber`]
///
/// The caller owns the event stream and must route it back through
/// [`fan_out`](ExtractorRegistry::fan_out) and
/// [`teardown`](ExtractorRegistry::teardown) with this generation.
pub struct CreatedExtractor {
    /// Identity of the new entry
    pub generation: u64,
    /// Events from the new extractor
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Registry of running extractors keyed by camera name
#[derive(Default)]
pub struct ExtractorRegistry {
    entries: RwLock<HashMap<String, Arc<Mutex<ExtractorEntry>>>>,
    next_generation: AtomicU64,
}

impl ExtractorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the subscribers of `camera`
    ///
    /// Creates and starts an extractor from `profile` when the camera has no
    /// entry yet. Returns the new subscriber count and, if an entry was
    /// created, its event stream.
    pub async fn add_subscriber(
        &self,
        camera: &CameraSource,
        conn: ConnectionId,
        outbox: Outbox,
        profile: impl FnOnce() -> PipelineProfile,
    ) -> (usize, Option<CreatedExtractor>) {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get(&camera.name) {
            let mut entry = entry.lock().await;
            entry.subscribers.insert(conn, outbox);
            let count = entry.subscribers.len();

            tracing::info!(camera = %camera.name, subscribers = count, "Subscriber added");
            return (count, None);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (extractor, events) = FrameExtractor::with_profile(camera, profile());
        extractor.start();

        let mut subscribers = HashMap::new();
        subscribers.insert(conn, outbox);
        let entry = ExtractorEntry {
            generation,
            extractor,
            subscribers,
            frames_sent: 0,
            frames_dropped: 0,
        };
        entries.insert(camera.name.clone(), Arc::new(Mutex::new(entry)));

        tracing::info!(
            camera = %camera.name,
            generation = generation,
            "Extractor started for first subscriber"
        );

        (1, Some(CreatedExtractor { generation, events }))
    }

    /// Remove `conn` from the subscribers of `camera`
    ///
    /// Stops the extractor and removes the entry when the last subscriber
    /// leaves. Returns the remaining count, or `None` if `conn` was not
    /// subscribed.
    pub async fn remove_subscriber(&self, camera: &str, conn: ConnectionId) -> Option<usize> {
        let mut entries = self.entries.write().await;
        let entry_arc = entries.get(camera).cloned()?;
        let mut entry = entry_arc.lock().await;

        entry.subscribers.remove(&conn)?;
        let remaining = entry.subscribers.len();

        if remaining == 0 {
            entry.extractor.stop();
            drop(entry);
            entries.remove(camera);
            tracing::info!(camera = %camera, "Last subscriber left, extractor stopped");
        } else {
            tracing::info!(camera = %camera, subscribers = remaining, "Subscriber removed");
        }

        Some(remaining)
    }

    /// Remove the entry for `camera` if it is still `generation`
    ///
    /// Stops its extractor and returns the subscribers it had. A stale
    /// generation (the entry was already replaced) is left untouched.
    pub async fn teardown(&self, camera: &str, generation: u64) -> Vec<(ConnectionId, Outbox)> {
        let mut entries = self.entries.write().await;
        let Some(entry_arc) = entries.get(camera).cloned() else {
            return Vec::new();
        };
        let mut entry = entry_arc.lock().await;
        if entry.generation != generation {
            return Vec::new();
        }

        entry.extractor.stop();
        let subscribers: Vec<_> = entry.subscribers.drain().collect();
        drop(entry);
        entries.remove(camera);

        tracing::warn!(
            camera = %camera,
            subscribers = subscribers.len(),
            "Extractor entry torn down"
        );
        subscribers
    }

    /// Deliver one image to every subscriber of `camera`
    ///
    /// Nothing is encoded when the entry is gone, belongs to another
    /// generation, or has no subscribers. Full outboxes drop the frame.
    pub async fn fan_out(&self, camera: &str, generation: u64, image: Bytes) -> usize {
        let entries = self.entries.read().await;
        let Some(entry_arc) = entries.get(camera) else {
            return 0;
        };
        let mut entry = entry_arc.lock().await;
        if entry.generation != generation || entry.subscribers.is_empty() {
            return 0;
        }

        let message = match ServerMessage::frame(camera, &image).to_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(camera = %camera, error = %e, "Failed to encode frame");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;
        for (conn, outbox) in &entry.subscribers {
            match outbox.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::trace!(camera = %camera, conn = conn, "Viewer queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        entry.frames_sent += delivered as u64;
        entry.frames_dropped += dropped;

        delivered
    }

    /// Remove every entry and return the extractors, already told to stop
    pub async fn drain(&self) -> Vec<FrameExtractor> {
        let mut entries = self.entries.write().await;
        let mut extractors = Vec::with_capacity(entries.len());

        for (camera, entry_arc) in entries.drain() {
            let entry = match Arc::try_unwrap(entry_arc) {
                Ok(entry) => entry.into_inner(),
                Err(shared) => {
                    // a fan-out still holds the entry; stop it in place
                    shared.lock().await.extractor.stop();
                    tracing::debug!(camera = %camera, "Entry still shared during drain");
                    continue;
                }
            };
            entry.extractor.stop();
            extractors.push(entry.extractor);
        }

        extractors
    }

    /// Statistics for one camera's entry
    pub async fn entry_stats(&self, camera: &str) -> Option<EntryStats> {
        let entries = self.entries.read().await;
        let entry = entries.get(camera)?.lock().await;
        Some(EntryStats {
            subscribers: entry.subscribers.len(),
            extractor_state: entry.extractor.state(),
            frames_sent: entry.frames_sent,
            frames_dropped: entry.frames_dropped,
        })
    }

    /// State receiver of a camera's extractor
    pub async fn watch_extractor(&self, camera: &str) -> Option<watch::Receiver<ProcessState>> {
        let entries = self.entries.read().await;
        let entry = entries.get(camera)?.lock().await;
        Some(entry.extractor.watch_state())
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no camera is being watched
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
