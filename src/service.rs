//! Pipeline services
//!
//! A [`PipelineService`] owns one pipeline per configured camera for a single
//! pipeline kind. It starts them, logs everything they report and stops them
//! together on shutdown.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::AppConfig;
use crate::error::Result;
use crate::pipeline::{Pipeline, SegmentRecorder, StreamRelay};
use crate::process::profile::{RECORDER_KILL_GRACE, RELAY_KILL_GRACE};
use crate::process::{PipelineKind, ProcessEvent, ProcessState, RelaySettings};

/// Extra time allowed on top of the largest kill grace during `stop_all`
const STOP_SLACK: Duration = Duration::from_secs(2);

/// One running pipeline plus the task logging its events
struct Managed {
    pipeline: Box<dyn Pipeline>,
    grace: Duration,
    logger: JoinHandle<()>,
}

/// A set of pipelines of one kind, one per camera
pub struct PipelineService {
    kind: PipelineKind,
    pipelines: Vec<Managed>,
}

impl PipelineService {
    /// Start one relay per configured camera
    pub fn relays(config: &AppConfig, settings: &RelaySettings) -> Result<Self> {
        let mut service = Self::empty(PipelineKind::Relay);
        for camera in config.cameras() {
            let (relay, events) = StreamRelay::new(&camera, settings)?;
            service.add(Box::new(relay), events, RELAY_KILL_GRACE);
        }
        service.log_started();
        Ok(service)
    }

    /// Start one recorder per configured camera
    pub fn recorders(config: &AppConfig) -> Self {
        let mut service = Self::empty(PipelineKind::Recorder);
        for camera in config.cameras() {
            let (recorder, events) =
                SegmentRecorder::new(&camera, &config.output_dir, config.segment_time);
            service.add(Box::new(recorder), events, RECORDER_KILL_GRACE);
        }
        service.log_started();
        service
    }

    /// Create a service with no pipelines
    pub fn empty(kind: PipelineKind) -> Self {
        Self {
            kind,
            pipelines: Vec::new(),
        }
    }

    /// Start `pipeline` and take ownership of it
    ///
    /// `grace` is the pipeline's forced-kill window, used to bound `stop_all`.
    pub fn add(
        &mut self,
        pipeline: Box<dyn Pipeline>,
        events: mpsc::Receiver<ProcessEvent>,
        grace: Duration,
    ) {
        let logger = tokio::spawn(log_events(
            pipeline.name().to_string(),
            pipeline.kind(),
            events,
        ));
        pipeline.start();
        self.pipelines.push(Managed {
            pipeline,
            grace,
            logger,
        });
    }

    fn log_started(&self) {
        tracing::info!(
            kind = self.kind.label(),
            pipelines = self.pipelines.len(),
            "Pipeline service started"
        );
    }

    /// Pipeline kind managed by this service
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Number of managed pipelines
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the service manages no pipelines
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Camera name and current state of every pipeline
    pub fn states(&self) -> Vec<(String, ProcessState)> {
        self.pipelines
            .iter()
            .map(|m| (m.pipeline.name().to_string(), m.pipeline.state()))
            .collect()
    }

    /// Stop every pipeline and wait until each reports `Stopped`
    ///
    /// The wait is bounded by the largest grace window plus a little slack.
    /// Calling this again after it returned is a no-op.
    pub async fn stop_all(&mut self) {
        if self.pipelines.is_empty() {
            return;
        }

        tracing::info!(
            kind = self.kind.label(),
            pipelines = self.pipelines.len(),
            "Stopping pipelines"
        );

        for managed in &self.pipelines {
            managed.pipeline.stop();
        }

        let bound = self
            .pipelines
            .iter()
            .map(|m| m.grace)
            .max()
            .unwrap_or_default()
            + STOP_SLACK;

        for managed in self.pipelines.drain(..) {
            let mut state = managed.pipeline.watch_state();
            let stopped = matches!(
                timeout(bound, state.wait_for(|s| *s == ProcessState::Stopped)).await,
                Ok(Ok(_))
            );
            if !stopped {
                tracing::warn!(
                    camera = %managed.pipeline.name(),
                    kind = self.kind.label(),
                    "Pipeline did not report stopped in time"
                );
            }
            // the logger drains the final events once the pipeline is dropped
            drop(managed.pipeline);
            let _ = timeout(STOP_SLACK, managed.logger).await;
        }

        tracing::info!(kind = self.kind.label(), "All pipelines stopped");
    }
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("kind", &self.kind)
            .field("pipelines", &self.states())
            .finish()
    }
}

async fn log_events(
    camera: String,
    kind: PipelineKind,
    mut events: mpsc::Receiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Spawned { pid } => {
                tracing::debug!(camera = %camera, kind = kind.label(), pid = ?pid, "Pipeline running");
            }
            ProcessEvent::Error(failure) => {
                tracing::error!(camera = %camera, kind = kind.label(), error = %failure, "Pipeline error");
            }
            ProcessEvent::Stopped => {
                tracing::info!(camera = %camera, kind = kind.label(), "Pipeline stopped");
            }
            ProcessEvent::Frame(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraSource;
    use crate::pipeline::FrameExtractor;
    use crate::process::PipelineProfile;

    fn sleeper(name: &str) -> (FrameExtractor, mpsc::Receiver<ProcessEvent>) {
        let camera = CameraSource::new(name, "rtsp://unused");
        let profile = PipelineProfile::extractor(&camera.source)
            .program("sleep")
            .args(["30"])
            .kill_grace(Duration::from_millis(300));
        FrameExtractor::with_profile(&camera, profile)
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_every_pipeline() {
        let mut service = PipelineService::empty(PipelineKind::Extractor);
        for name in ["plate_0", "plate_1", "plate_2"] {
            let (pipeline, events) = sleeper(name);
            service.add(Box::new(pipeline), events, Duration::from_millis(300));
        }
        assert_eq!(service.len(), 3);

        // wait for the children to come up
        for _ in 0..50 {
            if service.states().iter().all(|(_, s)| *s == ProcessState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(service.states().iter().all(|(_, s)| *s == ProcessState::Running));

        service.stop_all().await;
        assert!(service.is_empty());

        // second call is a no-op
        service.stop_all().await;
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn test_relays_one_per_camera() {
        let config = AppConfig::new("plate", "rtmp://ingest/live/")
            .source("rtsp://cam/1", false)
            .source("rtsp://cam/2", true);

        let service = PipelineService::relays(&config, &RelaySettings::default()).unwrap();
        let names: Vec<_> = service.states().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["plate_0", "plate_1"]);
        assert_eq!(service.kind(), PipelineKind::Relay);
    }
}
