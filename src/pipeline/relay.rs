//! Low-bitrate push relay
//!
//! Re-encodes a camera feed to a small, latency-tuned stream and pushes it to
//! the camera's destination. The relay is the only variant with an activity
//! watchdog: a child that stops producing diagnostic output for the watchdog
//! window is recycled through the normal restart path.

use tokio::sync::mpsc;

use super::Pipeline;
use crate::config::CameraSource;
use crate::error::{Error, Result};
use crate::process::{PipelineProfile, ProcessEvent, RelaySettings, SupervisedProcess};

/// Relay pipeline for one camera
#[derive(Debug)]
pub struct StreamRelay {
    process: SupervisedProcess,
    destination: String,
}

impl StreamRelay {
    /// Create an idle relay for `camera`
    ///
    /// Fails if the camera has no relay destination.
    pub fn new(
        camera: &CameraSource,
        settings: &RelaySettings,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        let destination = camera.destination.as_deref().ok_or_else(|| {
            Error::Config(format!("camera {} has no relay destination", camera.name))
        })?;
        let profile = PipelineProfile::relay(&camera.source, destination, settings);
        Ok(Self::with_profile(camera, destination, profile))
    }

    /// Create a relay with an explicit profile
    pub fn with_profile(
        camera: &CameraSource,
        destination: impl Into<String>,
        profile: PipelineProfile,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (process, events) = SupervisedProcess::new(camera.name.clone(), profile);
        let relay = Self {
            process,
            destination: destination.into(),
        };
        (relay, events)
    }

    /// Push target
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl Pipeline for StreamRelay {
    fn process(&self) -> &SupervisedProcess {
        &self.process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{PipelineFailure, PipelineKind, ProcessState};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_missing_destination_is_config_error() {
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        let err = tokio_test::assert_err!(StreamRelay::new(&camera, &RelaySettings::default()));
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_relay_uses_destination() {
        let camera =
            CameraSource::new("plate_0", "rtsp://cam/1").destination("rtmp://ingest/live/plate_0");
        let (relay, _events) =
            tokio_test::assert_ok!(StreamRelay::new(&camera, &RelaySettings::default()));

        assert_eq!(relay.destination(), "rtmp://ingest/live/plate_0");
        assert_eq!(relay.kind(), PipelineKind::Relay);
        assert_eq!(relay.name(), "plate_0");
        assert_eq!(relay.state(), ProcessState::Idle);
    }

    #[tokio::test]
    async fn test_relay_restarts_after_unexpected_exit() {
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        let profile = PipelineProfile::relay("rtsp://cam/1", "rtmp://x/", &RelaySettings::default())
            .program("sh")
            .args(["-c", "echo 'Connection refused' >&2; exit 1"])
            .restart_delay(Duration::from_millis(150));
        let (relay, mut events) = StreamRelay::with_profile(&camera, "rtmp://x/", profile);
        relay.start();

        let mut spawned = 0;
        let mut errors = 0;
        while spawned < 2 {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            match event {
                ProcessEvent::Spawned { .. } => spawned += 1,
                ProcessEvent::Error(PipelineFailure::UnexpectedExit { .. }) => errors += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(errors, 1);

        relay.stop();
        timeout(Duration::from_secs(5), relay.process().wait_stopped())
            .await
            .expect("relay did not stop");
    }

    #[tokio::test]
    async fn test_relay_output_keeps_watchdog_quiet() {
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        let profile = PipelineProfile::relay("rtsp://cam/1", "rtmp://x/", &RelaySettings::default())
            .program("sh")
            .args(["-c", "while true; do echo 'frame=1' >&2; sleep 0.05; done"])
            .watchdog(Some(Duration::from_millis(300)))
            .kill_grace(Duration::from_millis(300));
        let (relay, mut events) = StreamRelay::with_profile(&camera, "rtmp://x/", profile);
        relay.start();

        assert!(matches!(
            timeout(Duration::from_secs(5), events.recv()).await,
            Ok(Some(ProcessEvent::Spawned { .. }))
        ));
        // several watchdog windows pass without a trip
        assert!(timeout(Duration::from_millis(900), events.recv()).await.is_err());
        assert_eq!(relay.state(), ProcessState::Running);

        relay.stop();
        assert!(matches!(
            timeout(Duration::from_secs(5), events.recv()).await,
            Ok(Some(ProcessEvent::Stopped))
        ));
    }
}
