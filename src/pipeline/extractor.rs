//! Still-frame extractor for live view
//!
//! Decodes the camera feed into a continuous MJPEG stream on stdout. Each
//! complete JPEG image becomes one [`ProcessEvent::Frame`]; frames are
//! best-effort and arrive at whatever rate the transcoder produces them.

use tokio::sync::mpsc;

use super::Pipeline;
use crate::config::CameraSource;
use crate::process::{PipelineProfile, ProcessEvent, SupervisedProcess};

/// Extractor pipeline for one camera
#[derive(Debug)]
pub struct FrameExtractor {
    process: SupervisedProcess,
}

impl FrameExtractor {
    /// Create an idle extractor for `camera`
    pub fn new(camera: &CameraSource) -> (Self, mpsc::Receiver<ProcessEvent>) {
        Self::with_profile(camera, PipelineProfile::extractor(&camera.source))
    }

    /// Create an extractor with an explicit profile
    pub fn with_profile(
        camera: &CameraSource,
        profile: PipelineProfile,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (process, events) = SupervisedProcess::new(camera.name.clone(), profile);
        (Self { process }, events)
    }
}

impl Pipeline for FrameExtractor {
    fn process(&self) -> &SupervisedProcess {
        &self.process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_frames_forwarded_one_image_per_event() {
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        let profile = PipelineProfile::extractor(&camera.source)
            .program("sh")
            .args([
                "-c",
                r"printf '\377\330one\377\331\377\330two\377\331'; exec sleep 30",
            ]);
        let (extractor, mut events) = FrameExtractor::with_profile(&camera, profile);
        extractor.start();

        let mut frames = Vec::new();
        while frames.len() < 2 {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(ProcessEvent::Frame(image))) => frames.push(image),
                Ok(Some(ProcessEvent::Spawned { .. })) => {}
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(&frames[0][..], b"\xFF\xD8one\xFF\xD9");
        assert_eq!(&frames[1][..], b"\xFF\xD8two\xFF\xD9");

        extractor.stop();
        timeout(Duration::from_secs(5), extractor.process().wait_stopped())
            .await
            .expect("extractor did not stop");
    }
}
