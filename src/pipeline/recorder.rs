//! Segmented archival recorder
//!
//! Copies the camera's video stream into fixed-length container files, one
//! per segment, under a per-camera directory:
//!
//! ```text
//! <base_dir>/<camera>/rec_<camera>_<YYYYmmdd_HHMMSS>.mp4
//! ```
//!
//! Stopping writes `q` on the child's stdin so the muxer finalises the open
//! segment; an interrupt is only used when stdin is unavailable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use super::Pipeline;
use crate::config::CameraSource;
use crate::process::{PipelineProfile, ProcessEvent, SupervisedProcess};

/// Recorder pipeline for one camera
#[derive(Debug)]
pub struct SegmentRecorder {
    process: SupervisedProcess,
    output_dir: PathBuf,
}

impl SegmentRecorder {
    /// Create an idle recorder writing under `base_dir`
    pub fn new(
        camera: &CameraSource,
        base_dir: &Path,
        segment_time: Duration,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        Self::with_profile(camera, PipelineProfile::recorder(camera, base_dir, segment_time))
    }

    /// Create a recorder with an explicit profile
    pub fn with_profile(
        camera: &CameraSource,
        profile: PipelineProfile,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let output_dir = profile.output_dir.clone().unwrap_or_default();
        let (process, events) = SupervisedProcess::new(camera.name.clone(), profile);
        (Self { process, output_dir }, events)
    }

    /// Directory segments are written to
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl Pipeline for SegmentRecorder {
    fn process(&self) -> &SupervisedProcess {
        &self.process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{PipelineFailure, ProcessState};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(events: &mut mpsc::Receiver<ProcessEvent>) -> ProcessEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_output_dir_is_sanitized_camera_name() {
        let camera = CameraSource::new("Plate 0", "rtsp://cam/1");
        let (recorder, _events) =
            SegmentRecorder::new(&camera, Path::new("/data"), Duration::from_secs(900));

        assert_eq!(recorder.output_dir(), Path::new("/data/plate_0"));
        assert_eq!(recorder.state(), ProcessState::Idle);
    }

    #[tokio::test]
    async fn test_quit_command_stops_once_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        // exits as soon as one byte arrives on stdin
        let profile = PipelineProfile::recorder(&camera, dir.path(), Duration::from_secs(900))
            .program("head")
            .args(["-c", "1"])
            .restart_delay(Duration::from_millis(100));
        let (recorder, mut events) = SegmentRecorder::with_profile(&camera, profile);

        recorder.start();
        assert!(matches!(next_event(&mut events).await, ProcessEvent::Spawned { .. }));
        assert!(recorder.output_dir().is_dir());

        recorder.stop();
        assert!(matches!(next_event(&mut events).await, ProcessEvent::Stopped));
        assert_eq!(recorder.state(), ProcessState::Stopped);

        // no restart is armed after a requested stop
        assert!(timeout(Duration::from_millis(400), events.recv()).await.is_err());
        assert_eq!(recorder.process().spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_stdin_falls_back_to_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        // drops stdin so the quit command cannot be delivered, then idles
        let profile = PipelineProfile::recorder(&camera, dir.path(), Duration::from_secs(900))
            .program("sh")
            .args(["-c", "exec 0<&-; exec sleep 30"])
            .restart_delay(Duration::from_millis(100));
        assert_eq!(profile.kill_grace, Duration::from_secs(5));
        let (recorder, mut events) = SegmentRecorder::with_profile(&camera, profile);

        recorder.start();
        assert!(matches!(next_event(&mut events).await, ProcessEvent::Spawned { .. }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stop_at = std::time::Instant::now();
        recorder.stop();
        assert!(matches!(next_event(&mut events).await, ProcessEvent::Stopped));
        // interrupted, not killed at the end of the grace window
        let elapsed = stop_at.elapsed();
        assert!(elapsed < Duration::from_secs(2), "stopped after {:?}", elapsed);
        assert_eq!(recorder.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_directory_failure_schedules_restart_without_spawn() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let camera = CameraSource::new("plate_0", "rtsp://cam/1");
        // a regular file stands where the base directory should be
        let profile = PipelineProfile::recorder(&camera, blocker.path(), Duration::from_secs(900))
            .program("sleep")
            .args(["30"])
            .restart_delay(Duration::from_millis(100));
        let (recorder, mut events) = SegmentRecorder::with_profile(&camera, profile);

        recorder.start();
        assert!(matches!(
            next_event(&mut events).await,
            ProcessEvent::Error(PipelineFailure::DirectoryCreation { .. })
        ));
        assert_eq!(recorder.state(), ProcessState::Restarting);
        // the retry fails the same way
        assert!(matches!(
            next_event(&mut events).await,
            ProcessEvent::Error(PipelineFailure::DirectoryCreation { .. })
        ));
        assert_eq!(recorder.process().spawn_count(), 0);

        recorder.stop();
        assert!(matches!(next_event(&mut events).await, ProcessEvent::Stopped));
    }
}
