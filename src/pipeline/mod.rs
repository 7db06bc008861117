//! Camera pipelines
//!
//! The three pipeline variants differ only in their [`PipelineProfile`]; each
//! wraps one [`SupervisedProcess`] and exposes the same [`Pipeline`]
//! capability so services can hold them uniformly.
//!
//! [`PipelineProfile`]: crate::process::PipelineProfile

pub mod extractor;
pub mod recorder;
pub mod relay;

pub use extractor::FrameExtractor;
pub use recorder::SegmentRecorder;
pub use relay::StreamRelay;

use tokio::sync::watch;

use crate::process::{PipelineKind, ProcessState, SupervisedProcess};

/// Start/stop capability shared by every pipeline variant
///
/// Notifications (`Spawned`, `Error`, `Stopped`, `Frame`) arrive on the event
/// receiver returned alongside the pipeline at construction.
pub trait Pipeline: Send + Sync {
    /// The underlying supervised process
    fn process(&self) -> &SupervisedProcess;

    /// Camera name
    fn name(&self) -> &str {
        self.process().name()
    }

    /// Pipeline kind
    fn kind(&self) -> PipelineKind {
        self.process().kind()
    }

    /// Start the pipeline
    fn start(&self) {
        self.process().start()
    }

    /// Request a graceful stop (idempotent)
    fn stop(&self) {
        self.process().stop()
    }

    /// Current lifecycle state
    fn state(&self) -> ProcessState {
        self.process().state()
    }

    /// Receiver observing state changes
    fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.process().watch_state()
    }
}

impl Pipeline for SupervisedProcess {
    fn process(&self) -> &SupervisedProcess {
        self
    }
}
