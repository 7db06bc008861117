//! Notifications emitted by supervised processes

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Why a pipeline needed recovery
///
/// None of these are fatal; each is followed by a scheduled restart.
#[derive(Debug, Clone, Error)]
pub enum PipelineFailure {
    /// The executable could not be started
    #[error("failed to start {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    /// The child exited without a stop request
    #[error("process exited unexpectedly ({reason})")]
    UnexpectedExit { reason: String },

    /// No output for longer than the watchdog window
    #[error("no activity for {}s", idle.as_secs())]
    WatchdogTimeout { idle: Duration },

    /// The recorder output directory could not be created
    #[error("failed to create output directory {}: {reason}", path.display())]
    DirectoryCreation { path: PathBuf, reason: String },
}

/// Events from a supervised process
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A child process was spawned
    Spawned {
        /// OS process id
        pid: Option<u32>,
    },

    /// Failure that triggers the restart path
    Error(PipelineFailure),

    /// The instance reached `Stopped` after a stop request
    Stopped,

    /// One still image produced by a frame pipeline
    Frame(Bytes),
}

impl ProcessEvent {
    /// Whether this is an error notification
    pub fn is_error(&self) -> bool {
        matches!(self, ProcessEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages() {
        let failure = PipelineFailure::UnexpectedExit {
            reason: "exit status: 1".into(),
        };
        assert_eq!(failure.to_string(), "process exited unexpectedly (exit status: 1)");

        let failure = PipelineFailure::WatchdogTimeout {
            idle: Duration::from_secs(60),
        };
        assert_eq!(failure.to_string(), "no activity for 60s");
    }
}
