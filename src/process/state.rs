//! Supervised process lifecycle state

use std::fmt;

/// Lifecycle state of a supervised process
///
/// ```text
///  Idle ──start──► Running ──exit──► Restarting ──timer──► Running
///                     │                  │
///                   stop               stop
///                     ▼                  ▼
///                  Stopping ──exit──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Created, never started
    Idle,
    /// A child process is alive
    Running,
    /// Graceful stop issued, waiting for the child to exit
    Stopping,
    /// Child gone, restart timer armed
    Restarting,
    /// Stopped on request; no child and no timers
    Stopped,
}

impl ProcessState {
    /// Whether a new spawn is permitted from this state
    pub fn can_spawn(self) -> bool {
        matches!(self, ProcessState::Idle | ProcessState::Restarting)
    }

    /// Whether a stop request has already been honoured
    pub fn is_stopping_or_stopped(self) -> bool {
        matches!(self, ProcessState::Stopping | ProcessState::Stopped)
    }

    /// Short lowercase label for logs
    pub fn label(self) -> &'static str {
        match self {
            ProcessState::Idle => "idle",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Restarting => "restarting",
            ProcessState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_only_from_idle_or_restarting() {
        assert!(ProcessState::Idle.can_spawn());
        assert!(ProcessState::Restarting.can_spawn());
        assert!(!ProcessState::Running.can_spawn());
        assert!(!ProcessState::Stopping.can_spawn());
        assert!(!ProcessState::Stopped.can_spawn());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessState::Restarting.to_string(), "restarting");
    }
}
