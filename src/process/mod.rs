//! External process supervision
//!
//! Every camera pipeline is one [`SupervisedProcess`] parameterised by a
//! [`PipelineProfile`]. The supervisor spawns the transcoder, watches for its
//! exit, restarts it after a fixed delay and stops it gracefully (falling back
//! to a forced kill) on request.
//!
//! # Architecture
//!
//! ```text
//!   SupervisedProcess (handle)            controller task
//!  ┌──────────────────────────┐   cmds   ┌──────────────────────────────┐
//!  │ start() / stop()         │ ───────► │ select! {                    │
//!  │ state() / watch_state()  │ ◄─watch─ │   command, child.wait(),     │
//!  └──────────────────────────┘          │   restart_at, kill_at,       │
//!                                        │   watchdog_at                │
//!      mpsc::Receiver<ProcessEvent> ◄─── │ }                            │
//!                                        └───────┬──────────────┬───────┘
//!                                                │ stderr       │ stdout
//!                                                ▼              ▼
//!                                        diagnostics reader  frame reader
//! ```

pub mod event;
pub mod output;
pub mod profile;
pub mod state;
pub mod supervisor;

pub use event::{PipelineFailure, ProcessEvent};
pub use output::{ActivityClock, JpegSplitter};
pub use profile::{
    sanitize_name, LogStyle, OutputMode, PipelineKind, PipelineProfile, RelaySettings,
    StopProtocol,
};
pub use state::ProcessState;
pub use supervisor::SupervisedProcess;
