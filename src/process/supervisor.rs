//! Supervised external process
//!
//! A [`SupervisedProcess`] owns one controller task. The task holds the only
//! reference to the OS child and runs the state machine:
//!
//! ```text
//!                    start()
//!        Idle ───────────────────► Running ◄──────────────┐
//!                                  │     │                 │ restart timer
//!                    exit, no stop │     │ stop()          │
//!                                  ▼     ▼                 │
//!                        Restarting     Stopping ──────────┘ (watchdog recycle)
//!                             │            │   kill timer: SIGKILL, keep waiting
//!                      stop() │            │ exit
//!                             ▼            ▼
//!                           Stopped ◄──────┘
//! ```
//!
//! Timers are plain deadlines owned by the controller. Every transition that
//! supersedes a timer clears its deadline, so a late timer can never fire
//! against a newer child.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};

use super::event::{PipelineFailure, ProcessEvent};
use super::output::{self, ActivityClock};
use super::profile::{OutputMode, PipelineKind, PipelineProfile, StopProtocol};
use super::state::ProcessState;

/// Capacity of the event queue handed to the owner
pub const EVENT_CAPACITY: usize = 256;

/// Upper bound on writing the quit command to a child's stdin
const QUIT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

enum Request {
    Start,
    Stop,
}

/// Handle to one supervised pipeline process
///
/// Dropping the handle stops the process.
pub struct SupervisedProcess {
    name: Arc<str>,
    kind: PipelineKind,
    commands: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ProcessState>,
    pid: Arc<AtomicU32>,
    spawns: Arc<AtomicU64>,
}

impl SupervisedProcess {
    /// Create an idle instance and its event receiver
    ///
    /// Must be called from within a tokio runtime; the controller task is
    /// spawned immediately but nothing runs until [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        profile: PipelineProfile,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let name: Arc<str> = Arc::from(name.into());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Idle);
        let pid = Arc::new(AtomicU32::new(0));
        let spawns = Arc::new(AtomicU64::new(0));

        tracing::debug!(
            camera = %name,
            kind = profile.kind.label(),
            command = %profile.command_line(),
            "Pipeline created"
        );

        let handle = Self {
            name: Arc::clone(&name),
            kind: profile.kind,
            commands: command_tx,
            state: state_rx,
            pid: Arc::clone(&pid),
            spawns: Arc::clone(&spawns),
        };

        let controller = Controller {
            name,
            profile,
            events: event_tx,
            state: state_tx,
            pid,
            spawns,
            activity: Arc::new(ActivityClock::new()),
            child: None,
            stdin: None,
            stop_requested: false,
            recycling: false,
            restart_at: None,
            kill_at: None,
            watchdog_at: None,
        };
        tokio::spawn(controller.run(command_rx));

        (handle, event_rx)
    }

    /// Start the process (no-op unless idle or stopped)
    pub fn start(&self) {
        let _ = self.commands.send(Request::Start);
    }

    /// Request a graceful stop
    ///
    /// Idempotent: repeated calls, or a call on an instance without a live
    /// child, have no further effect.
    pub fn stop(&self) {
        let _ = self.commands.send(Request::Stop);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Wait until the instance reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ProcessState::Stopped).await;
    }

    /// OS id of the live child, if any
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of children spawned so far
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Camera name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline kind
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }
}

impl std::fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

/// State machine driven by the controller task
struct Controller {
    name: Arc<str>,
    profile: PipelineProfile,
    events: mpsc::Sender<ProcessEvent>,
    state: watch::Sender<ProcessState>,
    pid: Arc<AtomicU32>,
    spawns: Arc<AtomicU64>,
    activity: Arc<ActivityClock>,

    child: Option<Child>,
    stdin: Option<ChildStdin>,

    /// Set by stop(); an exit is then final
    stop_requested: bool,
    /// Set by the watchdog; the next exit restarts without a second error
    recycling: bool,

    restart_at: Option<Instant>,
    kill_at: Option<Instant>,
    watchdog_at: Option<Instant>,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Request>) {
        let mut handle_alive = true;

        loop {
            tokio::select! {
                command = commands.recv(), if handle_alive => match command {
                    Some(Request::Start) => self.on_start().await,
                    Some(Request::Stop) => self.on_stop().await,
                    None => {
                        handle_alive = false;
                        self.on_stop().await;
                    }
                },
                status = wait_child(&mut self.child) => self.on_exit(status).await,
                _ = sleep_until_deadline(self.restart_at) => {
                    self.restart_at = None;
                    self.on_restart_timer().await;
                }
                _ = sleep_until_deadline(self.kill_at) => {
                    self.kill_at = None;
                    self.on_kill_timer();
                }
                _ = sleep_until_deadline(self.watchdog_at) => {
                    self.watchdog_at = None;
                    self.on_watchdog().await;
                }
            }

            if !handle_alive && self.child.is_none() && self.current() == ProcessState::Stopped {
                break;
            }
        }

        tracing::trace!(camera = %self.name, "Controller finished");
    }

    fn current(&self) -> ProcessState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ProcessState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(
                camera = %self.name,
                kind = self.profile.kind.label(),
                from = %prev,
                to = %next,
                "State transition"
            );
        }
    }

    async fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event).await;
    }

    async fn on_start(&mut self) {
        match self.current() {
            ProcessState::Idle | ProcessState::Stopped => {
                self.stop_requested = false;
                self.set_state(ProcessState::Idle);
                tracing::info!(
                    camera = %self.name,
                    kind = self.profile.kind.label(),
                    "Starting pipeline"
                );
                self.spawn().await;
            }
            state => {
                tracing::debug!(camera = %self.name, state = %state, "Start ignored");
            }
        }
    }

    async fn on_stop(&mut self) {
        match self.current() {
            ProcessState::Stopped => {}
            ProcessState::Stopping => {
                // a watchdog recycle becomes a real stop
                self.stop_requested = true;
                self.recycling = false;
            }
            ProcessState::Idle | ProcessState::Restarting => {
                self.stop_requested = true;
                self.restart_at = None;
                self.set_state(ProcessState::Stopped);
                tracing::info!(camera = %self.name, "Pipeline stopped (no process running)");
                self.emit(ProcessEvent::Stopped).await;
            }
            ProcessState::Running => {
                self.stop_requested = true;
                tracing::info!(
                    camera = %self.name,
                    kind = self.profile.kind.label(),
                    pid = ?self.child.as_ref().and_then(Child::id),
                    "Stop requested"
                );
                self.begin_graceful_stop().await;
            }
        }
    }

    async fn spawn(&mut self) {
        if !self.current().can_spawn() || self.child.is_some() {
            tracing::warn!(camera = %self.name, state = %self.current(), "Spawn refused");
            return;
        }

        if let Some(dir) = &self.profile.output_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                let failure = PipelineFailure::DirectoryCreation {
                    path: dir.clone(),
                    reason: e.to_string(),
                };
                self.fail(failure).await;
                return;
            }
        }

        let mut command = Command::new(&self.profile.program);
        command
            .args(&self.profile.args)
            .stdin(match self.profile.stop_protocol {
                StopProtocol::QuitCommand => Stdio::piped(),
                StopProtocol::Interrupt => Stdio::null(),
            })
            .stdout(match self.profile.output {
                OutputMode::Frames => Stdio::piped(),
                OutputMode::Discard => Stdio::null(),
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // keep terminal signals aimed at us away from the children
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let failure = PipelineFailure::SpawnFailure {
                    program: self.profile.program.clone(),
                    reason: e.to_string(),
                };
                self.fail(failure).await;
                return;
            }
        };

        let pid = child.id();
        self.stdin = child.stdin.take();
        self.activity.touch();

        if let Some(stderr) = child.stderr.take() {
            output::spawn_diagnostics_reader(
                Arc::clone(&self.name),
                self.profile.log_style,
                stderr,
                Arc::clone(&self.activity),
            );
        }
        if let Some(stdout) = child.stdout.take() {
            output::spawn_frame_reader(
                Arc::clone(&self.name),
                stdout,
                self.events.clone(),
                Arc::clone(&self.activity),
            );
        }

        self.child = Some(child);
        self.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
        let spawns = self.spawns.fetch_add(1, Ordering::Relaxed) + 1;
        self.watchdog_at = self.profile.watchdog.map(|window| Instant::now() + window);
        self.set_state(ProcessState::Running);

        tracing::info!(
            camera = %self.name,
            kind = self.profile.kind.label(),
            pid = ?pid,
            spawns = spawns,
            "Process spawned"
        );
        self.emit(ProcessEvent::Spawned { pid }).await;
    }

    /// Report a failure and arm the restart timer
    async fn fail(&mut self, failure: PipelineFailure) {
        tracing::warn!(
            camera = %self.name,
            kind = self.profile.kind.label(),
            error = %failure,
            restart_in_ms = self.profile.restart_delay.as_millis() as u64,
            "Pipeline failure, scheduling restart"
        );
        self.emit(ProcessEvent::Error(failure)).await;
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        self.kill_at = None;
        self.watchdog_at = None;
        self.restart_at = Some(Instant::now() + self.profile.restart_delay);
        self.set_state(ProcessState::Restarting);
    }

    async fn on_exit(&mut self, status: std::io::Result<ExitStatus>) {
        self.child = None;
        self.stdin = None;
        self.pid.store(0, Ordering::Relaxed);
        self.kill_at = None;
        self.watchdog_at = None;

        let reason = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };

        if self.stop_requested {
            tracing::info!(camera = %self.name, reason = %reason, "Process exited after stop request");
            self.set_state(ProcessState::Stopped);
            self.emit(ProcessEvent::Stopped).await;
        } else if std::mem::take(&mut self.recycling) {
            tracing::info!(camera = %self.name, reason = %reason, "Stalled process exited, restarting");
            self.schedule_restart();
        } else {
            self.fail(PipelineFailure::UnexpectedExit { reason }).await;
        }
    }

    async fn on_restart_timer(&mut self) {
        if self.stop_requested || self.current() != ProcessState::Restarting {
            return;
        }
        tracing::info!(camera = %self.name, "Restarting process");
        self.spawn().await;
    }

    fn on_kill_timer(&mut self) {
        if let Some(child) = self.child.as_mut() {
            tracing::warn!(
                camera = %self.name,
                pid = ?child.id(),
                grace_ms = self.profile.kill_grace.as_millis() as u64,
                "Process outlived grace window, killing"
            );
            let _ = child.start_kill();
        }
    }

    async fn on_watchdog(&mut self) {
        let Some(window) = self.profile.watchdog else {
            return;
        };
        if self.current() != ProcessState::Running {
            return;
        }

        let last = self.activity.last();
        if last.elapsed() < window {
            self.watchdog_at = Some(last + window);
            return;
        }

        tracing::error!(
            camera = %self.name,
            window_secs = window.as_secs(),
            "No output from process, recycling"
        );
        self.emit(ProcessEvent::Error(PipelineFailure::WatchdogTimeout { idle: window }))
            .await;
        self.recycling = true;
        self.begin_graceful_stop().await;
    }

    /// Run the profile's stop protocol and arm the forced-kill timer
    async fn begin_graceful_stop(&mut self) {
        self.watchdog_at = None;
        self.restart_at = None;
        self.set_state(ProcessState::Stopping);

        let delivered = match self.profile.stop_protocol {
            StopProtocol::QuitCommand => self.send_quit().await,
            StopProtocol::Interrupt => false,
        };
        if !delivered {
            if let Some(child) = self.child.as_mut() {
                interrupt(child);
            }
        }

        self.kill_at = Some(Instant::now() + self.profile.kill_grace);
    }

    async fn send_quit(&mut self) -> bool {
        let Some(mut stdin) = self.stdin.take() else {
            return false;
        };
        let write = async {
            stdin.write_all(b"q").await?;
            stdin.flush().await
        };
        match timeout(QUIT_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(camera = %self.name, error = %e, "Quit command failed, interrupting");
                false
            }
            Err(_) => {
                tracing::debug!(camera = %self.name, "Quit command timed out, interrupting");
                false
            }
        }
    }
}

/// Send SIGINT, or kill outright where signals are unavailable
fn interrupt(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not yet reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child.as_mut() {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
