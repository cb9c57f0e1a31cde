//! Background audio tasks and the handles used to stop them
//!
//! Every greeting, recording and stuck-recovery loop runs in its own tokio
//! task. The task owns its child processes; the state machine only holds a
//! [`ProcessHandle`] and learns about the outcome through a [`Completion`]
//! message, so no state is shared between the two.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An external audio program plus its leading arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl AudioCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Split a whitespace-separated command line; `None` when it is blank
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

impl fmt::Display for AudioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Why a task was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The handset went back on hook
    Hangup,
    /// The daemon is shutting down
    Shutdown,
    /// The handle was dropped without an explicit request
    Abandoned,
}

/// How a background task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Every process exited on its own with success
    Completed,
    /// The duration limit elapsed and the process was cut off
    LimitReached,
    /// A stop request terminated the task
    Stopped(StopReason),
    /// A process failed to spawn or exited unsuccessfully
    Failed(String),
}

impl ExitOutcome {
    /// `true` when the task ran its course rather than being cut short
    pub fn completed_normally(&self) -> bool {
        matches!(self, ExitOutcome::Completed | ExitOutcome::LimitReached)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ExitOutcome::Completed
        } else {
            ExitOutcome::Failed(status.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Playback,
    Recording,
    StuckRecovery,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Playback => write!(f, "playback"),
            TaskKind::Recording => write!(f, "recording"),
            TaskKind::StuckRecovery => write!(f, "stuck-recovery"),
        }
    }
}

/// Report sent by a task when it finishes
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: u64,
    pub kind: TaskKind,
    pub outcome: ExitOutcome,
}

/// Task-side end of a stop request
///
/// Once a stop has been observed every later call returns immediately with
/// the same reason, so a job never starts a new process after being stopped.
pub struct StopSignal {
    rx: Option<oneshot::Receiver<StopReason>>,
    fired: Option<StopReason>,
}

impl StopSignal {
    fn new(rx: oneshot::Receiver<StopReason>) -> Self {
        Self {
            rx: Some(rx),
            fired: None,
        }
    }

    async fn stopped(&mut self) -> StopReason {
        if let Some(reason) = self.fired {
            return reason;
        }
        let reason = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(StopReason::Abandoned),
            None => StopReason::Abandoned,
        };
        self.rx = None;
        self.fired = Some(reason);
        reason
    }

    /// Sleep unless a stop arrives first
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), StopReason> {
        if let Some(reason) = self.fired {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.stopped() => Err(reason),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run `command` until it exits or a stop arrives
    pub async fn run(&mut self, command: &AudioCommand) -> ExitOutcome {
        self.run_with_limit(command, None).await
    }

    /// Run `command`, killing it when a stop arrives or `limit` elapses
    pub async fn run_with_limit(
        &mut self,
        command: &AudioCommand,
        limit: Option<Duration>,
    ) -> ExitOutcome {
        if let Some(reason) = self.fired {
            return ExitOutcome::Stopped(reason);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(%command, error = %e, "failed to spawn audio process");
                return ExitOutcome::Failed(e.to_string());
            }
        };
        debug!(%command, pid = ?child.id(), "audio process started");

        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // A pending stop wins over an exit observed in the same poll.
        tokio::select! {
            biased;
            reason = self.stopped() => {
                kill(&mut child).await;
                debug!(%command, ?reason, "audio process terminated");
                ExitOutcome::Stopped(reason)
            }
            status = child.wait() => match status {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => ExitOutcome::Failed(e.to_string()),
            },
            _ = deadline => {
                kill(&mut child).await;
                debug!(%command, "audio process hit its duration limit");
                ExitOutcome::LimitReached
            }
        }
    }
}

async fn kill(child: &mut Child) {
    // Fails only when the child was already reaped.
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill on exited audio process");
    }
    let _ = child.wait().await;
}

/// Run `command` to the end, ignoring stop requests
///
/// Used for the beep, which is short and must never be cut off.
pub async fn play_to_completion(command: &AudioCommand) -> ExitOutcome {
    let outcome = match command.spawn() {
        Ok(mut child) => match child.wait().await {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => ExitOutcome::Failed(e.to_string()),
        },
        Err(e) => ExitOutcome::Failed(e.to_string()),
    };
    if let ExitOutcome::Failed(detail) = &outcome {
        warn!(%command, %detail, "audio process failed");
    }
    outcome
}

/// Owner-side handle to one background audio task
pub struct ProcessHandle {
    id: u64,
    kind: TaskKind,
    stop_tx: Option<oneshot::Sender<StopReason>>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn `job` on the runtime
    ///
    /// The job's outcome is delivered on `completions` tagged with `id`.
    pub fn spawn<F, Fut>(
        id: u64,
        kind: TaskKind,
        completions: mpsc::Sender<Completion>,
        job: F,
    ) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ExitOutcome> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let work = job(StopSignal::new(stop_rx));

        let task = tokio::spawn(async move {
            let outcome = work.await;
            debug!(id, %kind, ?outcome, "audio task finished");
            if completions
                .send(Completion { id, kind, outcome })
                .await
                .is_err()
            {
                debug!(id, %kind, "completion receiver dropped");
            }
        });

        Self {
            id,
            kind,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Ask the task to stop
    ///
    /// Only the first call has any effect; it returns `false` when the task
    /// had already finished or a stop was already requested.
    pub fn terminate(&mut self, reason: StopReason) -> bool {
        match self.stop_tx.take() {
            Some(tx) => {
                let delivered = tx.send(reason).is_ok();
                debug!(id = self.id, kind = %self.kind, ?reason, delivered, "stop requested");
                delivered
            }
            None => false,
        }
    }

    /// Wait for the task to finish
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(id = self.id, kind = %self.kind, error = %e, "audio task panicked");
        }
    }
}
