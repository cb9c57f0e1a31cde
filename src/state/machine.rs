//! Core state machine implementation
//!
//! Hook events from the listener thread and completion reports from the
//! background audio tasks are consumed by a single loop in [`StateMachine::run`],
//! so every field here is only ever touched from that loop.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::audio::{
    self, select_greeting, Completion, ExitOutcome, ProcessHandle, RecordingSession, StopReason,
    TaskKind,
};
use crate::config::{AudioConfig, Timings};
use crate::events::{RecordingEnd, StateEvent};
use crate::hook::{HookEvent, HookLine};

const COMPLETION_CHANNEL_SIZE: usize = 16;

/// The four possible states of the answering machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Handset on hook, nothing playing
    #[default]
    Waiting,
    /// Greeting (then beep) playing to the caller
    Playing,
    /// Recording the caller's message
    Recording,
    /// Recording hit its cap with the handset still lifted
    PhoneStuck,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Waiting => write!(f, "Waiting"),
            State::Playing => write!(f, "Playing"),
            State::Recording => write!(f, "Recording"),
            State::PhoneStuck => write!(f, "PhoneStuck"),
        }
    }
}

/// Counters kept for the lifetime of the daemon
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Callers that reached the recording stage
    pub message_count: u32,
    pub booted_at: Instant,
}

impl CallSession {
    pub fn new(booted_at: Instant) -> Self {
        Self {
            message_count: 0,
            booted_at,
        }
    }

    pub fn since_boot(&self) -> Duration {
        self.booted_at.elapsed()
    }
}

struct ActiveRecording {
    handle: ProcessHandle,
    path: PathBuf,
    started_at: Instant,
}

/// The state machine that drives playback and recording
pub struct StateMachine {
    state: State,
    state_entered_at: Instant,
    session: CallSession,
    audio: AudioConfig,
    timings: Timings,
    /// Mount point of the backup stick, resolved once at startup
    backup_root: Option<PathBuf>,
    hook: HookLine,
    playback: Option<ProcessHandle>,
    recording: Option<ActiveRecording>,
    stuck: Option<ProcessHandle>,
    next_task_id: u64,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateMachine {
    pub fn new(
        audio: AudioConfig,
        timings: Timings,
        backup_root: Option<PathBuf>,
        hook: HookLine,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_SIZE);
        let now = Instant::now();
        Self {
            state: State::Waiting,
            state_entered_at: now,
            session: CallSession::new(now),
            audio,
            timings,
            backup_root,
            hook,
            playback: None,
            recording: None,
            stuck: None,
            next_task_id: 0,
            completion_tx,
            completion_rx,
            event_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Run the state machine until the hook channel closes
    pub async fn run(&mut self, mut hook_rx: mpsc::Receiver<HookEvent>) {
        info!("state machine started in Waiting state");

        loop {
            tokio::select! {
                event = hook_rx.recv() => match event {
                    Some(HookEvent::Changed { hook_down }) => self.handle_hook(hook_down),
                    Some(HookEvent::LineLost) => {
                        warn!(state = %self.state, "hook line lost, holding current state");
                    }
                    None => break,
                },
                Some(done) = self.completion_rx.recv() => self.handle_completion(done),
            }
        }

        info!("state machine stopped");
    }

    /// Apply one debounced hook level (`true` = on hook)
    pub fn handle_hook(&mut self, hook_down: bool) {
        match (self.state, hook_down) {
            (State::Waiting, false) => self.play(),
            (State::Playing, true) => {
                self.stop_playback();
                self.transition_to(State::Waiting);
            }
            (State::Recording, true) => {
                self.stop_recording();
                self.transition_to(State::Waiting);
            }
            (State::PhoneStuck, true) => self.wait(),
            (State::PhoneStuck, false) => self.phone_stuck(),
            (state, hook_down) => {
                debug!(%state, hook_down, "no transition for hook event");
            }
        }
    }

    /// Handle a finished background task
    fn handle_completion(&mut self, done: Completion) {
        match done.kind {
            TaskKind::Playback => {
                if !is_current(self.playback.as_ref(), done.id) {
                    return stale(&done);
                }
                self.playback = None;

                if !done.outcome.completed_normally() {
                    info!(outcome = ?done.outcome, "greeting did not finish");
                    self.transition_to(State::Waiting);
                } else if self.hook.is_on_hook() {
                    info!("caller hung up before the beep ended");
                    self.transition_to(State::Waiting);
                } else {
                    self.record();
                }
            }
            TaskKind::Recording => {
                if !is_current(self.recording.as_ref().map(|r| &r.handle), done.id) {
                    return stale(&done);
                }
                let Some(recording) = self.recording.take() else {
                    return;
                };

                match done.outcome {
                    ExitOutcome::Completed | ExitOutcome::LimitReached => {
                        self.finish_recording(&recording, RecordingEnd::LimitReached);
                        self.phone_stuck();
                    }
                    ExitOutcome::Stopped(reason) => {
                        debug!(?reason, "recording stopped");
                        self.finish_recording(&recording, RecordingEnd::Hangup);
                        self.transition_to(State::Waiting);
                    }
                    ExitOutcome::Failed(detail) => {
                        warn!(%detail, "recorder failed");
                        self.finish_recording(&recording, RecordingEnd::Failed);
                        self.transition_to(State::Waiting);
                    }
                }
            }
            TaskKind::StuckRecovery => {
                if !is_current(self.stuck.as_ref(), done.id) {
                    return stale(&done);
                }
                self.stuck = None;
                if done.outcome.completed_normally() {
                    info!("handset back on hook");
                }
                self.wait();
            }
        }
    }

    /// Answer: play the greeting and beep, then hand over to `record`
    fn play(&mut self) {
        debug_assert!(self.playback.is_none() && self.recording.is_none());
        self.transition_to(State::Playing);

        let greeting = select_greeting(self.session.message_count, self.session.since_boot());
        let greeting_cmd = self
            .audio
            .play_command(&self.audio.sound(greeting.file_name()));
        let beep = self.audio.beep_command();
        let delay = self.timings.playback_delay;

        info!(%greeting, caller = self.session.message_count + 1, "answering call");
        self.emit(StateEvent::GreetingStarted { greeting });

        let id = self.next_id();
        self.playback = Some(ProcessHandle::spawn(
            id,
            TaskKind::Playback,
            self.completion_tx.clone(),
            move |mut stop| async move {
                // Let the hook switch settle before making noise.
                if let Err(reason) = stop.sleep(delay).await {
                    return ExitOutcome::Stopped(reason);
                }
                match stop.run(&greeting_cmd).await {
                    ExitOutcome::Completed => {
                        audio::play_to_completion(&beep).await;
                        ExitOutcome::Completed
                    }
                    other => other,
                }
            },
        ));
    }

    fn stop_playback(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.terminate(StopReason::Hangup);
            info!("greeting interrupted");
            self.emit(StateEvent::GreetingInterrupted);
        }
    }

    /// Start recording the caller's message
    fn record(&mut self) {
        debug_assert!(self.playback.is_none() && self.recording.is_none());
        self.transition_to(State::Recording);
        self.session.message_count += 1;

        let session = RecordingSession::starting_now(
            &self.audio.recordings_dir,
            self.backup_root.as_deref(),
            self.audio.max_recording,
            self.timings.limit_grace,
        );
        let command = session.recorder_command(&self.audio.recorder, &self.audio.capture_device);
        let path = session.path().to_path_buf();
        let caller = self.session.message_count;

        info!(
            caller,
            path = %path.display(),
            backup = ?session.backup_path(),
            "recording message"
        );
        self.emit(StateEvent::RecordingStarted {
            path: path.display().to_string(),
            caller,
        });

        let id = self.next_id();
        let handle = ProcessHandle::spawn(
            id,
            TaskKind::Recording,
            self.completion_tx.clone(),
            move |mut stop| async move {
                let outcome = session.capture(&mut stop, &command).await;
                session.mirror_best_effort().await;
                outcome
            },
        );

        self.recording = Some(ActiveRecording {
            handle,
            path,
            started_at: Instant::now(),
        });
    }

    /// Stop the recorder because the caller hung up
    fn stop_recording(&mut self) {
        if let Some(mut recording) = self.recording.take() {
            recording.handle.terminate(StopReason::Hangup);
            self.finish_recording(&recording, RecordingEnd::Hangup);
        }
    }

    fn finish_recording(&self, recording: &ActiveRecording, ended_by: RecordingEnd) {
        let duration_ms = recording.started_at.elapsed().as_millis() as u64;
        info!(?ended_by, duration_ms, path = %recording.path.display(), "recording finished");
        self.emit(StateEvent::RecordingFinished {
            path: recording.path.display().to_string(),
            ended_by,
            duration_ms,
        });
    }

    /// Drop everything and go back to waiting for a call
    fn wait(&mut self) {
        if let Some(mut stuck) = self.stuck.take() {
            stuck.terminate(StopReason::Hangup);
        }
        self.stop_recording();
        self.stop_playback();
        self.transition_to(State::Waiting);
    }

    /// Beep every `stuck_retry` until the handset is put back
    fn phone_stuck(&mut self) {
        if self.stuck.is_some() {
            debug!("stuck recovery already polling");
            return;
        }
        self.transition_to(State::PhoneStuck);
        warn!("handset left off hook after recording limit");

        let beep = self.audio.beep_command();
        let retry = self.timings.stuck_retry;
        let hook = self.hook.clone();

        let id = self.next_id();
        self.stuck = Some(ProcessHandle::spawn(
            id,
            TaskKind::StuckRecovery,
            self.completion_tx.clone(),
            move |mut stop| async move {
                let mut beeps: u32 = 0;
                loop {
                    audio::play_to_completion(&beep).await;
                    beeps += 1;
                    if let Err(reason) = stop.sleep(retry).await {
                        return ExitOutcome::Stopped(reason);
                    }
                    if hook.is_on_hook() {
                        debug!(beeps, "stuck recovery saw handset on hook");
                        return ExitOutcome::Completed;
                    }
                }
            },
        ));
    }

    /// Stop every background task and wait for them to wind down
    pub async fn shutdown(&mut self) {
        let grace = self.timings.shutdown_grace;
        let handles = [
            self.playback.take(),
            self.recording.take().map(|r| r.handle),
            self.stuck.take(),
        ];

        for mut handle in handles.into_iter().flatten() {
            let (id, kind) = (handle.id(), handle.kind());
            handle.terminate(StopReason::Shutdown);
            if tokio::time::timeout(grace, handle.join()).await.is_err() {
                warn!(id, %kind, "audio task did not stop in time");
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_state: State) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        info!(
            from = %old_state,
            to = %new_state,
            duration_ms,
            "state transition"
        );

        self.state = new_state;
        self.state_entered_at = Instant::now();
        self.emit(StateEvent::StateChanged {
            from: old_state,
            to: new_state,
            duration_ms,
        });
    }

    fn emit(&self, event: StateEvent) {
        debug!(%event, "emitting event");
        let _ = self.event_tx.send(event);
    }
}

fn is_current(handle: Option<&ProcessHandle>, id: u64) -> bool {
    handle.is_some_and(|h| h.id() == id)
}

/// Completions from tasks that were already stopped carry no transition.
fn stale(done: &Completion) {
    debug!(id = done.id, kind = %done.kind, outcome = ?done.outcome, "ignoring stale completion");
}

#[cfg(test)]
mod tests;
