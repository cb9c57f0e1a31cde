use tempfile::TempDir;

use super::*;
use crate::audio::AudioCommand;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn shell(script: &str) -> AudioCommand {
    AudioCommand::new("sh").args(["-c", script, "audio"])
}

/// Recorder stand-in: creates the output file (last argument), then runs `script`
fn recorder(script: &str) -> AudioCommand {
    shell(&format!(r#"for out; do :; done; : > "$out"; {script}"#))
}

struct Harness {
    machine: StateMachine,
    hook: HookLine,
    events: broadcast::Receiver<StateEvent>,
    dir: TempDir,
}

impl Harness {
    fn new(player: AudioCommand, recorder: AudioCommand, max_recording: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let recordings_dir = dir.path().join("recordings");
        std::fs::create_dir_all(&recordings_dir).unwrap();

        let audio = AudioConfig {
            player,
            recorder,
            capture_device: "hw:1,0".to_string(),
            sounds_dir: dir.path().join("sounds"),
            recordings_dir,
            backup_device: "sda1".to_string(),
            max_recording,
        };
        let timings = Timings {
            playback_delay: Duration::from_millis(10),
            stuck_retry: Duration::from_millis(20),
            limit_grace: Duration::ZERO,
            shutdown_grace: Duration::from_secs(2),
            ..Timings::default()
        };

        let hook = HookLine::new(true);
        let (event_tx, events) = broadcast::channel(64);
        let machine = StateMachine::new(
            audio,
            timings,
            Some(dir.path().join("usb")),
            hook.clone(),
            event_tx,
        );

        Self {
            machine,
            hook,
            events,
            dir,
        }
    }

    fn lift(&mut self) {
        self.hook.set(false);
        self.machine.handle_hook(false);
    }

    fn hang_up(&mut self) {
        self.hook.set(true);
        self.machine.handle_hook(true);
    }

    async fn next_completion(&mut self) -> Completion {
        tokio::time::timeout(STEP_TIMEOUT, self.machine.completion_rx.recv())
            .await
            .expect("no task finished in time")
            .expect("completion channel closed")
    }

    /// Feed the next task completion to the machine
    async fn step(&mut self) -> Completion {
        let done = self.next_completion().await;
        self.machine.handle_completion(done.clone());
        done
    }

    async fn run_until(&mut self, state: State) {
        while self.machine.state() != state {
            self.step().await;
        }
    }

    fn drain_events(&mut self) -> Vec<StateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn files_in(&self, sub: &str) -> Vec<String> {
        match std::fs::read_dir(self.dir.path().join(sub)) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn count_finished(events: &[StateEvent], end: RecordingEnd) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, StateEvent::RecordingFinished { ended_by, .. } if *ended_by == end)
        })
        .count()
}

#[test]
fn test_initial_state() {
    let h = Harness::new(
        AudioCommand::new("true"),
        AudioCommand::new("true"),
        Duration::from_secs(1),
    );
    assert_eq!(h.machine.state(), State::Waiting);
    assert_eq!(h.machine.session().message_count, 0);
}

#[tokio::test]
async fn test_unmatched_events_are_noops() {
    let mut h = Harness::new(shell("sleep 30"), shell("sleep 30"), Duration::from_secs(30));

    for (state, hook_down) in [
        (State::Waiting, true),
        (State::Playing, false),
        (State::Recording, false),
    ] {
        h.machine.state = state;
        h.machine.handle_hook(hook_down);
        assert_eq!(h.machine.state(), state);
        assert!(h.machine.playback.is_none());
        assert!(h.machine.recording.is_none());
        assert!(h.machine.stuck.is_none());
        assert!(h.drain_events().is_empty());
    }
}

#[tokio::test]
async fn test_finished_greeting_starts_recording() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_secs(30),
    );

    h.lift();
    assert_eq!(h.machine.state(), State::Playing);
    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::Playback);
    assert_eq!(done.outcome, ExitOutcome::Completed);
    assert_eq!(h.machine.state(), State::Recording);
    assert_eq!(h.machine.session().message_count, 1);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        StateEvent::GreetingStarted {
            greeting: audio::Greeting::Intro
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, StateEvent::RecordingStarted { caller: 1, .. })));

    h.machine.shutdown().await;
}

#[tokio::test]
async fn test_hangup_during_greeting_never_records() {
    let mut h = Harness::new(shell("sleep 30"), recorder("sleep 30"), Duration::from_secs(30));

    h.lift();
    assert_eq!(h.machine.state(), State::Playing);
    h.hang_up();
    assert_eq!(h.machine.state(), State::Waiting);

    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::Playback);
    assert_eq!(done.outcome, ExitOutcome::Stopped(StopReason::Hangup));
    assert_eq!(h.machine.state(), State::Waiting);
    assert_eq!(h.machine.session().message_count, 0);
    assert!(h.machine.recording.is_none());
    assert!(h.files_in("recordings").is_empty());

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, StateEvent::GreetingInterrupted)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StateEvent::RecordingStarted { .. })));
}

#[tokio::test]
async fn test_hangup_during_beep_returns_to_waiting() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_secs(30),
    );

    h.lift();
    // Level already on hook, event still in flight.
    h.hook.set(true);
    let done = h.step().await;
    assert_eq!(done.outcome, ExitOutcome::Completed);
    assert_eq!(h.machine.state(), State::Waiting);
    assert_eq!(h.machine.session().message_count, 0);

    h.machine.handle_hook(true);
    assert_eq!(h.machine.state(), State::Waiting);
}

#[tokio::test]
async fn test_player_spawn_failure_returns_to_waiting() {
    let mut h = Harness::new(
        AudioCommand::new("/nonexistent/player"),
        recorder("sleep 30"),
        Duration::from_secs(30),
    );

    h.lift();
    let done = h.step().await;
    assert!(matches!(done.outcome, ExitOutcome::Failed(_)));
    assert_eq!(h.machine.state(), State::Waiting);
    assert!(h.machine.playback.is_none());
}

#[tokio::test]
async fn test_recorder_failure_returns_to_waiting() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        AudioCommand::new("false"),
        Duration::from_secs(30),
    );

    h.lift();
    h.run_until(State::Recording).await;
    let done = h.step().await;
    assert!(matches!(done.outcome, ExitOutcome::Failed(_)));
    assert_eq!(h.machine.state(), State::Waiting);
    assert_eq!(count_finished(&h.drain_events(), RecordingEnd::Failed), 1);
}

#[tokio::test]
async fn test_recorder_exiting_on_its_own_enters_phone_stuck() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        AudioCommand::new("true"),
        Duration::from_secs(30),
    );

    h.lift();
    h.run_until(State::Recording).await;
    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::Recording);
    assert_eq!(done.outcome, ExitOutcome::Completed);
    assert_eq!(h.machine.state(), State::PhoneStuck);
    assert!(h.machine.stuck.is_some());
    assert_eq!(count_finished(&h.drain_events(), RecordingEnd::LimitReached), 1);

    h.hang_up();
    assert_eq!(h.machine.state(), State::Waiting);
    assert!(h.machine.stuck.is_none());

    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::StuckRecovery);
    assert_eq!(done.outcome, ExitOutcome::Stopped(StopReason::Hangup));
    assert_eq!(h.machine.state(), State::Waiting);
}

#[tokio::test]
async fn test_hangup_during_recording_never_phone_stuck() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_secs(30),
    );

    h.lift();
    h.run_until(State::Recording).await;
    h.hang_up();
    assert_eq!(h.machine.state(), State::Waiting);

    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::Recording);
    assert_eq!(done.outcome, ExitOutcome::Stopped(StopReason::Hangup));
    assert_eq!(h.machine.state(), State::Waiting);
    assert!(h.machine.stuck.is_none());
    assert_eq!(count_finished(&h.drain_events(), RecordingEnd::Hangup), 1);
}

#[tokio::test]
async fn test_stop_recording_twice_equals_once() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_secs(30),
    );

    h.lift();
    h.run_until(State::Recording).await;
    h.drain_events();

    h.machine.stop_recording();
    h.machine.stop_recording();
    assert!(h.machine.recording.is_none());
    assert_eq!(count_finished(&h.drain_events(), RecordingEnd::Hangup), 1);

    let done = h.step().await;
    assert_eq!(done.outcome, ExitOutcome::Stopped(StopReason::Hangup));
    // The stopped recorder's exit is stale: no PhoneStuck.
    assert_eq!(h.machine.state(), State::Recording);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), h.machine.completion_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unattended_recording_then_stuck_then_hangup() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_millis(300),
    );

    h.lift();
    h.run_until(State::Recording).await;
    let done = h.step().await;
    assert_eq!(done.outcome, ExitOutcome::LimitReached);
    assert_eq!(h.machine.state(), State::PhoneStuck);

    let recordings = h.files_in("recordings");
    assert_eq!(recordings.len(), 1);
    assert!(recordings[0].ends_with("_recording.wav"));
    assert_eq!(h.files_in("usb/recordings"), recordings);

    // Lifted level while stuck only re-polls; no second loop.
    let stuck_id = h.machine.stuck.as_ref().map(|s| s.id());
    h.machine.handle_hook(false);
    assert_eq!(h.machine.stuck.as_ref().map(|s| s.id()), stuck_id);
    assert_eq!(h.machine.state(), State::PhoneStuck);

    h.hang_up();
    assert_eq!(h.machine.state(), State::Waiting);
    assert_eq!(h.machine.session().message_count, 1);
}

#[tokio::test]
async fn test_stuck_recovery_exits_once_hook_reads_on_hook() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        AudioCommand::new("true"),
        Duration::from_secs(30),
    );

    h.lift();
    h.run_until(State::PhoneStuck).await;

    // Put down without the event reaching the machine.
    h.hook.set(true);
    let done = h.step().await;
    assert_eq!(done.kind, TaskKind::StuckRecovery);
    assert_eq!(done.outcome, ExitOutcome::Completed);
    assert_eq!(h.machine.state(), State::Waiting);
    assert!(h.machine.stuck.is_none());
}

#[tokio::test]
async fn test_fiftieth_caller_hears_special_greeting() {
    let mut h = Harness::new(shell("sleep 30"), recorder("sleep 30"), Duration::from_secs(30));
    h.machine.session.message_count = 49;

    h.lift();
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        StateEvent::GreetingStarted {
            greeting: audio::Greeting::CallerFifty
        }
    )));

    h.machine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_active_tasks() {
    let mut h = Harness::new(shell("sleep 30"), recorder("sleep 30"), Duration::from_secs(30));

    h.lift();
    h.machine.shutdown().await;
    assert!(h.machine.playback.is_none());

    let done = h.next_completion().await;
    assert_eq!(done.outcome, ExitOutcome::Stopped(StopReason::Shutdown));
}

#[tokio::test]
async fn test_run_loop_consumes_hook_events() {
    let mut h = Harness::new(shell("sleep 30"), recorder("sleep 30"), Duration::from_secs(30));
    let (hook_tx, hook_rx) = mpsc::channel(8);

    hook_tx
        .send(HookEvent::Changed { hook_down: false })
        .await
        .unwrap();
    hook_tx.send(HookEvent::LineLost).await.unwrap();
    hook_tx
        .send(HookEvent::Changed { hook_down: true })
        .await
        .unwrap();
    drop(hook_tx);

    tokio::time::timeout(STEP_TIMEOUT, h.machine.run(hook_rx))
        .await
        .unwrap();
    assert_eq!(h.machine.state(), State::Waiting);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, StateEvent::GreetingInterrupted)));
}

#[tokio::test]
async fn test_scratch_tree_removed_on_drop() {
    let mut h = Harness::new(
        AudioCommand::new("true"),
        recorder("sleep 30"),
        Duration::from_millis(300),
    );
    let root = h.dir.path().to_path_buf();

    h.lift();
    h.run_until(State::PhoneStuck).await;
    assert_eq!(h.files_in("usb/recordings").len(), 1);
    h.machine.shutdown().await;

    drop(h);
    assert!(!root.exists());
}
