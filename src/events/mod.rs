//! Events module for state machine transitions
//!
//! Structured events broadcast by the state machine for logging and for
//! subscribed status clients.

use serde::{Deserialize, Serialize};

use crate::audio::Greeting;
use crate::state::State;

/// How a recording came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingEnd {
    /// Caller put the handset down
    Hangup,
    /// Duration cap reached with the handset still lifted
    LimitReached,
    /// Recorder failed to start or exited with an error
    Failed,
}

/// Events emitted by the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Any change of state
    StateChanged {
        from: State,
        to: State,
        /// Time spent in `from`
        duration_ms: u64,
    },

    /// Handset lifted, greeting about to play
    GreetingStarted { greeting: Greeting },

    /// Caller hung up before the greeting and beep finished
    GreetingInterrupted,

    /// Recorder started
    RecordingStarted {
        path: String,
        /// One-based caller number
        caller: u32,
    },

    /// Recorder stopped or was stopped
    RecordingFinished {
        path: String,
        ended_by: RecordingEnd,
        duration_ms: u64,
    },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged {
                from,
                to,
                duration_ms,
            } => write!(f, "STATE_CHANGED ({} -> {}, {}ms)", from, to, duration_ms),
            StateEvent::GreetingStarted { greeting } => {
                write!(f, "GREETING_STARTED ({})", greeting)
            }
            StateEvent::GreetingInterrupted => write!(f, "GREETING_INTERRUPTED"),
            StateEvent::RecordingStarted { path, caller } => {
                write!(f, "RECORDING_STARTED (caller {}, {})", caller, path)
            }
            StateEvent::RecordingFinished {
                path,
                ended_by,
                duration_ms,
            } => write!(
                f,
                "RECORDING_FINISHED ({:?}, {}ms, {})",
                ended_by, duration_ms, path
            ),
        }
    }
}
