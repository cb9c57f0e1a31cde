//! Audio side of the answering machine
//!
//! Playback and recording are delegated to external programs (`aplay`,
//! `arecord`); this module starts them in background tasks, selects the
//! greeting and takes care of recording files.

pub mod greeting;
mod process;
pub mod recording;

pub use greeting::{select_greeting, Greeting};
pub use process::{
    play_to_completion, AudioCommand, Completion, ExitOutcome, ProcessHandle, StopReason,
    TaskKind,
};
pub use recording::RecordingSession;
