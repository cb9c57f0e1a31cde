//! State machine module for call handling
//!
//! Provides an explicit state machine with four states:
//! - Waiting: handset on hook, idle
//! - Playing: greeting and beep playing after the handset is lifted
//! - Recording: caller's message being recorded
//! - PhoneStuck: recording limit hit while the handset stayed lifted

mod machine;

pub use machine::{State, StateMachine};
