//! Hook switch input
//!
//! Reads the handset switch from a sysfs GPIO pin, debounces it and hands
//! level changes to the state machine.

mod gpio;
mod line;
mod listener;

pub use line::{HookEvent, HookLine};
pub use listener::{HookError, HookListener};
