//! Hook level shared between the listener and the state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Events sent from the hook listener to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// Debounced hook level changed; `hook_down` is `true` when on hook
    Changed { hook_down: bool },
    /// The pin can no longer be read
    LineLost,
}

/// Last debounced hook level
///
/// The listener updates it before sending the matching [`HookEvent`], so a
/// reader never sees a level older than the last event it processed.
#[derive(Debug, Clone)]
pub struct HookLine {
    on_hook: Arc<AtomicBool>,
}

impl HookLine {
    pub fn new(on_hook: bool) -> Self {
        Self {
            on_hook: Arc::new(AtomicBool::new(on_hook)),
        }
    }

    pub fn is_on_hook(&self) -> bool {
        self.on_hook.load(Ordering::SeqCst)
    }

    pub fn set(&self, on_hook: bool) {
        self.on_hook.store(on_hook, Ordering::SeqCst);
    }
}

/// Edge lock-out debouncer
///
/// After an accepted edge further changes are ignored for `window`. A level
/// that still differs once the window has passed is reported then, so the
/// final resting position of the switch is never lost.
#[derive(Debug)]
pub struct Debouncer {
    reported: bool,
    last_edge: Option<Instant>,
    window: Duration,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration) -> Self {
        Self {
            reported: initial,
            last_edge: None,
            window,
        }
    }

    /// Feed one raw sample; returns the new level when an edge is accepted
    pub fn sample(&mut self, raw: bool, now: Instant) -> Option<bool> {
        if raw == self.reported {
            return None;
        }
        if let Some(edge) = self.last_edge {
            if now.saturating_duration_since(edge) < self.window {
                return None;
            }
        }
        self.reported = raw;
        self.last_edge = Some(now);
        Some(raw)
    }
}
