//! Greeting selection

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Zero-based call counter value of the fiftieth caller
pub const FIFTIETH_CALLER: u32 = 49;

/// Uptime after which the evening greeting is used
pub const EVENING_AFTER: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Greeting {
    Intro,
    Evening,
    CallerFifty,
}

impl Greeting {
    pub fn file_name(self) -> &'static str {
        match self {
            Greeting::Intro => "intro.wav",
            Greeting::Evening => "evening.wav",
            Greeting::CallerFifty => "caller_fifty.wav",
        }
    }
}

impl fmt::Display for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Greeting::Intro => write!(f, "intro"),
            Greeting::Evening => write!(f, "evening"),
            Greeting::CallerFifty => write!(f, "caller-fifty"),
        }
    }
}

/// Pick the greeting for the next caller
///
/// `message_count` is the number of callers that already reached the
/// recording stage. The fiftieth-caller greeting wins over the evening one.
pub fn select_greeting(message_count: u32, since_boot: Duration) -> Greeting {
    if message_count == FIFTIETH_CALLER {
        Greeting::CallerFifty
    } else if since_boot > EVENING_AFTER {
        Greeting::Evening
    } else {
        Greeting::Intro
    }
}
