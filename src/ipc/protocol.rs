//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::state::State;

/// Largest frame accepted from a client
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Requests from a status client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state change notifications
    Subscribe,
}

/// Responses from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StateEvent { event: StateEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current state of the call state machine
    pub state: State,

    /// Callers that left (or started) a message since boot
    pub calls_answered: u32,

    /// Uptime in seconds
    pub uptime_secs: u64,

    /// Whether a backup mount was found at startup
    pub backup_available: bool,

    /// Path of the most recent recording
    pub last_recording: Option<String>,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: State::default(),
            calls_answered: 0,
            uptime_secs: 0,
            backup_available: false,
            last_recording: None,
        }
    }
}

impl DaemonStatus {
    /// Fold a state machine event into the snapshot
    pub fn apply(&mut self, event: &StateEvent) {
        match event {
            StateEvent::StateChanged { to, .. } => self.state = *to,
            StateEvent::RecordingStarted { path, caller } => {
                self.calls_answered = *caller;
                self.last_recording = Some(path.clone());
            }
            StateEvent::GreetingStarted { .. }
            | StateEvent::GreetingInterrupted
            | StateEvent::RecordingFinished { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::GetStatus;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"get_status"}"#);

        let req: Request = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(matches!(req, Request::Subscribe));
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Status(DaemonStatus::default());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""state":"waiting""#));
    }

    #[test]
    fn test_status_follows_events() {
        let mut status = DaemonStatus::default();
        status.apply(&StateEvent::StateChanged {
            from: State::Waiting,
            to: State::Playing,
            duration_ms: 0,
        });
        status.apply(&StateEvent::RecordingStarted {
            path: "recordings/x_recording.wav".into(),
            caller: 3,
        });
        assert_eq!(status.state, State::Playing);
        assert_eq!(status.calls_answered, 3);
        assert_eq!(
            status.last_recording.as_deref(),
            Some("recordings/x_recording.wav")
        );
    }
}
