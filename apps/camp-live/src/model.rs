use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use stream_registry::StreamKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Microphone,
    Camera,
    Screen,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Microphone => "microphone",
            Capability::Camera => "camera",
            Capability::Screen => "screen",
        })
    }
}

/// Which capture sources are live, as reported in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFlags {
    pub mic_on: bool,
    pub cam_on: bool,
    pub screen_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_target: Option<String>,
}

impl CaptureFlags {
    pub fn get(&self, capability: Capability) -> bool {
        match capability {
            Capability::Microphone => self.mic_on,
            Capability::Camera => self.cam_on,
            Capability::Screen => self.screen_on,
        }
    }

    pub fn set(&mut self, capability: Capability, on: bool) {
        match capability {
            Capability::Microphone => self.mic_on = on,
            Capability::Camera => self.cam_on = on,
            Capability::Screen => self.screen_on = on,
        }
    }
}

/// Who the local participant is. Passed to the controller explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub peer_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            token: None,
        }
    }

    /// Random peer id for participants without a stable account id.
    pub fn ephemeral() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginConfig {
    pub camp_id: String,
    pub title: String,
    pub kind: StreamKind,
    pub capture: CaptureFlags,
    pub track: Option<String>,
}

/// Joining a session somebody else registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendConfig {
    pub camp_id: String,
    pub session_id: String,
    pub kind: StreamKind,
    pub capture: CaptureFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Open,
    Closed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub session_id: String,
    /// `None` when attending a session whose owner we do not know.
    pub owner_id: Option<String>,
    pub scope_id: String,
    pub kind: StreamKind,
    pub state: SessionState,
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Owner,
    Attendee,
}

/// Returned by `begin`/`attend`: the session and how it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session: StreamSession,
    pub role: SessionRole,
    pub title: Option<String>,
    pub capture: CaptureFlags,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn is_owned(&self) -> bool {
        self.role == SessionRole::Owner
    }
}
