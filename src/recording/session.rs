//! Recording session model and its state machine

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::CaptureSettings;
use crate::{Result, TapedeckError};

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for generated file names
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TapedeckError::NotFound(s.to_string()))
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, process launching
    Starting,
    /// Process confirmed alive
    Running,
    /// Stop requested, waiting for the process to exit
    Stopping,
    /// Ended by request or by reaching its duration limit
    Stopped,
    /// Failed to launch or exited unexpectedly
    Failed,
}

impl SessionState {
    /// Whether the session still holds its device claim
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether the session reached a terminal state
    #[must_use]
    pub fn is_finished(self) -> bool {
        !self.is_live()
    }

    fn can_become(self, next: Self) -> bool {
        use SessionState::{Failed, Running, Starting, Stopped, Stopping};

        matches!(
            (self, next),
            (Starting, Running | Failed)
                | (Running, Stopping | Stopped | Failed)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    /// Error kind, e.g. `DeviceError`
    pub kind: String,
    /// Human-readable detail
    pub message: String,
}

/// Snapshot of one recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Device descriptor as supplied by the caller
    pub device_spec: String,
    /// File the capture writes to
    pub output_path: PathBuf,
    /// Resolved capture settings
    pub options: CaptureSettings,
    /// Current state
    pub state: SessionState,
    /// Capture process id while one exists
    pub pid: Option<u32>,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// When the process was confirmed alive
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Process exit code, if it exited normally
    pub exit_code: Option<i32>,
    /// Failure detail for `failed` sessions
    pub error: Option<SessionFailure>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        device_spec: String,
        output_path: PathBuf,
        options: CaptureSettings,
    ) -> Self {
        Self {
            id,
            device_spec,
            output_path,
            options,
            state: SessionState::Starting,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Move to `next`, stamping timestamps on the way
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transition the lifecycle does not allow
    pub(crate) fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(TapedeckError::InvalidState {
                id: self.id,
                state: self.state,
                expected: "a state that can transition",
            });
        }

        self.state = next;
        match next {
            SessionState::Running => self.started_at = Some(Utc::now()),
            SessionState::Stopped | SessionState::Failed => {
                self.ended_at = Some(Utc::now());
                self.pid = None;
            }
            SessionState::Starting | SessionState::Stopping => {}
        }
        Ok(())
    }

    /// Enter a terminal state with the process outcome
    pub(crate) fn finish(
        &mut self,
        next: SessionState,
        exit_code: Option<i32>,
        error: Option<SessionFailure>,
    ) -> Result<()> {
        self.transition(next)?;
        self.exit_code = exit_code;
        self.error = error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new(),
            "cam0".to_string(),
            PathBuf::from("/tmp/out.mp4"),
            CaptureSettings::default(),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        assert_eq!(s.state, SessionState::Starting);
        assert!(s.started_at.is_none());

        s.transition(SessionState::Running).unwrap();
        assert!(s.started_at.is_some());

        s.transition(SessionState::Stopping).unwrap();
        s.finish(SessionState::Stopped, Some(0), None).unwrap();
        assert!(s.ended_at.is_some());
        assert_eq!(s.exit_code, Some(0));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = session();
        s.transition(SessionState::Running).unwrap();
        s.finish(
            SessionState::Failed,
            Some(1),
            Some(SessionFailure {
                kind: "DeviceError".to_string(),
                message: "gone".to_string(),
            }),
        )
        .unwrap();

        for next in [
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Stopped,
            SessionState::Failed,
        ] {
            let err = s.clone().transition(next).unwrap_err();
            assert_eq!(err.kind(), "InvalidState");
        }
    }

    #[test]
    fn test_cannot_stop_while_starting() {
        let mut s = session();
        assert!(s.transition(SessionState::Stopping).is_err());
        assert_eq!(s.state, SessionState::Starting);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
        assert!(SessionState::Stopping.is_live());
        assert!(SessionState::Failed.is_finished());
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!(id.short().len(), 8);
        assert_eq!("nope".parse::<SessionId>().unwrap_err().kind(), "NotFound");
    }
}
