//! Error types for Tapedeck

use std::io;
use thiserror::Error;

use crate::recording::{SessionId, SessionState};

/// Result type for Tapedeck operations
pub type Result<T> = std::result::Result<T, TapedeckError>;

/// Errors that can occur in Tapedeck
#[derive(Debug, Error)]
pub enum TapedeckError {
    /// The capture input is claimed by another live session
    #[error("Device {device} is in use by session {session}")]
    DeviceBusy {
        /// Input that is already claimed
        device: String,
        /// Session holding the claim
        session: SessionId,
    },

    /// The output file is being written by another live session
    #[error("Output {path} is in use by session {session}")]
    OutputInUse {
        /// Output path that is already claimed
        path: String,
        /// Session holding the claim
        session: SessionId,
    },

    /// The live session limit is reached
    #[error("Session limit reached: {limit}")]
    TooManySessions {
        /// Configured limit
        limit: usize,
    },

    /// Unknown session id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Recording file not found
    #[error("Recording file not found: {0}")]
    FileNotFound(String),

    /// Operation not valid for the session's current state
    #[error("Session {id} is {state}, expected {expected}")]
    InvalidState {
        /// Session the operation targeted
        id: SessionId,
        /// State the session was in
        state: SessionState,
        /// What the operation required
        expected: &'static str,
    },

    /// The capture process could not be started
    #[error("Failed to launch capture: {0}")]
    LaunchFailure(String),

    /// The capture device is unreachable or failed while recording
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Capture options failed validation
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request body too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl TapedeckError {
    /// Stable, machine-readable error kind reported to API clients
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceBusy { .. } => "DeviceBusy",
            Self::OutputInUse { .. } => "OutputInUse",
            Self::TooManySessions { .. } => "TooManySessions",
            Self::NotFound(_) => "NotFound",
            Self::FileNotFound(_) => "FileNotFound",
            Self::InvalidState { .. } => "InvalidState",
            Self::LaunchFailure(_) => "LaunchFailure",
            Self::DeviceError(_) => "DeviceError",
            Self::InvalidOptions(_) => "InvalidOptions",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::DataTooLarge { .. } => "DataTooLarge",
            Self::ConfigError(_) => "ConfigError",
            Self::Io(_) => "Io",
            Self::Other(_) => "Other",
        }
    }
}
