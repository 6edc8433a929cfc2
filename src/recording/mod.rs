//! Recording sessions: registry, lifecycle and reconciliation

mod manager;
mod reconciler;
mod session;

pub use manager::SessionManager;
pub use reconciler::spawn_reconciler;
pub use session::{Session, SessionFailure, SessionId, SessionState};

/// Stderr lines quoted in launch and exit failure messages
pub const LOG_EXCERPT_LINES: usize = 5;
