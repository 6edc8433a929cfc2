//! Ownership of a running capture process

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::recording::SessionId;
use crate::{Result, TapedeckError};

use super::{CaptureCommand, LogTail};

/// How a terminated process went away
#[derive(Debug, Clone, Copy)]
pub struct Termination {
    /// Exit status, `None` if the process could not be reaped in time
    pub status: Option<ExitStatus>,
    /// Whether SIGKILL was needed
    pub forced: bool,
}

/// A spawned capture process, exclusively owned by its session
///
/// Dropping it kills the process.
pub struct CaptureProcess {
    session: SessionId,
    child: Child,
    pid: Option<u32>,
    _stderr_task: Option<JoinHandle<()>>,
}

impl CaptureProcess {
    /// Spawn `command`, forwarding its stderr into `logs`
    ///
    /// # Errors
    ///
    /// Returns `LaunchFailure` if the program cannot be executed
    pub fn spawn(command: &CaptureCommand, logs: Arc<LogTail>, session: SessionId) -> Result<Self> {
        debug!("Session {} spawning: {}", session, command.display());

        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TapedeckError::LaunchFailure(format!("{}: {e}", command.program().display()))
            })?;

        let pid = child.id();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, logs, session)));

        Ok(Self {
            session,
            child,
            pid,
            _stderr_task: stderr_task,
        })
    }

    /// OS process id at spawn time
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check; reaps the process if it has exited
    ///
    /// # Errors
    ///
    /// Returns error if the OS wait call fails
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Ask the process to finish its output and exit (SIGINT)
    ///
    /// # Errors
    ///
    /// Returns error if the signal cannot be delivered
    #[cfg(unix)]
    pub fn interrupt(&mut self) -> Result<()> {
        // `id()` is None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| TapedeckError::Other(format!("pid out of range: {pid}")))?;

        // SAFETY: the child is not reaped yet, so the pid still names it
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err.into())
        }
    }

    /// Ask the process to exit; without POSIX signals this is a kill
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be killed
    #[cfg(not(unix))]
    pub fn interrupt(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Stop the process: SIGINT, wait `grace`, then SIGKILL and wait
    /// `kill_timeout`
    ///
    /// Always consumes the process. A process that survives SIGKILL past
    /// `kill_timeout` is left to the runtime to reap and reported with no
    /// status.
    ///
    /// # Errors
    ///
    /// Returns error if the OS refuses a signal or wait call
    pub async fn terminate(mut self, grace: Duration, kill_timeout: Duration) -> Result<Termination> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Termination {
                status: Some(status),
                forced: false,
            });
        }

        self.interrupt()?;

        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return Ok(Termination {
                status: Some(status?),
                forced: false,
            });
        }

        warn!(
            "Session {} did not exit within {:?} of SIGINT, sending SIGKILL",
            self.session, grace
        );

        match self.child.start_kill() {
            // Exited between the timeout and the kill
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        match tokio::time::timeout(kill_timeout, self.child.wait()).await {
            Ok(status) => Ok(Termination {
                status: Some(status?),
                forced: true,
            }),
            Err(_) => {
                error!(
                    "Session {} pid {:?} still running {:?} after SIGKILL",
                    self.session, self.pid, kill_timeout
                );
                Ok(Termination {
                    status: None,
                    forced: true,
                })
            }
        }
    }
}

impl std::fmt::Debug for CaptureProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureProcess")
            .field("session", &self.session)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Split stderr on `\n` and `\r` (ffmpeg redraws its progress line with `\r`)
async fn forward_stderr<R>(stderr: R, logs: Arc<LogTail>, session: SessionId)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stderr).split(b'\n');

    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                for part in segment.split(|b| *b == b'\r') {
                    let line = String::from_utf8_lossy(part);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(session = %session, "ffmpeg: {}", line);
                    logs.push(line.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Session {} stderr read failed: {}", session, e);
                break;
            }
        }
    }

    logs.close();
}

/// Human-readable exit description
#[must_use]
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }

    "unknown exit status".to_string()
}
