//! Session registry and lifecycle of capture processes

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::capture::{
    describe_exit, resolve_device, CaptureCommand, CaptureOptions, CaptureProcess, LogTail,
};
use crate::config::Config;
use crate::{Result, TapedeckError};

use super::session::{Session, SessionFailure, SessionId, SessionState};
use super::LOG_EXCERPT_LINES;

/// Claim key prefix for output files
const OUTPUT_CLAIM_PREFIX: &str = "file:";

/// One registry slot
struct Entry {
    session: Session,
    process: Option<CaptureProcess>,
    claims: Vec<String>,
    logs: Arc<LogTail>,
}

/// Everything guarded by the registry lock
#[derive(Default)]
struct Registry {
    entries: HashMap<SessionId, Entry>,
    order: Vec<SessionId>,
    claims: HashMap<String, SessionId>,
    closed: bool,
}

impl Registry {
    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.session.state.is_live())
            .count()
    }

    fn release_claims(&mut self, id: SessionId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        for key in std::mem::take(&mut entry.claims) {
            if self.claims.get(&key) == Some(&id) {
                self.claims.remove(&key);
            }
        }
    }

    fn remove(&mut self, id: SessionId) -> Option<Entry> {
        self.release_claims(id);
        self.order.retain(|other| *other != id);
        self.entries.remove(&id)
    }

    /// Fold an unobserved process exit into the session state
    fn reconcile(&mut self, id: SessionId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        // Starting belongs to `start`, Stopping to `stop`
        if entry.session.state != SessionState::Running {
            return;
        }
        let Some(process) = entry.process.as_mut() else {
            return;
        };

        let status = match process.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                warn!("Session {} exit check failed: {}", id, e);
                return;
            }
        };

        entry.process = None;
        let (state, failure) = classify_exit(&entry.session, &status, &entry.logs);
        match state {
            SessionState::Stopped => info!("Session {} finished ({})", id, describe_exit(&status)),
            _ => warn!("Session {} exited unexpectedly ({})", id, describe_exit(&status)),
        }
        if let Err(e) = entry.session.finish(state, status.code(), failure) {
            error!("Session {} reconcile transition rejected: {}", id, e);
        }
        self.release_claims(id);
    }

    fn reconcile_all(&mut self) {
        let ids: Vec<_> = self.order.clone();
        for id in ids {
            self.reconcile(id);
        }
    }

    /// Drop finished sessions past their TTL, then the oldest beyond
    /// `max_finished`
    fn prune(&mut self, max_finished: usize, ttl: chrono::Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let finished: Vec<(SessionId, bool)> = self
            .order
            .iter()
            .filter_map(|id| {
                let session = &self.entries.get(id)?.session;
                if !session.state.is_finished() {
                    return None;
                }
                let expired = session.ended_at.is_some_and(|ended| now - ended > ttl);
                Some((*id, expired))
            })
            .collect();

        let mut doomed: Vec<SessionId> = finished
            .iter()
            .filter(|(_, expired)| *expired)
            .map(|(id, _)| *id)
            .collect();

        let kept = finished.len() - doomed.len();
        if kept > max_finished {
            doomed.extend(
                finished
                    .iter()
                    .filter(|(_, expired)| !*expired)
                    .take(kept - max_finished)
                    .map(|(id, _)| *id),
            );
        }

        for id in &doomed {
            self.remove(*id);
        }
        doomed
    }
}

/// Exit with status 0 under a declared duration limit is a normal end;
/// anything else means the device or encoder gave up
fn classify_exit(
    session: &Session,
    status: &ExitStatus,
    logs: &LogTail,
) -> (SessionState, Option<SessionFailure>) {
    if status.success() && session.options.duration_limit.is_some() {
        return (SessionState::Stopped, None);
    }

    let mut message = format!("capture exited unexpectedly ({})", describe_exit(status));
    let excerpt = logs.last_lines(LOG_EXCERPT_LINES);
    if !excerpt.is_empty() {
        message.push_str(": ");
        message.push_str(&excerpt);
    }

    (
        SessionState::Failed,
        Some(SessionFailure {
            kind: "DeviceError".to_string(),
            message,
        }),
    )
}

/// Owns every recording session and its capture process
pub struct SessionManager {
    config: Arc<Config>,
    registry: Mutex<Registry>,
    logs: DashMap<SessionId, Arc<LogTail>>,
}

impl SessionManager {
    /// Create a manager, creating the recordings directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the recordings directory cannot be created
    pub fn new(config: Arc<Config>) -> Result<Self> {
        std::fs::create_dir_all(&config.capture.recordings_dir)?;

        Ok(Self {
            config,
            registry: Mutex::new(Registry::default()),
            logs: DashMap::new(),
        })
    }

    /// Configuration the manager runs with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a capture of `device_spec` into `output_path`
    ///
    /// Without `output_path` a timestamped file in the recordings directory
    /// is used. Returns once the process survived the startup probe.
    ///
    /// # Errors
    ///
    /// - `InvalidOptions` / `InvalidRequest` for bad input
    /// - `DeviceError` if a video node is not present
    /// - `DeviceBusy` / `OutputInUse` if a live session holds the device or file
    /// - `TooManySessions` if the live session limit is reached
    /// - `LaunchFailure` if the output is not writable or the process does
    ///   not start and stay up
    pub async fn start(
        &self,
        device_spec: &str,
        output_path: Option<PathBuf>,
        options: &CaptureOptions,
    ) -> Result<Session> {
        let settings = options.resolve(&self.config.defaults, &self.config.capture)?;
        let device = resolve_device(device_spec, &self.config.devices)?.canonicalize()?;

        let id = SessionId::new();
        let output_path = output_path.unwrap_or_else(|| self.generated_output(id, &settings.container));
        let command = CaptureCommand::build(&self.config.capture.ffmpeg_path, &device, &settings, &output_path);

        let mut claims: Vec<String> = device.inputs().map(|input| input.claim_key()).collect();
        claims.push(output_claim_key(&output_path).await);

        let logs = Arc::new(LogTail::new(self.config.capture.log_lines));

        // Claim check and registration under one lock
        {
            let mut registry = self.registry.lock().await;
            if registry.closed {
                return Err(TapedeckError::LaunchFailure(
                    "session manager is shutting down".to_string(),
                ));
            }

            let limit = self.config.capture.max_sessions;
            if registry.live_count() >= limit {
                return Err(TapedeckError::TooManySessions { limit });
            }

            for key in &claims {
                if let Some(holder) = registry.claims.get(key) {
                    let session = *holder;
                    return Err(match key.strip_prefix(OUTPUT_CLAIM_PREFIX) {
                        Some(path) => TapedeckError::OutputInUse {
                            path: path.to_string(),
                            session,
                        },
                        None => TapedeckError::DeviceBusy {
                            device: key.clone(),
                            session,
                        },
                    });
                }
            }

            for key in &claims {
                registry.claims.insert(key.clone(), id);
            }
            let session = Session::new(id, device_spec.to_string(), output_path.clone(), settings);
            registry.entries.insert(
                id,
                Entry {
                    session,
                    process: None,
                    claims,
                    logs: Arc::clone(&logs),
                },
            );
            registry.order.push(id);
        }
        self.logs.insert(id, Arc::clone(&logs));

        info!("Session {} starting: {} -> {}", id, device_spec, output_path.display());

        if let Err(e) = prepare_output(&output_path).await {
            self.abandon(id, false).await;
            return Err(e);
        }

        let process = match CaptureProcess::spawn(&command, Arc::clone(&logs), id) {
            Ok(process) => process,
            Err(e) => {
                self.abandon(id, true).await;
                return Err(e);
            }
        };
        let pid = process.pid();

        {
            let mut registry = self.registry.lock().await;
            // A shutdown that began during spawn never saw this process;
            // leaving it out makes the probe below fail, and dropping kills it
            if !registry.closed {
                if let Some(entry) = registry.entries.get_mut(&id) {
                    entry.process = Some(process);
                    entry.session.pid = pid;
                }
            }
        }

        tokio::time::sleep(self.config.capture.startup_probe()).await;

        let mut registry = self.registry.lock().await;
        let Some(entry) = registry.entries.get_mut(&id) else {
            return Err(TapedeckError::LaunchFailure(
                "session removed during startup".to_string(),
            ));
        };

        let probe = match entry.process.as_mut() {
            Some(process) => process.try_wait(),
            None => Err(TapedeckError::LaunchFailure(
                "session manager shut down during startup".to_string(),
            )),
        };

        let failure = match probe {
            Ok(None) => None,
            Ok(Some(status)) => {
                let excerpt = logs.last_lines(LOG_EXCERPT_LINES);
                Some(TapedeckError::LaunchFailure(if excerpt.is_empty() {
                    format!("capture exited during startup ({})", describe_exit(&status))
                } else {
                    format!("capture exited during startup ({}): {excerpt}", describe_exit(&status))
                }))
            }
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            registry.remove(id);
            drop(registry);
            self.logs.remove(&id);
            discard_empty_output(&output_path).await;
            warn!("Session {} failed to launch: {}", id, e);
            return Err(e);
        }

        entry.session.transition(SessionState::Running)?;
        info!("Session {} running (pid {:?})", id, pid);
        Ok(entry.session.clone())
    }

    /// Stop a running session: SIGINT, grace period, then SIGKILL
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `InvalidState` unless the session is running
    pub async fn stop(&self, id: SessionId) -> Result<Session> {
        let process = {
            let mut registry = self.registry.lock().await;
            registry.reconcile(id);

            let entry = registry
                .entries
                .get_mut(&id)
                .ok_or_else(|| TapedeckError::NotFound(id.to_string()))?;

            if entry.session.state != SessionState::Running {
                return Err(TapedeckError::InvalidState {
                    id,
                    state: entry.session.state,
                    expected: "running",
                });
            }

            entry.session.transition(SessionState::Stopping)?;
            entry.process.take()
        };

        info!("Session {} stopping", id);

        let capture = &self.config.capture;
        let exit_code = match process {
            Some(process) => match process.terminate(capture.stop_grace(), capture.kill_timeout()).await {
                Ok(termination) => {
                    if termination.forced {
                        warn!("Session {} required SIGKILL", id);
                    }
                    termination.status.and_then(|status| status.code())
                }
                Err(e) => {
                    // The process was dropped inside terminate, which kills it
                    error!("Session {} terminate failed: {}", id, e);
                    None
                }
            },
            None => None,
        };

        let mut registry = self.registry.lock().await;
        let entry = registry
            .entries
            .get_mut(&id)
            .ok_or_else(|| TapedeckError::NotFound(id.to_string()))?;
        entry.session.finish(SessionState::Stopped, exit_code, None)?;
        let session = entry.session.clone();
        registry.release_claims(id);

        info!("Session {} stopped", id);
        Ok(session)
    }

    /// Current state of one session, reconciled with its process
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub async fn status(&self, id: SessionId) -> Result<Session> {
        let mut registry = self.registry.lock().await;
        registry.reconcile(id);
        registry
            .entries
            .get(&id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| TapedeckError::NotFound(id.to_string()))
    }

    /// All sessions in creation order, reconciled
    pub async fn list(&self) -> Vec<Session> {
        let mut registry = self.registry.lock().await;
        registry.reconcile_all();
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Forget a finished session
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `InvalidState` if the session is still live
    pub async fn remove(&self, id: SessionId) -> Result<Session> {
        let mut registry = self.registry.lock().await;
        registry.reconcile(id);

        let state = registry
            .entries
            .get(&id)
            .map(|entry| entry.session.state)
            .ok_or_else(|| TapedeckError::NotFound(id.to_string()))?;

        if state.is_live() {
            return Err(TapedeckError::InvalidState {
                id,
                state,
                expected: "stopped or failed",
            });
        }

        let entry = registry
            .remove(id)
            .ok_or_else(|| TapedeckError::NotFound(id.to_string()))?;
        drop(registry);
        self.logs.remove(&id);

        debug!("Session {} removed", id);
        Ok(entry.session)
    }

    /// Stderr tail of a session, without touching the registry lock
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub fn logs(&self, id: SessionId) -> Result<Arc<LogTail>> {
        self.logs
            .get(&id)
            .map(|tail| Arc::clone(tail.value()))
            .ok_or_else(|| TapedeckError::NotFound(id.to_string()))
    }

    /// Number of sessions still holding a device
    pub async fn live_count(&self) -> usize {
        self.registry.lock().await.live_count()
    }

    /// Whether a live session is writing `path`
    pub async fn is_output_claimed(&self, path: &Path) -> Option<SessionId> {
        let key = output_claim_key(path).await;
        let registry = self.registry.lock().await;
        registry.claims.get(&key).copied()
    }

    /// Periodic pass: reconcile every running session, then apply retention
    pub async fn reconcile(&self) {
        let retention = &self.config.retention;
        let ttl = chrono::Duration::from_std(retention.finished_ttl())
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

        let pruned = {
            let mut registry = self.registry.lock().await;
            registry.reconcile_all();
            registry.prune(retention.max_finished, ttl)
        };

        for id in &pruned {
            self.logs.remove(id);
        }
        if !pruned.is_empty() {
            debug!("Retention dropped {} finished sessions", pruned.len());
        }
    }

    /// Stop every live session and refuse new ones
    pub async fn shutdown(&self) {
        let running: Vec<(SessionId, CaptureProcess)> = {
            let mut registry = self.registry.lock().await;
            registry.closed = true;
            registry.reconcile_all();

            let mut running = Vec::new();
            for (id, entry) in &mut registry.entries {
                match entry.session.state {
                    SessionState::Running => {
                        if let Some(process) = entry.process.take() {
                            if entry.session.transition(SessionState::Stopping).is_ok() {
                                running.push((*id, process));
                            }
                        }
                    }
                    // `start` notices the missing process and deregisters;
                    // dropping the process kills it
                    SessionState::Starting => drop(entry.process.take()),
                    _ => {}
                }
            }
            running
        };

        if running.is_empty() {
            return;
        }
        info!("Stopping {} live sessions", running.len());

        let capture = &self.config.capture;
        let (grace, kill_timeout) = (capture.stop_grace(), capture.kill_timeout());
        let stops = running.into_iter().map(|(id, process)| async move {
            let code = match process.terminate(grace, kill_timeout).await {
                Ok(termination) => termination.status.and_then(|status| status.code()),
                Err(e) => {
                    error!("Session {} terminate failed: {}", id, e);
                    None
                }
            };
            (id, code)
        });
        let outcomes = futures_util::future::join_all(stops).await;

        let mut registry = self.registry.lock().await;
        for (id, code) in outcomes {
            if let Some(entry) = registry.entries.get_mut(&id) {
                if let Err(e) = entry.session.finish(SessionState::Stopped, code, None) {
                    error!("Session {} shutdown transition rejected: {}", id, e);
                }
            }
            registry.release_claims(id);
        }
        info!("All sessions stopped");
    }

    /// Deregister a session whose launch failed before it had a process
    async fn abandon(&self, id: SessionId, discard_output: bool) {
        let entry = self.registry.lock().await.remove(id);
        self.logs.remove(&id);
        if discard_output {
            if let Some(entry) = entry {
                discard_empty_output(&entry.session.output_path).await;
            }
        }
    }

    fn generated_output(&self, id: SessionId, container: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        self.config
            .capture
            .recordings_dir
            .join(format!("output-{stamp}-{}.{container}", id.short()))
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("recordings_dir", &self.config.capture.recordings_dir)
            .finish_non_exhaustive()
    }
}

/// Claim key for an output file, identical for every spelling of one path
///
/// An existing file resolves through symlinks. A file not created yet is
/// keyed by its canonical parent directory plus its name.
async fn output_claim_key(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let normalized = match tokio::fs::canonicalize(&absolute).await {
        Ok(canonical) => canonical,
        Err(_) => match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => match tokio::fs::canonicalize(parent).await {
                Ok(parent) => parent.join(name),
                Err(_) => absolute,
            },
            _ => absolute,
        },
    };
    format!("{OUTPUT_CLAIM_PREFIX}{}", normalized.display())
}

/// Create (or truncate) the output so an unwritable path fails before spawn
async fn prepare_output(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(TapedeckError::LaunchFailure(format!(
            "Output path is a directory: {}",
            path.display()
        )));
    }

    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map(|_| ())
        .map_err(|e| {
            TapedeckError::LaunchFailure(format!("Output not writable: {}: {e}", path.display()))
        })
}

/// Remove an output left empty by a failed launch
async fn discard_empty_output(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.is_file() && meta.len() == 0 {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}
