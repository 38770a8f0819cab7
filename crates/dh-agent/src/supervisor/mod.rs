//! Supervision of the container-engine daemon
//!
//! The supervisor starts the daemon with its output appended to a log file,
//! records it in the shared [`DaemonHandle`], and clears the handle when
//! the process exits. Exits that happen outside a planned stop are
//! reported to telemetry together with the tail of the daemon log.

mod command;
mod priority;

pub use command::{DaemonCommand, ProcessSpec, DOCKER_DEFAULT_HOST};
pub use priority::{descendants_of, set_own_priority, spawn_priority_guard, AGENT_PRIORITY};

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::state::{DaemonHandle, SupervisedProcess, TerminationState};
use crate::telemetry::TelemetrySink;

/// Errors raised when the daemon cannot be started
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("daemon is already running with PID {0}")]
    AlreadyRunning(u32),

    #[error("cannot open daemon log {path:?}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} exited before reporting a PID")]
    NoPid(PathBuf),
}

/// Keeps respawn suppressed while alive
///
/// Dropping the guard ends the planned stop.
#[must_use = "the planned stop ends when the guard is dropped"]
pub struct PlannedStop {
    counter: Arc<AtomicUsize>,
}

impl Drop for PlannedStop {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owner of the daemon process lifecycle
#[derive(Clone)]
pub struct Supervisor {
    spec: ProcessSpec,
    log_path: PathBuf,
    handle: DaemonHandle,
    termination: Arc<TerminationState>,
    planned: Arc<AtomicUsize>,
    telemetry: TelemetrySink,
    stop_poll_interval: Duration,
    crash_log_lines: usize,
}

impl Supervisor {
    pub fn new(
        spec: ProcessSpec,
        log_path: impl Into<PathBuf>,
        handle: DaemonHandle,
        termination: Arc<TerminationState>,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            spec,
            log_path: log_path.into(),
            handle,
            termination,
            planned: Arc::new(AtomicUsize::new(0)),
            telemetry,
            stop_poll_interval: Duration::from_millis(500),
            crash_log_lines: 50,
        }
    }

    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    pub fn with_crash_log_lines(mut self, lines: usize) -> Self {
        self.crash_log_lines = lines;
        self
    }

    pub fn handle(&self) -> &DaemonHandle {
        &self.handle
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Launch the daemon and watch for its exit
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<SupervisedProcess, SupervisorError> {
        if let Some(current) = self.handle.get() {
            return Err(SupervisorError::AlreadyRunning(current.pid));
        }

        tracing::info!("Set docker log to {:?}", self.log_path);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| SupervisorError::Log {
                path: self.log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| SupervisorError::Log {
            path: self.log_path.clone(),
            source,
        })?;

        tracing::info!("Starting docker daemon: {:?} {:?}", self.spec.program, self.spec.args);
        let mut child = tokio::process::Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.spec.program.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::NoPid(self.spec.program.clone()))?;
        let process = SupervisedProcess::new(pid);
        self.handle.set(process);

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = child.wait().await;
            supervisor.handle.clear_if(pid);

            let description = match &outcome {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            if supervisor.is_stop_planned() || supervisor.termination.is_shutdown_requested() {
                tracing::info!("Docker daemon (PID {}) stopped: {}", pid, description);
                return;
            }

            tracing::warn!("Docker daemon (PID {}) is terminated: {}", pid, description);
            let tail = read_last_lines(&supervisor.log_path, supervisor.crash_log_lines)
                .unwrap_or_else(|e| format!("cannot read {:?}: {}", supervisor.log_path, e));
            supervisor
                .telemetry
                .report("Docker daemon terminated unexpectedly", &description, Some(tail));
        });

        Ok(process)
    }

    /// Begin a planned stop; respawn stays suppressed until the guard drops
    pub fn planned_stop(&self) -> PlannedStop {
        self.planned.fetch_add(1, Ordering::SeqCst);
        PlannedStop {
            counter: self.planned.clone(),
        }
    }

    pub fn is_stop_planned(&self) -> bool {
        self.planned.load(Ordering::SeqCst) > 0
    }

    /// Send SIGTERM and wait until the handle clears or `deadline` passes
    ///
    /// Returns whether the daemon is down.
    pub async fn stop_gracefully(&self, deadline: Duration) -> bool {
        let Some(process) = self.handle.get() else {
            return true;
        };
        tracing::info!("Stopping docker daemon (PID {})", process.pid);
        if let Some(Err(e)) = self.handle.signal(libc::SIGTERM) {
            tracing::warn!("Cannot signal docker daemon: {}", e);
        }

        let stopped = self.wait_for_exit(deadline).await;
        if !stopped {
            tracing::warn!("Docker daemon did not stop within {:?}", deadline);
        }
        stopped
    }

    /// Poll until the handle clears or `deadline` passes
    pub async fn wait_for_exit(&self, deadline: Duration) -> bool {
        let started = tokio::time::Instant::now();
        while self.handle.is_running() {
            if started.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(self.stop_poll_interval).await;
        }
        true
    }

    /// Kill the daemon outright
    pub fn kill(&self) {
        if let Some(Err(e)) = self.handle.signal(libc::SIGKILL) {
            tracing::warn!("Cannot kill docker daemon: {}", e);
        }
    }

    /// Restart the daemon if it is down on two checks one heartbeat apart
    ///
    /// Skipped while a planned stop or shutdown is in progress. Returns
    /// whether a new process was started.
    pub async fn respawn_if_dead(&self, heartbeat: Duration) -> Result<bool, SupervisorError> {
        if self.handle.is_running() {
            return Ok(false);
        }
        tokio::time::sleep(heartbeat).await;
        if self.handle.is_running()
            || self.is_stop_planned()
            || self.termination.is_shutdown_requested()
        {
            return Ok(false);
        }

        tracing::info!("Respawning docker daemon");
        self.start()?;
        Ok(true)
    }
}

/// Last `n` lines of a text file, joined with newlines
pub fn read_last_lines(path: &Path, n: usize) -> io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut tail = std::collections::VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines() {
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line?);
    }
    Ok(tail.into_iter().collect::<Vec<_>>().join("\n"))
}
