//! Signal handling and the maintenance loop
//!
//! SIGINT stops the daemon and re-raises SIGTERM against the agent's
//! process group. SIGTERM waits for the daemon to go away and exits with
//! [`SIGNAL_EXIT_CODE`]. SIGHUP reopens the agent log. The maintenance loop
//! applies staged updates and respawns a dead daemon once per heartbeat.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use dh_core::pidfile;

use crate::distributor::{BinaryDistributor, UpdateOutcome, UpdatePaths};
use crate::logging::LogFile;
use crate::state::{DaemonHandle, TerminationState};
use crate::supervisor::Supervisor;

/// Exit status after a signal-induced shutdown
pub const SIGNAL_EXIT_CODE: i32 = 130;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What an interrupt should do given the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// No daemon to stop
    ExitNow,
    /// Stop the daemon and hand over to the termination path
    StopDaemon,
    /// A shutdown is already running; kill the daemon and leave
    Force,
}

pub fn decide_interrupt(daemon_running: bool, termination: &TerminationState) -> InterruptAction {
    if termination.is_shutdown_requested() {
        InterruptAction::Force
    } else if daemon_running {
        InterruptAction::StopDaemon
    } else {
        InterruptAction::ExitNow
    }
}

/// Poll until the daemon handle is empty
pub async fn wait_for_daemon_exit(handle: &DaemonHandle, poll: Duration) {
    while handle.is_running() {
        tokio::time::sleep(poll).await;
    }
}

/// Owns the process-wide reaction to signals
pub struct Coordinator {
    supervisor: Supervisor,
    termination: Arc<TerminationState>,
    pid_file: PathBuf,
    log_file: Option<LogFile>,
}

impl Coordinator {
    pub fn new(
        supervisor: Supervisor,
        termination: Arc<TerminationState>,
        pid_file: impl Into<PathBuf>,
        log_file: Option<LogFile>,
    ) -> Self {
        Self {
            supervisor,
            termination,
            pid_file: pid_file.into(),
            log_file,
        }
    }

    /// Register the signal streams and start handling them
    ///
    /// From here on SIGINT, SIGTERM and SIGHUP no longer kill the process
    /// directly.
    pub fn install(self) -> io::Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        Ok(tokio::spawn(async move {
            let mut exit_waiter: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    Some(()) = interrupt.recv() => self.on_interrupt(),
                    Some(()) = terminate.recv() => {
                        tracing::info!("Got signal: terminated");
                        self.on_terminate();
                        if exit_waiter.is_none() {
                            exit_waiter = Some(self.spawn_exit_waiter());
                        }
                    }
                    Some(()) = hangup.recv() => self.on_hangup(),
                    else => break,
                }
            }
        }))
    }

    fn on_interrupt(&self) {
        tracing::info!("Got signal: interrupt");
        let handle = self.supervisor.handle();
        match decide_interrupt(handle.is_running(), &self.termination) {
            InterruptAction::ExitNow => {
                tracing::info!("Docker daemon is not running");
                self.exit(SIGNAL_EXIT_CODE);
            }
            InterruptAction::StopDaemon => {
                tracing::info!("Starting to shut down docker daemon gracefully");
                self.termination.request_shutdown();
                if let Some(Err(e)) = handle.signal(libc::SIGTERM) {
                    tracing::warn!("Cannot signal docker daemon: {}", e);
                }
                if let Err(e) = terminate_process_group() {
                    tracing::error!("Cannot signal process group: {}", e);
                    self.on_terminate();
                }
            }
            InterruptAction::Force => {
                tracing::warn!("Second interrupt, killing docker daemon");
                self.termination.force();
                self.supervisor.kill();
                self.exit(SIGNAL_EXIT_CODE);
            }
        }
    }

    fn on_terminate(&self) {
        if self.termination.request_shutdown() {
            if let Some(Err(e)) = self.supervisor.handle().signal(libc::SIGTERM) {
                tracing::warn!("Cannot signal docker daemon: {}", e);
            }
        }
    }

    fn spawn_exit_waiter(&self) -> JoinHandle<()> {
        let handle = self.supervisor.handle().clone();
        let pid_file = self.pid_file.clone();
        tokio::spawn(async move {
            wait_for_daemon_exit(&handle, EXIT_POLL_INTERVAL).await;
            exit_process(&pid_file, SIGNAL_EXIT_CODE);
        })
    }

    fn on_hangup(&self) {
        let Some(log) = &self.log_file else {
            return;
        };
        match log.reopen() {
            Ok(()) => tracing::info!("Reopened {:?}", log.path()),
            Err(e) => tracing::warn!("Cannot reopen {:?}: {}", log.path(), e),
        }
    }

    fn exit(&self, code: i32) {
        exit_process(&self.pid_file, code);
    }
}

fn terminate_process_group() -> io::Result<()> {
    let result = unsafe { libc::killpg(libc::getpgrp(), libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Remove the PID file and exit
pub fn exit_process(pid_file: &std::path::Path, code: i32) -> ! {
    if let Err(e) = pidfile::remove_pid_file(pid_file) {
        tracing::warn!("Cannot remove {:?}: {}", pid_file, e);
    }
    tracing::info!("Exiting agent");
    std::process::exit(code)
}

/// Periodic update check followed by the respawn check
pub struct Maintenance {
    distributor: BinaryDistributor,
    supervisor: Supervisor,
    termination: Arc<TerminationState>,
    update_paths: UpdatePaths,
    heartbeat: Duration,
    stop_deadline: Duration,
}

impl Maintenance {
    pub fn new(
        distributor: BinaryDistributor,
        supervisor: Supervisor,
        termination: Arc<TerminationState>,
        update_paths: UpdatePaths,
        heartbeat: Duration,
        stop_deadline: Duration,
    ) -> Self {
        Self {
            distributor,
            supervisor,
            termination,
            update_paths,
            heartbeat,
            stop_deadline,
        }
    }

    /// One maintenance pass
    ///
    /// The update check runs first so a swap in progress finishes before
    /// liveness is judged.
    pub async fn tick(&self) -> UpdateOutcome {
        if self.termination.is_shutdown_requested() {
            return UpdateOutcome::NoUpdate;
        }

        let outcome = self
            .distributor
            .check_for_update(&self.update_paths, &self.supervisor, self.stop_deadline)
            .await;

        if let Err(e) = self.supervisor.respawn_if_dead(self.heartbeat).await {
            tracing::error!("Cannot respawn docker daemon: {}", e);
        }
        outcome
    }

    /// Run forever, one pass per heartbeat
    pub async fn run(self) {
        tracing::info!("Entering maintenance loop");
        loop {
            tokio::time::sleep(self.heartbeat).await;
            self.tick().await;
        }
    }
}
